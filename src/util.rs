use anyhow::{anyhow, Result};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::Notify;

/// Single slot channel that only keeps the newest value.
///
/// Sending while an older value is still unconsumed replaces it and counts it as dropped.
pub fn latest_value_channel<T>() -> (LatestSender<T>, LatestReceiver<T>) {
    let value = Arc::new(Mutex::new(None));
    let notify = Arc::new(Notify::new());
    let both_alive = Arc::new(AtomicBool::new(true));
    let dropped = Arc::new(AtomicU64::new(0));

    let sender = LatestSender {
        value: Arc::clone(&value),
        notify: Arc::clone(&notify),
        both_alive: Arc::clone(&both_alive),
        dropped: Arc::clone(&dropped),
    };
    let receiver = LatestReceiver {
        value,
        notify,
        both_alive,
        dropped,
    };
    (sender, receiver)
}

pub struct LatestSender<T> {
    value: Arc<Mutex<Option<T>>>,
    notify: Arc<Notify>,
    both_alive: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl<T> LatestSender<T> {
    pub fn send(&self, value: T) -> Result<()> {
        if !self.both_alive.load(Ordering::SeqCst) {
            return Err(anyhow!("Other end died"));
        }
        let replaced = self
            .value
            .lock()
            .map_err(|_| anyhow!("Lock poisoned"))?
            .replace(value);
        if replaced.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for LatestSender<T> {
    fn drop(&mut self) {
        self.both_alive.store(false, Ordering::SeqCst);
        // stores a permit even if the receiver is not waiting yet
        self.notify.notify_one()
    }
}

pub struct LatestReceiver<T> {
    value: Arc<Mutex<Option<T>>>,
    notify: Arc<Notify>,
    both_alive: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl<T> LatestReceiver<T> {
    /// Wait for the next value. A value sent before the sender died is still delivered.
    pub async fn recv(&self) -> Result<T> {
        loop {
            if let Some(value) = self.try_recv()? {
                return Ok(value);
            }
            if !self.both_alive.load(Ordering::SeqCst) {
                return Err(anyhow!("Sender died"));
            }
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Result<Option<T>> {
        Ok(self
            .value
            .lock()
            .map_err(|_| anyhow!("Lock poisoned"))?
            .take())
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for LatestReceiver<T> {
    fn drop(&mut self) {
        self.both_alive.store(false, Ordering::SeqCst);
    }
}
