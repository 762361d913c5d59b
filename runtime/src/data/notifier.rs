//! Data-arrival notification bus.
//!
//! The transport layer deposits a message into a channel buffer and
//! then fires `notify(channel_id)`; every notifier registered for the
//! channel runs synchronously on the notifying thread. The scheduler
//! registers one notifier per subscribed routine whose callback flips
//! the routine's update flag and signals its group.
//!
//! Notifiers registered concurrently with a `notify` in flight have no
//! delivery guarantee for that notification.

use std::sync::Arc;

use hashbrown::HashMap;
use lazy_static::lazy_static;
use parking_lot::RwLock;

/// A single wake-up hook on a channel.
pub struct Notifier {
    pub callback: Box<dyn Fn() + Send + Sync>,
}

lazy_static! {
    static ref DATA_NOTIFIER: DataNotifier = DataNotifier::new();
}

/// Process-wide channel-id → notifier-list map.
pub struct DataNotifier {
    notifies_map: RwLock<HashMap<u64, Vec<Arc<Notifier>>>>,
}

/// The process-wide notifier instance.
pub fn instance() -> &'static DataNotifier {
    &DATA_NOTIFIER
}

impl DataNotifier {
    fn new() -> DataNotifier {
        DataNotifier {
            notifies_map: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_notifier(&self, channel_id: u64, notifier: Arc<Notifier>) {
        self.notifies_map
            .write()
            .entry(channel_id)
            .or_default()
            .push(notifier);
    }

    /// Invoke every notifier registered for `channel_id`. Returns false
    /// for channels nobody listens on.
    pub fn notify(&self, channel_id: u64) -> bool {
        let notifiers = {
            let map = self.notifies_map.read();
            match map.get(&channel_id) {
                Some(list) => list.clone(),
                None => return false,
            }
        };
        for notifier in &notifiers {
            (notifier.callback)();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notify_unknown_channel() {
        assert!(!instance().notify(u64::MAX));
    }

    #[test]
    fn test_notify_fans_out() {
        let hits = Arc::new(AtomicUsize::new(0));
        let channel = 0xABCD_0001;
        for _ in 0..3 {
            let hits = hits.clone();
            instance().add_notifier(
                channel,
                Arc::new(Notifier {
                    callback: Box::new(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }),
                }),
            );
        }
        assert!(instance().notify(channel));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(instance().notify(channel));
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }
}
