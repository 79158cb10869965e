use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::types::RunId;

/// Per-run watch of the latest committed sequence, used to wake tails.
#[derive(Debug, Default)]
pub struct AppendNotifier {
    heads: Mutex<HashMap<RunId, watch::Sender<u64>>>,
}

impl AppendNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, run_id: &RunId) -> watch::Receiver<u64> {
        let mut heads = match self.heads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        heads
            .entry(run_id.clone())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Publish a committed sequence. Called only after the append is durable.
    pub fn notify(&self, run_id: &RunId, sequence: u64) {
        let mut heads = match self.heads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sender = heads
            .entry(run_id.clone())
            .or_insert_with(|| watch::channel(0).0);
        sender.send_if_modified(|head| {
            if sequence > *head {
                *head = sequence;
                true
            } else {
                false
            }
        });
        if sender.receiver_count() == 0 {
            heads.remove(run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wakes_subscribers_on_newer_sequence() {
        let notifier = AppendNotifier::new();
        let run = RunId::from("r1");
        let mut rx = notifier.subscribe(&run);
        notifier.notify(&run, 3);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 3);

        notifier.notify(&run, 2);
        assert!(!rx.has_changed().unwrap());
    }
}
