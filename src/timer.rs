//! Single-shot event timers.

use futures::channel::mpsc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A single-shot timer that posts a message into an event queue when it
/// expires.
///
/// Re-arming cancels the previous shot; dropping the timer cancels it.
#[derive(Default)]
pub(crate) struct EventTimer {
    task: Option<JoinHandle<()>>,
}

impl EventTimer {
    pub fn new() -> Self {
        Self { task: None }
    }

    /// Arms the timer to send `msg` over `tx` after `delay`.
    pub fn start<M: Send + 'static>(&mut self, delay: Duration, tx: mpsc::UnboundedSender<M>, msg: M) {
        self.stop();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.unbounded_send(msg);
        }));
    }

    /// Cancels the pending shot, if any.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for EventTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
