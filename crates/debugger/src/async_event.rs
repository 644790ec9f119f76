use std::thread;

use tokio::sync::mpsc;

use crate::state::SessionEvent;

/// Async event receiver that wraps tokio mpsc
pub struct AsyncEventReceiver {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl AsyncEventReceiver {
    /// Forward events from a session's blocking event channel.
    ///
    /// The forwarding thread exits when either side goes away.
    pub(crate) fn forward(events: crossbeam_channel::Receiver<SessionEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawned = thread::Builder::new()
            .name("session-events".to_string())
            .spawn(move || {
                while let Ok(event) = events.recv() {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                tracing::trace!("event forwarding finished");
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "could not spawn event forwarding thread");
        }
        Self { rx }
    }

    /// Receive next event asynchronously
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}
