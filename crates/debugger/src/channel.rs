//! Hand-off of stop events from the engine thread to waiting callers.

use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::types::StoppedEvent;

const POLL_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TakeError {
    /// No stop arrived before the deadline
    #[error("timed out waiting for the debugger to stop")]
    Timeout,

    /// The producing session has gone away
    #[error("stop event channel closed")]
    Closed,

    /// The caller's cancellation token fired
    #[error("wait for stop event cancelled")]
    Cancelled,
}

pub fn stop_channel() -> (StopSender, StopReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (StopSender(tx), StopReceiver(rx))
}

#[derive(Debug, Clone)]
pub struct StopSender(crossbeam_channel::Sender<StoppedEvent>);

impl StopSender {
    /// Enqueue a stop event. Returns `false` if every receiver has been dropped.
    pub fn push(&self, event: StoppedEvent) -> bool {
        self.0.send(event).is_ok()
    }
}

/// Consumer side. Clones share one queue, each event is taken exactly once.
#[derive(Debug, Clone)]
pub struct StopReceiver(crossbeam_channel::Receiver<StoppedEvent>);

impl StopReceiver {
    /// Wait for the next stop event.
    ///
    /// Cancelling only abandons this wait, the engine keeps running.
    pub fn take(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<StoppedEvent, TakeError> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(TakeError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // an event may have landed during the last poll
                return self.try_take()?.ok_or(TakeError::Timeout);
            }
            match self.0.recv_timeout(remaining.min(POLL_TIMEOUT)) {
                Ok(event) => return Ok(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(TakeError::Closed),
            }
        }
    }

    /// Take a stop event if one is queued
    pub fn try_take(&self) -> Result<Option<StoppedEvent>, TakeError> {
        match self.0.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TakeError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, thread};

    use super::*;

    fn event(line: u32) -> StoppedEvent {
        StoppedEvent {
            script_path: PathBuf::from("/tmp/script.ps1"),
            is_remote_session: false,
            remote_script_path: None,
            line,
            column: 1,
            breakpoints: Vec::new(),
        }
    }

    #[test]
    fn events_arrive_in_order_without_a_waiting_consumer() {
        let (tx, rx) = stop_channel();
        for line in 1..=3 {
            assert!(tx.push(event(line)));
        }

        let token = CancellationToken::new();
        let lines: Vec<u32> = (0..3)
            .map(|_| rx.take(Duration::from_secs(1), &token).unwrap().line)
            .collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn timeout_is_distinct_from_closed() {
        let (tx, rx) = stop_channel();
        let token = CancellationToken::new();
        assert_eq!(
            rx.take(Duration::from_millis(30), &token).unwrap_err(),
            TakeError::Timeout
        );

        drop(tx);
        assert_eq!(
            rx.take(Duration::from_millis(30), &token).unwrap_err(),
            TakeError::Closed
        );
    }

    #[test]
    fn queued_events_survive_sender_drop() {
        let (tx, rx) = stop_channel();
        tx.push(event(4));
        drop(tx);

        let token = CancellationToken::new();
        assert_eq!(rx.take(Duration::from_secs(1), &token).unwrap().line, 4);
        assert_eq!(rx.try_take().unwrap_err(), TakeError::Closed);
    }

    #[test]
    fn cancellation_abandons_wait() {
        let (_tx, rx) = stop_channel();
        let token = CancellationToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        assert_eq!(
            rx.take(Duration::from_secs(10), &token).unwrap_err(),
            TakeError::Cancelled
        );
        handle.join().unwrap();
    }

    #[test]
    fn event_is_delivered_across_threads() {
        let (tx, rx) = stop_channel();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.push(event(9));
        });

        let token = CancellationToken::new();
        assert_eq!(rx.take(Duration::from_secs(5), &token).unwrap().line, 9);
        handle.join().unwrap();
    }
}
