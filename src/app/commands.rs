//! The serialized command queue.
//!
//! Every user-, device-, and backend-triggered action becomes one variant of
//! [`Command`] and goes through a single bounded queue consumed by exactly
//! one task, so state transitions never race. On a full queue the oldest
//! pending command is evicted (recency wins) and a dropped counter bumped.

use crate::state::{AbortReason, DeviceState, ListeningMode};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, strum::Display)]
pub enum Command {
    StartListening { mode: ListeningMode },
    StopListening,
    ToggleChat,
    AbortSpeaking { reason: AbortReason },
    SetDeviceState { target: DeviceState },
    WakeWordDetected { phrase: String },
    WakeWordFailed { error: String },
    IncomingJson { payload: Value },
    NetworkError { message: String },
    AudioChannelOpened,
    AudioChannelClosed,
    SendText { text: String },
    Shutdown,
}

pub struct CommandQueue {
    inner: Mutex<VecDeque<Command>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        CommandQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Never blocks. A full queue evicts its oldest command first.
    pub fn push(&self, command: Command) {
        {
            let mut queue = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() >= self.capacity {
                if let Some(evicted) = queue.pop_front() {
                    self.dropped.fetch_add(1, Ordering::SeqCst);
                    log::warn!("command queue full, dropped oldest command: {evicted}");
                }
            }
            queue.push_back(command);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Command> {
        match self.inner.lock() {
            Ok(mut guard) => guard.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    /// Pop with a bounded wait so the consumer can observe shutdown between
    /// polls even when nothing arrives.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<Command> {
        if let Some(command) = self.try_pop() {
            return Some(command);
        }
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.try_pop()
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_fifo() {
        let queue = CommandQueue::new(8);
        queue.push(Command::ToggleChat);
        queue.push(Command::StopListening);
        assert!(matches!(queue.try_pop(), Some(Command::ToggleChat)));
        assert!(matches!(queue.try_pop(), Some(Command::StopListening)));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_full_queue_evicts_oldest() {
        let queue = CommandQueue::new(2);
        queue.push(Command::ToggleChat);
        queue.push(Command::StopListening);
        queue.push(Command::Shutdown);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_count(), 1);
        assert!(matches!(queue.try_pop(), Some(Command::StopListening)));
        assert!(matches!(queue.try_pop(), Some(Command::Shutdown)));
    }

    #[tokio::test]
    async fn test_pop_timeout_returns_none_when_idle() {
        let queue = CommandQueue::new(8);
        let started = std::time::Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(50)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_pop_timeout_wakes_on_push() {
        let queue = std::sync::Arc::new(CommandQueue::new(8));
        let producer = std::sync::Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(Command::ToggleChat);
        });
        let command = queue.pop_timeout(Duration::from_secs(1)).await;
        assert!(matches!(command, Some(Command::ToggleChat)));
    }
}
