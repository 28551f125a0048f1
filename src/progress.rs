// Progress notifications emitted by the ingestion pipeline

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::info;

const CHANNEL_CAPACITY: usize = 256;

/// One-way, best-effort progress reporting. Implementations must not fail the caller.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, message: &str);
}

/// Writes progress to the log, tagged with the dataset.
pub struct LogSink {
    dataset: String,
}

impl LogSink {
    pub fn new(dataset: &str) -> Self {
        LogSink {
            dataset: dataset.to_string(),
        }
    }
}

impl ProgressSink for LogSink {
    fn notify(&self, message: &str) {
        info!(dataset = %self.dataset, "{}", message);
    }
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn notify(&self, _message: &str) {}
}

/// Keeps every message, for tests and for callers that want a transcript.
#[derive(Debug, Default)]
pub struct CapturingSink {
    messages: Mutex<Vec<String>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        CapturingSink::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

impl ProgressSink for CapturingSink {
    fn notify(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}

/// Sends to live subscribers of a feed, or to the log when nobody is listening.
pub struct BroadcastSink {
    sender: Arc<broadcast::Sender<String>>,
    fallback: LogSink,
}

impl ProgressSink for BroadcastSink {
    fn notify(&self, message: &str) {
        if self.sender.send(message.to_string()).is_err() {
            self.fallback.notify(message);
        }
    }
}

/// Per-feed progress channels shared between the ingestion runs and the HTTP subscribers.
/// A channel is dropped once it has neither a sink nor a subscriber.
#[derive(Default)]
pub struct ProgressHub {
    channels: Mutex<HashMap<String, Arc<broadcast::Sender<String>>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        ProgressHub::default()
    }

    fn sender(&self, feed_id: &str) -> Arc<broadcast::Sender<String>> {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels.retain(|id, sender| {
            id == feed_id || Arc::strong_count(sender) > 1 || sender.receiver_count() > 0
        });
        Arc::clone(
            channels
                .entry(feed_id.to_string())
                .or_insert_with(|| Arc::new(broadcast::channel(CHANNEL_CAPACITY).0)),
        )
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.channels.lock().map(|channels| channels.len()).unwrap_or_default()
    }

    pub fn subscribe(&self, feed_id: &str) -> broadcast::Receiver<String> {
        self.sender(feed_id).subscribe()
    }

    pub fn sink(&self, feed_id: &str) -> Arc<dyn ProgressSink> {
        Arc::new(BroadcastSink {
            sender: self.sender(feed_id),
            fallback: LogSink::new(feed_id),
        })
    }
}
