use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::event::InterlinkEvent;
use crate::error::Result;

const SUBSCRIBER_BUFFER: usize = 1024;

/// Publish/subscribe channel for control events
///
/// Delivery is at-least-once to every subscriber, with no ordering guarantee
/// across subscribers.
#[async_trait]
pub trait InterlinkTransport: Send + Sync {
    async fn publish(&self, event: &InterlinkEvent) -> Result<()>;

    async fn subscribe(&self) -> Result<mpsc::Receiver<InterlinkEvent>>;
}

/// Process-local bus; every subscriber sees every published event
#[derive(Clone)]
pub struct InMemoryInterlink {
    sender: broadcast::Sender<InterlinkEvent>,
    published: Arc<AtomicU64>,
}

impl InMemoryInterlink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryInterlink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InterlinkTransport for InMemoryInterlink {
    async fn publish(&self, event: &InterlinkEvent) -> Result<()> {
        self.published.fetch_add(1, Ordering::SeqCst);
        // No subscribers is not an error: nobody owns the partition right now
        let _ = self.sender.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<InterlinkEvent>> {
        let mut source = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Interlink subscriber lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}
