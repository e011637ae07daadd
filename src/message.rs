//! In-process message bus.
//!
//! Plain messages go to every [`Listener`] from [`MessageBus::listen`]. A
//! [`Page`] tags what it sends with its own id so several parties sharing
//! one bus can address only themselves.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const BUS_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    /// The local notebook was replaced.
    NotebookUpdated { count: usize },
    /// A sync cycle changed the recorded meta for a service.
    NotebookSynced { service_id: String, timestamp: i64 },
}

#[derive(Debug, Clone)]
struct Envelope {
    page_id: Option<String>,
    message: Message,
}

#[derive(Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<Envelope>,
    next_page: Arc<AtomicU64>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            next_page: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Broadcasts to all untagged listeners. Returns how many were listening.
    pub fn send(&self, message: Message) -> usize {
        self.tx
            .send(Envelope {
                page_id: None,
                message,
            })
            .unwrap_or(0)
    }

    pub fn listen(&self) -> Listener {
        Listener {
            page_id: None,
            rx: self.tx.subscribe(),
        }
    }

    /// A new page identity on this bus.
    pub fn page(&self) -> Page {
        let id = self.next_page.fetch_add(1, Ordering::Relaxed);
        Page {
            bus: self.clone(),
            page_id: format!("page-{}", id),
        }
    }
}

pub struct Page {
    bus: MessageBus,
    page_id: String,
}

impl Page {
    pub fn id(&self) -> &str {
        &self.page_id
    }

    pub fn send_self(&self, message: Message) -> usize {
        self.bus
            .tx
            .send(Envelope {
                page_id: Some(self.page_id.clone()),
                message,
            })
            .unwrap_or(0)
    }

    pub fn listen_self(&self) -> Listener {
        Listener {
            page_id: Some(self.page_id.clone()),
            rx: self.bus.tx.subscribe(),
        }
    }
}

pub struct Listener {
    page_id: Option<String>,
    rx: broadcast::Receiver<Envelope>,
}

impl Listener {
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.page_id == self.page_id => return Some(envelope.message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "message listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Logs every message the listener sees until cancelled or the bus closes.
/// Returns how many were logged.
pub async fn log_messages(mut listener: Listener, cancel: CancellationToken) -> usize {
    let mut seen = 0;
    loop {
        let message = tokio::select! {
            message = listener.recv() => message,
            _ = cancel.cancelled() => break,
        };
        match message {
            Some(Message::NotebookUpdated { count }) => tracing::info!(count, "notebook updated"),
            Some(Message::NotebookSynced { service_id, timestamp }) => {
                tracing::info!(service_id, timestamp, "notebook synced")
            }
            None => break,
        }
        seen += 1;
    }
    seen
}
