use crate::error::StorageError;
use crate::message::{Message, MessageBus};
use crate::model::Word;
use crate::storage::{KvStore, StorageArea};
use async_trait::async_trait;
use std::sync::Arc;

pub const NOTEBOOK_KEY: &str = "notebook";

/// Owner of the saved words.
#[async_trait]
pub trait NotebookStore: Send + Sync {
    async fn get_words(&self) -> Result<Vec<Word>, StorageError>;
    async fn save_words(&self, words: Vec<Word>) -> Result<(), StorageError>;
}

/// Notebook kept under [`NOTEBOOK_KEY`] in the local area. Every save is
/// announced on the bus.
pub struct KvNotebook {
    kv: Arc<dyn KvStore>,
    bus: MessageBus,
}

impl KvNotebook {
    pub fn new(kv: Arc<dyn KvStore>, bus: MessageBus) -> Self {
        Self { kv, bus }
    }
}

#[async_trait]
impl NotebookStore for KvNotebook {
    async fn get_words(&self) -> Result<Vec<Word>, StorageError> {
        Ok(self
            .kv
            .get_as::<Vec<Word>>(StorageArea::Local, NOTEBOOK_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save_words(&self, words: Vec<Word>) -> Result<(), StorageError> {
        let count = words.len();
        self.kv.set_as(StorageArea::Local, NOTEBOOK_KEY, &words).await?;
        self.bus.send(Message::NotebookUpdated { count });
        Ok(())
    }
}
