mod memory;


pub use memory::MemoryStore;

use async_trait::async_trait;
use halo_common::{ChatSession, ConversationTurn, ModelDescriptor, ModelStatus, Result};
use std::pin::Pin;
use tokio_stream::Stream;

/// Observable query: yields the current rows, then the rows after every change
pub type Observable<T> = Pin<Box<dyn Stream<Item = Vec<T>> + Send>>;

/// Persistence of chat sessions and their turns
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Insert a turn and return the id assigned to it
    async fn insert_message(&self, turn: ConversationTurn) -> Result<u64>;

    /// Replace a stored turn. Unknown ids are ignored.
    async fn update_message(&self, turn: &ConversationTurn) -> Result<()>;

    async fn delete_message(&self, id: u64) -> Result<()>;

    /// Turns of a session in insertion order
    async fn messages(&self, session_id: &str) -> Result<Vec<ConversationTurn>>;

    fn watch_messages(&self, session_id: &str) -> Observable<ConversationTurn>;

    async fn insert_session(&self, session: ChatSession) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>>;

    /// Sessions, most recently updated first
    async fn sessions(&self) -> Result<Vec<ChatSession>>;

    fn watch_sessions(&self) -> Observable<ChatSession>;

    async fn update_session_title(&self, session_id: &str, title: &str) -> Result<()>;

    async fn touch_session(&self, session_id: &str, timestamp: u64) -> Result<()>;

    /// Delete a session together with its turns
    async fn delete_session(&self, session_id: &str) -> Result<()>;
}

/// Persistence of model descriptors
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn insert_model(&self, model: ModelDescriptor) -> Result<()>;

    async fn update_model(&self, model: &ModelDescriptor) -> Result<()>;

    async fn delete_model(&self, model_id: &str) -> Result<()>;

    async fn get_model(&self, model_id: &str) -> Result<Option<ModelDescriptor>>;

    async fn models(&self) -> Result<Vec<ModelDescriptor>>;

    fn watch_models(&self) -> Observable<ModelDescriptor>;

    async fn update_status(&self, model_id: &str, status: ModelStatus) -> Result<()>;
}
