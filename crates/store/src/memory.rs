use crate::{ChatStore, ModelStore, Observable};
use async_trait::async_trait;
use halo_common::{ChatSession, ConversationTurn, ModelDescriptor, ModelStatus, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::debug;

/// In-process store. Every table is a `watch` channel so queries can be observed.
pub struct MemoryStore {
    turns: watch::Sender<Vec<ConversationTurn>>,
    sessions: watch::Sender<Vec<ChatSession>>,
    models: watch::Sender<Vec<ModelDescriptor>>,
    next_turn_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            turns: watch::Sender::new(Vec::new()),
            sessions: watch::Sender::new(Vec::new()),
            models: watch::Sender::new(Vec::new()),
            next_turn_id: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn by_recency(mut sessions: Vec<ChatSession>) -> Vec<ChatSession> {
    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    sessions
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn insert_message(&self, mut turn: ConversationTurn) -> Result<u64> {
        let id = self.next_turn_id.fetch_add(1, Ordering::Relaxed);
        turn.id = id;
        debug!(id, session = %turn.session_id, role = turn.role.as_str(), "Insert turn");
        self.turns.send_modify(|turns| turns.push(turn));
        Ok(id)
    }

    async fn update_message(&self, turn: &ConversationTurn) -> Result<()> {
        self.turns.send_if_modified(|turns| {
            match turns.iter_mut().find(|existing| existing.id == turn.id) {
                Some(existing) => {
                    *existing = turn.clone();
                    true
                }
                None => false,
            }
        });
        Ok(())
    }

    async fn delete_message(&self, id: u64) -> Result<()> {
        self.turns.send_if_modified(|turns| {
            let before = turns.len();
            turns.retain(|turn| turn.id != id);
            turns.len() != before
        });
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        Ok(self
            .turns
            .borrow()
            .iter()
            .filter(|turn| turn.session_id == session_id)
            .cloned()
            .collect())
    }

    fn watch_messages(&self, session_id: &str) -> Observable<ConversationTurn> {
        let session_id = session_id.to_string();
        let stream = WatchStream::new(self.turns.subscribe()).map(move |turns| {
            turns
                .into_iter()
                .filter(|turn| turn.session_id == session_id)
                .collect()
        });
        Box::pin(stream)
    }

    async fn insert_session(&self, session: ChatSession) -> Result<()> {
        self.sessions.send_modify(|sessions| {
            sessions.retain(|existing| existing.session_id != session.session_id);
            sessions.push(session);
        });
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        Ok(self
            .sessions
            .borrow()
            .iter()
            .find(|session| session.session_id == session_id)
            .cloned())
    }

    async fn sessions(&self) -> Result<Vec<ChatSession>> {
        Ok(by_recency(self.sessions.borrow().clone()))
    }

    fn watch_sessions(&self) -> Observable<ChatSession> {
        Box::pin(WatchStream::new(self.sessions.subscribe()).map(by_recency))
    }

    async fn update_session_title(&self, session_id: &str, title: &str) -> Result<()> {
        self.sessions.send_if_modified(|sessions| {
            match sessions.iter_mut().find(|s| s.session_id == session_id) {
                Some(session) => {
                    session.title = title.to_string();
                    true
                }
                None => false,
            }
        });
        Ok(())
    }

    async fn touch_session(&self, session_id: &str, timestamp: u64) -> Result<()> {
        self.sessions.send_if_modified(|sessions| {
            match sessions.iter_mut().find(|s| s.session_id == session_id) {
                Some(session) => {
                    session.updated_at = timestamp;
                    true
                }
                None => false,
            }
        });
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.turns.send_if_modified(|turns| {
            let before = turns.len();
            turns.retain(|turn| turn.session_id != session_id);
            turns.len() != before
        });
        self.sessions.send_if_modified(|sessions| {
            let before = sessions.len();
            sessions.retain(|session| session.session_id != session_id);
            sessions.len() != before
        });
        debug!(session = session_id, "Deleted session");
        Ok(())
    }
}

#[async_trait]
impl ModelStore for MemoryStore {
    async fn insert_model(&self, model: ModelDescriptor) -> Result<()> {
        self.models.send_modify(|models| {
            models.retain(|existing| existing.id != model.id);
            models.push(model);
        });
        Ok(())
    }

    async fn update_model(&self, model: &ModelDescriptor) -> Result<()> {
        self.models.send_if_modified(|models| {
            match models.iter_mut().find(|existing| existing.id == model.id) {
                Some(existing) => {
                    *existing = model.clone();
                    true
                }
                None => false,
            }
        });
        Ok(())
    }

    async fn delete_model(&self, model_id: &str) -> Result<()> {
        self.models.send_if_modified(|models| {
            let before = models.len();
            models.retain(|model| model.id != model_id);
            models.len() != before
        });
        Ok(())
    }

    async fn get_model(&self, model_id: &str) -> Result<Option<ModelDescriptor>> {
        Ok(self
            .models
            .borrow()
            .iter()
            .find(|model| model.id == model_id)
            .cloned())
    }

    async fn models(&self) -> Result<Vec<ModelDescriptor>> {
        Ok(self.models.borrow().clone())
    }

    fn watch_models(&self) -> Observable<ModelDescriptor> {
        Box::pin(WatchStream::new(self.models.subscribe()))
    }

    async fn update_status(&self, model_id: &str, status: ModelStatus) -> Result<()> {
        self.models.send_if_modified(|models| {
            match models.iter_mut().find(|model| model.id == model_id) {
                Some(model) if model.status != status => {
                    debug!(model = model_id, ?status, "Model status changed");
                    model.status = status;
                    true
                }
                _ => false,
            }
        });
        Ok(())
    }
}
