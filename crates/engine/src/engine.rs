// The engine facade: one handle owning the database, the provider, the
// dispatcher, and the worker pool. Controllers talk to this and nothing
// else.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::info;
use uuid::Uuid;

use quizforge_common::document::TestDocument;
use quizforge_common::types::{ChatMessage, Conversation, TaskGroup};

use crate::cache::ResponseCache;
use crate::config::EngineConfig;
use crate::dispatch::{DispatchError, DispatchOutcome, Dispatcher};
use crate::ledger::TokenLedger;
use crate::provider::AiProvider;
use crate::store::conversations::ConversationStore;
use crate::store::documents::DocumentStore;
use crate::store::messages::MessageStore;
use crate::store::meta_db::MetaDb;
use crate::tasks::store::TaskStore;
use crate::tasks::worker::WorkerPool;

pub struct Engine {
    db: Arc<Mutex<MetaDb>>,
    dispatcher: Dispatcher,
    pool: WorkerPool,
}

impl Engine {
    /// Open (or create) the database at `path` and start the worker pool.
    pub fn open(
        path: &Path,
        provider: Arc<dyn AiProvider>,
        config: EngineConfig,
    ) -> anyhow::Result<Self> {
        let meta = MetaDb::open(path)?;
        Ok(Self::start(meta, provider, config))
    }

    pub fn start(meta: MetaDb, provider: Arc<dyn AiProvider>, config: EngineConfig) -> Self {
        let db = Arc::new(Mutex::new(meta));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(db.clone(), provider.clone(), &config, queue_rx);
        let dispatcher = Dispatcher::new(db.clone(), provider, config, queue_tx);
        info!("engine started");
        Self { db, dispatcher, pool }
    }

    /// Stop accepting queued work and wait for in-flight tasks to finish.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
        info!("engine stopped");
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Handle one user message against a conversation.
    pub async fn dispatch(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        message: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatcher.handle(conversation_id, user_id, message).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Cancel a task and its non-terminal children. Returns how many
    /// records were actually transitioned.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<usize, DispatchError> {
        let db = self.db.lock().await;
        if TaskStore::get(db.connection(), task_id)?.is_none() {
            return Err(DispatchError::TaskNotFound(task_id));
        }
        let cancelled = TaskStore::cancel_with_children(db.connection(), task_id, Utc::now())?;
        info!(task = %task_id, cancelled, "task cancellation requested");
        Ok(cancelled)
    }

    /// Parent tasks for a conversation, newest first, each with its
    /// children attached.
    pub async fn task_groups(&self, conversation_id: Uuid) -> anyhow::Result<Vec<TaskGroup>> {
        let db = self.db.lock().await;
        TaskStore::task_groups(db.connection(), conversation_id)
    }

    // ── Conversations and documents ─────────────────────────────────

    pub async fn create_conversation(
        &self,
        owner_id: &str,
        title: &str,
    ) -> anyhow::Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            deleted_at: None,
            created_at: Utc::now(),
        };
        let db = self.db.lock().await;
        ConversationStore::create(db.connection(), &conversation)?;
        Ok(conversation)
    }

    pub async fn list_conversations(&self, owner_id: &str) -> anyhow::Result<Vec<Conversation>> {
        let db = self.db.lock().await;
        ConversationStore::list_by_owner(db.connection(), owner_id)
    }

    /// Soft-delete: the conversation disappears from listings but its
    /// history and document survive for `restore_conversation`.
    pub async fn delete_conversation(&self, id: Uuid) -> anyhow::Result<bool> {
        let db = self.db.lock().await;
        ConversationStore::soft_delete(db.connection(), id, Utc::now())
    }

    pub async fn restore_conversation(&self, id: Uuid) -> anyhow::Result<bool> {
        let db = self.db.lock().await;
        ConversationStore::restore(db.connection(), id)
    }

    /// Hard-delete a conversation and everything hanging off it.
    pub async fn purge_conversation(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut db = self.db.lock().await;
        ConversationStore::purge(db.connection_mut(), id)
    }

    pub async fn document(&self, conversation_id: Uuid) -> anyhow::Result<Option<TestDocument>> {
        let db = self.db.lock().await;
        DocumentStore::get(db.connection(), conversation_id)
    }

    pub async fn messages(&self, conversation_id: Uuid) -> anyhow::Result<Vec<ChatMessage>> {
        let db = self.db.lock().await;
        MessageStore::list_by_conversation(db.connection(), conversation_id)
    }

    // ── Tokens ──────────────────────────────────────────────────────

    pub async fn balance(&self, user_id: &str) -> anyhow::Result<i64> {
        let db = self.db.lock().await;
        TokenLedger::balance(db.connection(), user_id)
    }

    /// Credit tokens to a user. Returns the new balance.
    pub async fn grant_tokens(
        &self,
        user_id: &str,
        amount: i64,
        source: &str,
    ) -> anyhow::Result<i64> {
        let mut db = self.db.lock().await;
        TokenLedger::grant(db.connection_mut(), user_id, amount, source, Utc::now())
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Drop expired response-cache rows. Safe to run any time.
    pub async fn purge_expired_cache(&self) -> anyhow::Result<usize> {
        let db = self.db.lock().await;
        ResponseCache::purge_expired(db.connection(), Utc::now())
    }
}
