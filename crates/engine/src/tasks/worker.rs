// Background worker pool.
//
// Workers pull task ids from an in-process queue and run the same
// provider/parse/merge pipeline as the immediate path. The claim guard
// makes delivery at-least-once safe: a duplicate or stale id simply fails
// to claim and is dropped. Cancellation is re-checked after the provider
// call so a task cancelled mid-flight commits nothing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quizforge_common::document::apply_patch;
use quizforge_common::types::{AiTask, TaskStatus};

use crate::config::EngineConfig;
use crate::dispatch::{build_authoring_prompt, AUTHORING_SYSTEM_PROMPT};
use crate::parser::{ParsedResponse, ResponseParser};
use crate::provider::AiProvider;
use crate::store::documents::DocumentStore;
use crate::store::messages::{MessageStore, NewMessage};
use crate::store::meta_db::MetaDb;
use crate::tasks::store::TaskStore;
use crate::tasks::TaskPayload;

/// How long a worker sleeps after an unexpected queue hiccup.
const BACKOFF: Duration = Duration::from_millis(250);

/// A pool of task workers sharing one queue receiver.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn spawn(
        db: Arc<Mutex<MetaDb>>,
        provider: Arc<dyn AiProvider>,
        config: &EngineConfig,
        queue_rx: mpsc::UnboundedReceiver<Uuid>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Arc::new(Mutex::new(queue_rx));
        let parser = ResponseParser::new(config.truncation_threshold);

        let handles = (0..config.worker_count.max(1))
            .map(|index| {
                let db = db.clone();
                let provider = provider.clone();
                let queue = queue.clone();
                let parser = parser.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(worker_loop(index, db, provider, parser, queue, shutdown_rx))
            })
            .collect();

        Self { handles, shutdown_tx }
    }

    /// Signal shutdown and wait for every worker to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    index: usize,
    db: Arc<Mutex<MetaDb>>,
    provider: Arc<dyn AiProvider>,
    parser: ResponseParser,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Uuid>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker = index, "task worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                id = rx.recv() => id,
            }
        };

        let Some(task_id) = next else {
            // Queue sender dropped; nothing more will arrive.
            break;
        };

        // One task failing must never take the worker down with it.
        if let Err(error) = process_task(&db, provider.as_ref(), &parser, task_id).await {
            warn!(worker = index, task = %task_id, %error, "task processing failed");
            tokio::time::sleep(BACKOFF).await;
        }
    }
    debug!(worker = index, "task worker stopped");
}

/// Run one task end to end. Storage errors bubble up; provider and
/// payload problems are recorded on the task itself.
async fn process_task(
    db: &Arc<Mutex<MetaDb>>,
    provider: &dyn AiProvider,
    parser: &ResponseParser,
    task_id: Uuid,
) -> anyhow::Result<()> {
    // Claim, load, and build the prompt under one lock hold.
    let (task, prompt) = {
        let db = db.lock().await;
        if !TaskStore::claim(db.connection(), task_id, Utc::now())? {
            // Already claimed, cancelled, or unknown. All fine.
            debug!(task = %task_id, "claim refused, skipping");
            return Ok(());
        }

        let Some(task) = TaskStore::get(db.connection(), task_id)? else {
            return Ok(());
        };

        let payload: TaskPayload = match serde_json::from_value(task.request_payload.clone()) {
            Ok(payload) => payload,
            Err(error) => {
                TaskStore::fail(
                    db.connection(),
                    task_id,
                    &format!("undecodable request payload: {error}"),
                    Utc::now(),
                )?;
                roll_up(&db, &task)?;
                return Ok(());
            }
        };

        let document =
            DocumentStore::get_or_create(db.connection(), task.conversation_id, Utc::now())?;
        let prompt =
            build_authoring_prompt(&document, &payload.message, payload.section.as_deref());
        (task, prompt)
    };

    // Provider call runs without the database lock.
    let completion = provider.complete(AUTHORING_SYSTEM_PROMPT, &prompt).await;

    let mut db = db.lock().await;
    let now = Utc::now();

    // The task may have been cancelled while the provider call was in
    // flight. A cancelled task commits nothing.
    if TaskStore::status(db.connection(), task_id)? == Some(TaskStatus::Cancelled) {
        info!(task = %task_id, "task cancelled mid-flight, discarding result");
        return Ok(());
    }

    let text = match completion {
        Ok(completion) => completion.text,
        Err(error) => {
            TaskStore::fail(db.connection(), task_id, &error.to_string(), now)?;
            roll_up(&db, &task)?;
            return Ok(());
        }
    };

    let parsed = parser.parse(&text);
    if !commit_completion(&mut db, &task, &parsed, now)? {
        // Lost a cancel race inside the lock window.
        info!(task = %task_id, "completion refused, discarding result");
        return Ok(());
    }

    roll_up(&db, &task)?;
    info!(task = %task_id, "task completed");
    Ok(())
}

/// Flip the task done, merge the patch, and append the reply message in
/// one transaction. The status guard runs first, so a cancel that won
/// the race leaves nothing durable. Returns false when refused.
fn commit_completion(
    db: &mut MetaDb,
    task: &AiTask,
    parsed: &ParsedResponse,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let tx = db
        .connection_mut()
        .transaction()
        .context("failed to start task completion transaction")?;

    let result = serde_json::json!({
        "reply": parsed.reply_text,
        "patchApplied": parsed.patch.is_some(),
        "truncated": parsed.truncated,
    });
    if !TaskStore::complete(&tx, task.id, &result, now)? {
        // Dropping the transaction rolls back.
        return Ok(false);
    }

    // Merge against the current document, not the one the prompt saw.
    let current = DocumentStore::get_or_create(&tx, task.conversation_id, now)?;
    let updated = apply_patch(&current, parsed.patch.as_ref());
    if parsed.patch.is_some() {
        DocumentStore::save(&tx, task.conversation_id, &updated, now)?;
    }

    MessageStore::insert(
        &tx,
        &NewMessage {
            conversation_id: task.conversation_id,
            user_text: None,
            reply_text: Some(parsed.reply_text.clone()),
            task_ids: vec![task.id],
            created_at: now,
        },
    )?;

    tx.commit().context("failed to commit task completion")?;
    Ok(true)
}

/// Recompute the parent's status once this child reaches a terminal state.
fn roll_up(db: &MetaDb, task: &AiTask) -> anyhow::Result<()> {
    if let Some(parent_id) = task.parent_id {
        if let Some(status) = TaskStore::roll_up_parent(db.connection(), parent_id, Utc::now())? {
            info!(parent = %parent_id, status = status.as_str(), "parent task rolled up");
        }
    }
    Ok(())
}
