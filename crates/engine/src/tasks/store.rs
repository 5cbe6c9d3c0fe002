// AiTask persistence: a durable status state machine.
//
// Transitions are enforced with conditional UPDATE guards:
//   pending → processing → done | failed
//   pending | processing → cancelled
// done/failed/cancelled are terminal. Each transition helper returns
// whether the guard matched, so a worker racing a cancellation (or a
// redelivered queue message) observes `false` and backs off.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use quizforge_common::types::{AiTask, TaskGroup, TaskStatus};

/// A new task to persist (status starts at `pending`).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub owner_id: String,
    pub parent_id: Option<Uuid>,
    pub request_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Stateless CRUD + transitions on the `ai_tasks` table.
pub struct TaskStore;

impl TaskStore {
    pub fn create(conn: &Connection, task: &NewTask) -> Result<()> {
        conn.execute(
            "INSERT INTO ai_tasks \
             (task_id, conversation_id, owner_id, parent_id, status, request_payload, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                task.id.to_string(),
                task.conversation_id.to_string(),
                task.owner_id,
                task.parent_id.map(|id| id.to_string()),
                TaskStatus::Pending.as_str(),
                task.request_payload.to_string(),
                task.created_at.to_rfc3339(),
            ],
        )
        .context("failed to insert ai task")?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: Uuid) -> Result<Option<AiTask>> {
        let mut stmt = conn
            .prepare(
                "SELECT task_id, conversation_id, owner_id, parent_id, status, \
                 request_payload, result, error, created_at, updated_at \
                 FROM ai_tasks WHERE task_id = ?1",
            )
            .context("failed to prepare task query")?;

        let mut rows = stmt
            .query_map(params![id.to_string()], row_to_task)
            .context("failed to query ai task")?;

        match rows.next() {
            Some(row) => Ok(Some(row.context("failed to decode ai task row")?)),
            None => Ok(None),
        }
    }

    pub fn status(conn: &Connection, id: Uuid) -> Result<Option<TaskStatus>> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT status FROM ai_tasks WHERE task_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read task status")?;
        Ok(raw.as_deref().and_then(TaskStatus::parse))
    }

    /// pending → processing. The worker's pickup gate; also dedupes
    /// redelivered queue messages.
    pub fn claim(conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        Self::transition(conn, id, &[TaskStatus::Pending], TaskStatus::Processing, now)
    }

    /// processing → done, storing the result.
    pub fn complete(
        conn: &Connection,
        id: Uuid,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE ai_tasks SET status = ?1, result = ?2, updated_at = ?3 \
                 WHERE task_id = ?4 AND status = ?5",
                params![
                    TaskStatus::Done.as_str(),
                    result.to_string(),
                    now.to_rfc3339(),
                    id.to_string(),
                    TaskStatus::Processing.as_str(),
                ],
            )
            .context("failed to complete ai task")?;
        Ok(changed > 0)
    }

    /// processing → failed, storing the error. No automatic retry.
    pub fn fail(conn: &Connection, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE ai_tasks SET status = ?1, error = ?2, updated_at = ?3 \
                 WHERE task_id = ?4 AND status = ?5",
                params![
                    TaskStatus::Failed.as_str(),
                    error,
                    now.to_rfc3339(),
                    id.to_string(),
                    TaskStatus::Processing.as_str(),
                ],
            )
            .context("failed to fail ai task")?;
        Ok(changed > 0)
    }

    /// pending | processing → cancelled. Terminal states are untouchable.
    pub fn cancel(conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        Self::transition(
            conn,
            id,
            &[TaskStatus::Pending, TaskStatus::Processing],
            TaskStatus::Cancelled,
            now,
        )
    }

    /// Cancel a task and all of its non-terminal children. Returns the
    /// number of tasks cancelled.
    pub fn cancel_with_children(conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        let mut cancelled = usize::from(Self::cancel(conn, id, now)?);
        for child in Self::children(conn, id)? {
            if !child.status.is_terminal() {
                cancelled += usize::from(Self::cancel(conn, child.id, now)?);
            }
        }
        Ok(cancelled)
    }

    pub fn children(conn: &Connection, parent_id: Uuid) -> Result<Vec<AiTask>> {
        let mut stmt = conn
            .prepare(
                "SELECT task_id, conversation_id, owner_id, parent_id, status, \
                 request_payload, result, error, created_at, updated_at \
                 FROM ai_tasks WHERE parent_id = ?1 ORDER BY created_at ASC, task_id ASC",
            )
            .context("failed to prepare children query")?;

        let rows = stmt
            .query_map(params![parent_id.to_string()], row_to_task)
            .context("failed to query task children")?;

        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect task children")
    }

    /// Parents (and standalones) for a conversation, each with its
    /// children. A childless parent renders as a group of itself.
    pub fn task_groups(conn: &Connection, conversation_id: Uuid) -> Result<Vec<TaskGroup>> {
        let mut stmt = conn
            .prepare(
                "SELECT task_id, conversation_id, owner_id, parent_id, status, \
                 request_payload, result, error, created_at, updated_at \
                 FROM ai_tasks \
                 WHERE conversation_id = ?1 AND parent_id IS NULL \
                 ORDER BY created_at DESC, task_id ASC",
            )
            .context("failed to prepare parent tasks query")?;

        let parents = stmt
            .query_map(params![conversation_id.to_string()], row_to_task)
            .context("failed to query parent tasks")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect parent tasks")?;

        parents
            .into_iter()
            .map(|parent| {
                let children = Self::children(conn, parent.id)?;
                Ok(TaskGroup { parent, children })
            })
            .collect()
    }

    /// When every child is terminal, settle the parent: failed if any
    /// child failed, cancelled if all were cancelled, otherwise done.
    /// Returns the parent's new status when the roll-up fired.
    pub fn roll_up_parent(
        conn: &Connection,
        parent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskStatus>> {
        let children = Self::children(conn, parent_id)?;
        if children.is_empty() || children.iter().any(|c| !c.status.is_terminal()) {
            return Ok(None);
        }

        let target = if children.iter().any(|c| c.status == TaskStatus::Failed) {
            TaskStatus::Failed
        } else if children.iter().all(|c| c.status == TaskStatus::Cancelled) {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Done
        };

        let applied = Self::transition(
            conn,
            parent_id,
            &[TaskStatus::Pending, TaskStatus::Processing],
            target,
            now,
        )?;
        Ok(applied.then_some(target))
    }

    fn transition(
        conn: &Connection,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        // At most two source states exist for any transition.
        let (first, second) = match from {
            [only] => (only.as_str(), only.as_str()),
            [a, b] => (a.as_str(), b.as_str()),
            _ => unreachable!("transitions have one or two source states"),
        };

        let changed = conn
            .execute(
                "UPDATE ai_tasks SET status = ?1, updated_at = ?2 \
                 WHERE task_id = ?3 AND status IN (?4, ?5)",
                params![to.as_str(), now.to_rfc3339(), id.to_string(), first, second],
            )
            .with_context(|| format!("failed to transition ai task to {}", to.as_str()))?;
        Ok(changed > 0)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<AiTask> {
    fn uuid_at(index: usize, raw: &str) -> rusqlite::Result<Uuid> {
        raw.parse::<Uuid>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    }

    let id_raw: String = row.get(0)?;
    let conversation_raw: String = row.get(1)?;
    let parent_raw: Option<String> = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let payload_raw: String = row.get(5)?;
    let result_raw: Option<String> = row.get(6)?;
    let created_raw: String = row.get(8)?;
    let updated_raw: String = row.get(9)?;

    Ok(AiTask {
        id: uuid_at(0, &id_raw)?,
        conversation_id: uuid_at(1, &conversation_raw)?,
        owner_id: row.get(2)?,
        parent_id: match parent_raw {
            Some(raw) => Some(uuid_at(3, &raw)?),
            None => None,
        },
        status: TaskStatus::parse(&status_raw).unwrap_or(TaskStatus::Failed),
        request_payload: serde_json::from_str(&payload_raw)
            .unwrap_or(serde_json::Value::Null),
        result: result_raw.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(7)?,
        created_at: created_raw.parse::<DateTime<Utc>>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?,
        updated_at: updated_raw.parse::<DateTime<Utc>>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::meta_db::MetaDb;
    use crate::tasks::TaskPayload;

    fn new_task(convo: Uuid, parent: Option<Uuid>) -> NewTask {
        NewTask {
            id: Uuid::new_v4(),
            conversation_id: convo,
            owner_id: "user-1".into(),
            parent_id: parent,
            request_payload: serde_json::to_value(TaskPayload::whole_test("add questions"))
                .expect("payload should encode"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn create_starts_pending() {
        let db = MetaDb::open_in_memory().expect("db should open");
        let task = new_task(Uuid::new_v4(), None);
        TaskStore::create(db.connection(), &task).expect("create should succeed");

        let loaded = TaskStore::get(db.connection(), task.id)
            .expect("get should succeed")
            .expect("task should exist");
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert!(loaded.parent_id.is_none());
        assert!(loaded.result.is_none());
    }

    #[test]
    fn happy_path_pending_processing_done() {
        let db = MetaDb::open_in_memory().expect("db should open");
        let task = new_task(Uuid::new_v4(), None);
        TaskStore::create(db.connection(), &task).expect("create should succeed");
        let now = Utc::now();

        assert!(TaskStore::claim(db.connection(), task.id, now).expect("claim"));
        // Second claim loses: redelivery is harmless.
        assert!(!TaskStore::claim(db.connection(), task.id, now).expect("double claim"));

        let result = serde_json::json!({"reply": "done"});
        assert!(TaskStore::complete(db.connection(), task.id, &result, now).expect("complete"));

        let loaded = TaskStore::get(db.connection(), task.id)
            .expect("get should succeed")
            .expect("task should exist");
        assert_eq!(loaded.status, TaskStatus::Done);
        assert_eq!(loaded.result, Some(result));
    }

    #[test]
    fn fail_requires_processing() {
        let db = MetaDb::open_in_memory().expect("db should open");
        let task = new_task(Uuid::new_v4(), None);
        TaskStore::create(db.connection(), &task).expect("create should succeed");
        let now = Utc::now();

        assert!(!TaskStore::fail(db.connection(), task.id, "boom", now).expect("fail pending"));

        TaskStore::claim(db.connection(), task.id, now).expect("claim");
        assert!(TaskStore::fail(db.connection(), task.id, "boom", now).expect("fail"));

        let loaded = TaskStore::get(db.connection(), task.id)
            .expect("get should succeed")
            .expect("task should exist");
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("boom"));
    }

    #[test]
    fn cancel_reaches_pending_and_processing_but_not_terminal() {
        let db = MetaDb::open_in_memory().expect("db should open");
        let now = Utc::now();

        let pending = new_task(Uuid::new_v4(), None);
        TaskStore::create(db.connection(), &pending).expect("create should succeed");
        assert!(TaskStore::cancel(db.connection(), pending.id, now).expect("cancel pending"));

        let processing = new_task(Uuid::new_v4(), None);
        TaskStore::create(db.connection(), &processing).expect("create should succeed");
        TaskStore::claim(db.connection(), processing.id, now).expect("claim");
        assert!(TaskStore::cancel(db.connection(), processing.id, now)
            .expect("cancel processing"));

        let done = new_task(Uuid::new_v4(), None);
        TaskStore::create(db.connection(), &done).expect("create should succeed");
        TaskStore::claim(db.connection(), done.id, now).expect("claim");
        TaskStore::complete(db.connection(), done.id, &serde_json::json!({}), now)
            .expect("complete");
        assert!(!TaskStore::cancel(db.connection(), done.id, now).expect("cancel done"));
        assert_eq!(
            TaskStore::status(db.connection(), done.id).expect("status"),
            Some(TaskStatus::Done)
        );
    }

    #[test]
    fn complete_after_cancel_is_rejected() {
        let db = MetaDb::open_in_memory().expect("db should open");
        let task = new_task(Uuid::new_v4(), None);
        TaskStore::create(db.connection(), &task).expect("create should succeed");
        let now = Utc::now();

        TaskStore::claim(db.connection(), task.id, now).expect("claim");
        TaskStore::cancel(db.connection(), task.id, now).expect("cancel");

        assert!(!TaskStore::complete(db.connection(), task.id, &serde_json::json!({}), now)
            .expect("complete after cancel"));
        assert_eq!(
            TaskStore::status(db.connection(), task.id).expect("status"),
            Some(TaskStatus::Cancelled)
        );
    }

    #[test]
    fn cancel_with_children_spares_terminal_children() {
        let db = MetaDb::open_in_memory().expect("db should open");
        let convo = Uuid::new_v4();
        let now = Utc::now();

        let parent = new_task(convo, None);
        TaskStore::create(db.connection(), &parent).expect("create parent");
        let done_child = new_task(convo, Some(parent.id));
        let live_child = new_task(convo, Some(parent.id));
        TaskStore::create(db.connection(), &done_child).expect("create child");
        TaskStore::create(db.connection(), &live_child).expect("create child");

        TaskStore::claim(db.connection(), done_child.id, now).expect("claim");
        TaskStore::complete(db.connection(), done_child.id, &serde_json::json!({}), now)
            .expect("complete");

        let cancelled = TaskStore::cancel_with_children(db.connection(), parent.id, now)
            .expect("cancel group");
        assert_eq!(cancelled, 2, "parent + live child");

        assert_eq!(
            TaskStore::status(db.connection(), done_child.id).expect("status"),
            Some(TaskStatus::Done)
        );
        assert_eq!(
            TaskStore::status(db.connection(), live_child.id).expect("status"),
            Some(TaskStatus::Cancelled)
        );
    }

    #[test]
    fn roll_up_waits_for_all_children() {
        let db = MetaDb::open_in_memory().expect("db should open");
        let convo = Uuid::new_v4();
        let now = Utc::now();

        let parent = new_task(convo, None);
        TaskStore::create(db.connection(), &parent).expect("create parent");
        let a = new_task(convo, Some(parent.id));
        let b = new_task(convo, Some(parent.id));
        TaskStore::create(db.connection(), &a).expect("create child");
        TaskStore::create(db.connection(), &b).expect("create child");

        TaskStore::claim(db.connection(), a.id, now).expect("claim");
        TaskStore::complete(db.connection(), a.id, &serde_json::json!({}), now)
            .expect("complete");

        assert_eq!(
            TaskStore::roll_up_parent(db.connection(), parent.id, now).expect("roll up"),
            None,
            "one child still pending"
        );

        TaskStore::claim(db.connection(), b.id, now).expect("claim");
        TaskStore::complete(db.connection(), b.id, &serde_json::json!({}), now)
            .expect("complete");

        assert_eq!(
            TaskStore::roll_up_parent(db.connection(), parent.id, now).expect("roll up"),
            Some(TaskStatus::Done)
        );
    }

    #[test]
    fn roll_up_prefers_failed_over_done() {
        let db = MetaDb::open_in_memory().expect("db should open");
        let convo = Uuid::new_v4();
        let now = Utc::now();

        let parent = new_task(convo, None);
        TaskStore::create(db.connection(), &parent).expect("create parent");
        let a = new_task(convo, Some(parent.id));
        let b = new_task(convo, Some(parent.id));
        TaskStore::create(db.connection(), &a).expect("create child");
        TaskStore::create(db.connection(), &b).expect("create child");

        TaskStore::claim(db.connection(), a.id, now).expect("claim");
        TaskStore::complete(db.connection(), a.id, &serde_json::json!({}), now)
            .expect("complete");
        TaskStore::claim(db.connection(), b.id, now).expect("claim");
        TaskStore::fail(db.connection(), b.id, "provider exploded", now).expect("fail");

        assert_eq!(
            TaskStore::roll_up_parent(db.connection(), parent.id, now).expect("roll up"),
            Some(TaskStatus::Failed)
        );
    }

    #[test]
    fn task_groups_include_standalones_as_single_element_groups() {
        let db = MetaDb::open_in_memory().expect("db should open");
        let convo = Uuid::new_v4();

        let standalone = new_task(convo, None);
        TaskStore::create(db.connection(), &standalone).expect("create standalone");

        let parent = new_task(convo, None);
        TaskStore::create(db.connection(), &parent).expect("create parent");
        let child = new_task(convo, Some(parent.id));
        TaskStore::create(db.connection(), &child).expect("create child");

        // A task in some other conversation must not leak in.
        let other = new_task(Uuid::new_v4(), None);
        TaskStore::create(db.connection(), &other).expect("create other");

        let groups =
            TaskStore::task_groups(db.connection(), convo).expect("groups should load");
        assert_eq!(groups.len(), 2);

        let standalone_group = groups
            .iter()
            .find(|g| g.parent.id == standalone.id)
            .expect("standalone group should exist");
        assert!(standalone_group.children.is_empty());

        let parent_group = groups
            .iter()
            .find(|g| g.parent.id == parent.id)
            .expect("parent group should exist");
        assert_eq!(parent_group.children.len(), 1);
        assert_eq!(parent_group.children[0].id, child.id);
    }
}
