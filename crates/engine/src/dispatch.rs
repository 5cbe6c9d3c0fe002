// Request dispatch: immediate vs. batch classification and the immediate
// execution pipeline.
//
// Classification combines a cheap regex scan for well-known bulk
// phrasings with one low-cost provider classification call. Either signal
// saying "batch" routes to batch; the regex doubles as the fast path (no
// classification call when it fires) and as the fallback when the
// classification call fails. A broken classifier degrades to immediate
// handling, never to a failed request.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use quizforge_common::document::{apply_patch, TestDocument};

use crate::cache::{cache_key, CachedResult, ResponseCache};
use crate::config::EngineConfig;
use crate::ledger::{PrecheckOutcome, SettleOutcome, TokenLedger};
use crate::parser::ResponseParser;
use crate::provider::AiProvider;
use crate::store::conversations::ConversationStore;
use crate::store::documents::DocumentStore;
use crate::store::messages::NewMessage;
use crate::store::meta_db::MetaDb;
use crate::tasks::store::{NewTask, TaskStore};
use crate::tasks::TaskPayload;

// ── Prompts ─────────────────────────────────────────────────────────

/// System prompt for authoring calls. The provider is asked for a JSON
/// envelope; the recovery parser copes when it doesn't comply.
pub const AUTHORING_SYSTEM_PROMPT: &str = "\
You are a test-authoring assistant for an online assessment platform.\n\
Respond with a single JSON object of the form\n\
  {\"message\": \"<short reply to the user>\", \"testUpdate\": { ... }}\n\
where testUpdate contains only the fields you changed. Edited sections\n\
must carry their complete question list. Omit testUpdate when no edit\n\
is requested. Output ONLY the JSON object, nothing else.";

/// System prompt for the execution-mode classification call.
pub const CLASSIFY_SYSTEM_PROMPT: &str = "\
Classify the user's request for a test-authoring assistant.\n\
Answer with exactly one word:\n\
  batch     - the request edits many sections or generates bulk content\n\
  immediate - everything else";

/// Build the user prompt for an authoring call: current document state,
/// optional section scope, then the user's message.
pub fn build_authoring_prompt(
    document: &TestDocument,
    message: &str,
    section: Option<&str>,
) -> String {
    let document_json =
        serde_json::to_string_pretty(document).unwrap_or_else(|_| "{}".to_string());

    let mut prompt = String::new();
    prompt.push_str("Current test document:\n");
    prompt.push_str(&document_json);
    prompt.push('\n');
    if let Some(section) = section {
        prompt.push_str(&format!("\nApply the request to the section named {section:?} only.\n"));
    }
    prompt.push_str("\nUser request:\n");
    prompt.push_str(message);
    prompt
}

// ── Classification ──────────────────────────────────────────────────

/// How a request is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Immediate,
    Batch,
}

fn bulk_request_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            vec![
                // "add 5 questions to each section"
                Regex::new(r"(?i)\badd\s+\d+\s+questions?\s+to\s+(each|every|all)\b")
                    .expect("bulk add pattern should compile"),
                // "create 4 sections with 10 questions"
                Regex::new(r"(?i)\bcreate\s+\d+\s+sections?\s+with\s+\d+\s+questions?\b")
                    .expect("bulk create pattern should compile"),
                // "... in/for each/every/all section(s)"
                Regex::new(r"(?i)\b(each|every|all)\s+(of\s+the\s+)?sections?\b")
                    .expect("per-section pattern should compile"),
                // "generate a full/complete/entire test"
                Regex::new(r"(?i)\bgenerate\s+(a\s+|the\s+)?(full|complete|entire|whole)\s+test\b")
                    .expect("full test pattern should compile"),
            ]
        })
        .as_slice()
}

/// Fast-path check for well-known bulk phrasings.
pub fn matches_bulk_pattern(message: &str) -> bool {
    bulk_request_patterns().iter().any(|p| p.is_match(message))
}

/// True when the bulk request is scoped per existing section, which is
/// what makes a parent task decomposable into children.
fn is_per_section_request(message: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)\b(each|every|all)\s+(of\s+the\s+)?sections?\b")
                .expect("per-section pattern should compile")
        })
        .is_match(message)
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Result of an immediate-path request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImmediateResult {
    pub reply_text: String,
    pub document: TestDocument,
    pub token_cost: i64,
    pub new_balance: i64,
    pub message_id: i64,
    pub cached: bool,
    pub truncated: bool,
}

/// What `dispatch` hands back to the controller layer.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Immediate(ImmediateResult),
    /// The request was queued; poll the task for completion.
    Queued { task_id: Uuid },
}

/// Input and storage errors surfaced to the caller. Upstream garbage is
/// never an error: the parser degrades it to a safe reply.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),
    #[error("conversation {0} is deleted")]
    ConversationDeleted(Uuid),
    #[error("insufficient tokens: balance {balance}, required {required}")]
    InsufficientTokens { balance: i64, required: i64 },
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

// ── Dispatcher ──────────────────────────────────────────────────────

/// Classifies incoming requests and drives the immediate pipeline; batch
/// requests become task records handed to the worker pool.
pub struct Dispatcher {
    db: Arc<Mutex<MetaDb>>,
    provider: Arc<dyn AiProvider>,
    config: EngineConfig,
    parser: ResponseParser,
    queue: mpsc::UnboundedSender<Uuid>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<Mutex<MetaDb>>,
        provider: Arc<dyn AiProvider>,
        config: EngineConfig,
        queue: mpsc::UnboundedSender<Uuid>,
    ) -> Self {
        let parser = ResponseParser::new(config.truncation_threshold);
        Self { db, provider, config, parser, queue }
    }

    /// Handle one user message: validate, pre-authorize, classify, route.
    pub async fn handle(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        message: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        // Validate + pre-authorize before any provider call (including
        // the classification call) is made.
        let document = {
            let db = self.db.lock().await;
            let conversation = ConversationStore::get(db.connection(), conversation_id)?
                .ok_or(DispatchError::ConversationNotFound(conversation_id))?;
            if conversation.is_deleted() {
                return Err(DispatchError::ConversationDeleted(conversation_id));
            }

            match TokenLedger::precheck(
                db.connection(),
                user_id,
                self.config.min_immediate_cost,
            )? {
                PrecheckOutcome::Ok { .. } => {}
                PrecheckOutcome::InsufficientFunds { balance, required } => {
                    return Err(DispatchError::InsufficientTokens { balance, required });
                }
            }

            DocumentStore::get_or_create(db.connection(), conversation_id, Utc::now())?
        };

        match self.classify(message).await {
            ExecutionMode::Batch => {
                let task_id =
                    self.enqueue_batch(conversation_id, user_id, message, &document).await?;
                Ok(DispatchOutcome::Queued { task_id })
            }
            ExecutionMode::Immediate => {
                let result =
                    self.run_immediate(conversation_id, user_id, message, document).await?;
                Ok(DispatchOutcome::Immediate(result))
            }
        }
    }

    /// Regex fast path first; otherwise one classification call, with a
    /// failed call degrading to immediate.
    async fn classify(&self, message: &str) -> ExecutionMode {
        if matches_bulk_pattern(message) {
            debug!("bulk pattern matched, skipping classification call");
            return ExecutionMode::Batch;
        }

        match self.provider.complete(CLASSIFY_SYSTEM_PROMPT, message).await {
            Ok(completion) => {
                if completion.text.trim().to_lowercase().contains("batch") {
                    ExecutionMode::Batch
                } else {
                    ExecutionMode::Immediate
                }
            }
            Err(error) => {
                warn!(%error, "classification call failed, falling back to immediate");
                ExecutionMode::Immediate
            }
        }
    }

    async fn run_immediate(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        message: &str,
        document: TestDocument,
    ) -> Result<ImmediateResult, DispatchError> {
        let key = cache_key(user_id, conversation_id, &document, message)?;

        let cached = {
            let db = self.db.lock().await;
            ResponseCache::get(db.connection(), &key, Utc::now())?
        };

        let (result, was_cached, provider_failed) = match cached {
            Some(hit) => {
                debug!(cache_key = %key, "response cache hit");
                (hit, true, false)
            }
            None => {
                let prompt = build_authoring_prompt(&document, message, None);
                match self.provider.complete(AUTHORING_SYSTEM_PROMPT, &prompt).await {
                    Ok(completion) => {
                        let parsed = self.parser.parse(&completion.text);
                        let token_cost = completion
                            .reported_tokens
                            .unwrap_or_else(|| self.config.estimate_cost(&parsed.reply_text));
                        let fresh = CachedResult {
                            reply_text: parsed.reply_text,
                            patch: parsed.patch,
                            token_cost,
                            truncated: parsed.truncated,
                        };
                        (fresh, false, false)
                    }
                    // Provider failure is upstream unreliability, not an
                    // input error: the caller gets a plain reply at zero
                    // cost. The outage reply is a local fabrication, not
                    // an AI outcome, so it must stay out of the cache and
                    // the next retry must reach the provider again.
                    Err(error) => {
                        warn!(%error, "provider call failed on immediate path");
                        let fallback = CachedResult {
                            reply_text: format!(
                                "The assistant is unavailable right now ({error})."
                            ),
                            patch: None,
                            token_cost: 0,
                            truncated: false,
                        };
                        (fallback, false, true)
                    }
                }
            }
        };
        let truncated = result.truncated;

        let mut db = self.db.lock().await;
        let now = Utc::now();

        // Cache hits still charge the cached cost: the cache saves
        // provider latency and spend, deliberately not user tokens.
        let settle_message =
            NewMessage::exchange(conversation_id, message, result.reply_text.clone(), now);
        let outcome = TokenLedger::settle(
            db.connection_mut(),
            user_id,
            conversation_id,
            result.token_cost,
            "immediate",
            Some(serde_json::json!({ "cached": was_cached, "truncated": truncated })),
            &settle_message,
            now,
        )?;
        let (new_balance, message_id) = match outcome {
            SettleOutcome::Applied { new_balance, message_id } => (new_balance, message_id),
            SettleOutcome::InsufficientFunds { balance, required } => {
                return Err(DispatchError::InsufficientTokens { balance, required });
            }
        };

        // Merge against the document as it is *now*: a batch completion
        // may have landed while the provider call was in flight.
        let current = DocumentStore::get_or_create(db.connection(), conversation_id, now)?;
        let updated = apply_patch(&current, result.patch.as_ref());
        if result.patch.is_some() {
            DocumentStore::save(db.connection(), conversation_id, &updated, now)?;
        }

        if !was_cached && !provider_failed {
            ResponseCache::put(
                db.connection(),
                &key,
                &result,
                chrono::Duration::hours(self.config.cache_ttl_hours),
                now,
            )?;
        }

        info!(
            conversation = %conversation_id,
            cost = result.token_cost,
            cached = was_cached,
            "immediate request settled"
        );

        Ok(ImmediateResult {
            reply_text: result.reply_text,
            document: updated,
            token_cost: result.token_cost,
            new_balance,
            message_id,
            cached: was_cached,
            truncated,
        })
    }

    /// Create the parent task (decomposed per section when the request
    /// calls for it), settle the flat batch cost once, and enqueue.
    async fn enqueue_batch(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        message: &str,
        document: &TestDocument,
    ) -> Result<Uuid, DispatchError> {
        let parent_id = Uuid::new_v4();
        let now = Utc::now();

        let section_names = if is_per_section_request(message) {
            document.section_names()
        } else {
            Vec::new()
        };

        let mut db = self.db.lock().await;

        // Flat cost settles first so a broke user never enqueues work.
        let mut settle_message = NewMessage::exchange(
            conversation_id,
            message,
            "Working on it. This request runs in the background.",
            now,
        );
        settle_message.task_ids = vec![parent_id];
        let outcome = TokenLedger::settle(
            db.connection_mut(),
            user_id,
            conversation_id,
            self.config.batch_flat_cost,
            "batch",
            Some(serde_json::json!({ "taskId": parent_id.to_string() })),
            &settle_message,
            now,
        )?;
        if let SettleOutcome::InsufficientFunds { balance, required } = outcome {
            return Err(DispatchError::InsufficientTokens { balance, required });
        }

        TaskStore::create(
            db.connection(),
            &NewTask {
                id: parent_id,
                conversation_id,
                owner_id: user_id.to_string(),
                parent_id: None,
                request_payload: serde_json::to_value(TaskPayload::whole_test(message))
                    .map_err(anyhow::Error::from)?,
                created_at: now,
            },
        )?;

        let mut leaf_ids = Vec::new();
        for name in &section_names {
            let child_id = Uuid::new_v4();
            TaskStore::create(
                db.connection(),
                &NewTask {
                    id: child_id,
                    conversation_id,
                    owner_id: user_id.to_string(),
                    parent_id: Some(parent_id),
                    request_payload: serde_json::to_value(TaskPayload::for_section(message, name))
                        .map_err(anyhow::Error::from)?,
                    created_at: now,
                },
            )?;
            leaf_ids.push(child_id);
        }
        if leaf_ids.is_empty() {
            // Standalone: the parent is itself the unit of work.
            leaf_ids.push(parent_id);
        }

        drop(db);

        for id in leaf_ids {
            if self.queue.send(id).is_err() {
                // Workers are down; the task stays pending and durable.
                warn!(task = %id, "task queue closed, task left pending");
            }
        }

        info!(
            conversation = %conversation_id,
            task = %parent_id,
            children = section_names.len(),
            "batch request enqueued"
        );
        Ok(parent_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;

    use chrono::Utc;
    use quizforge_common::document::Section;
    use quizforge_common::types::{Conversation, TaskStatus};

    use super::*;
    use crate::ledger::TokenLedger;
    use crate::provider::{Completion, ProviderError};
    use crate::store::messages::MessageStore;

    // ── Mock provider ───────────────────────────────────────────────

    struct ScriptedProvider {
        responses: StdMutex<VecDeque<Result<Completion, ProviderError>>>,
        calls: StdMutex<Vec<(String, String)>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<Completion, ProviderError>>) -> Self {
            Self {
                responses: StdMutex::new(VecDeque::from(responses)),
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().expect("calls lock poisoned").len()
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().expect("calls lock poisoned").clone()
        }
    }

    impl AiProvider for ScriptedProvider {
        fn complete(
            &self,
            system: &str,
            prompt: &str,
        ) -> Pin<Box<dyn Future<Output = Result<Completion, ProviderError>> + Send>> {
            self.calls
                .lock()
                .expect("calls lock poisoned")
                .push((system.to_string(), prompt.to_string()));
            let response = self
                .responses
                .lock()
                .expect("responses lock poisoned")
                .pop_front()
                .unwrap_or(Err(ProviderError::ConnectionFailed("script exhausted".into())));
            Box::pin(async move { response })
        }
    }

    // ── Fixtures ────────────────────────────────────────────────────

    struct Fixture {
        dispatcher: Dispatcher,
        db: Arc<Mutex<MetaDb>>,
        provider: Arc<ScriptedProvider>,
        queue_rx: mpsc::UnboundedReceiver<Uuid>,
        conversation_id: Uuid,
    }

    async fn fixture(responses: Vec<Result<Completion, ProviderError>>, balance: i64) -> Fixture {
        let mut meta = MetaDb::open_in_memory().expect("db should open");
        let conversation_id = Uuid::new_v4();
        ConversationStore::create(
            meta.connection(),
            &Conversation {
                id: conversation_id,
                owner_id: "user-1".into(),
                title: "Quiz".into(),
                deleted_at: None,
                created_at: Utc::now(),
            },
        )
        .expect("conversation should insert");
        if balance > 0 {
            TokenLedger::grant(meta.connection_mut(), "user-1", balance, "seed", Utc::now())
                .expect("grant should succeed");
        }

        let db = Arc::new(Mutex::new(meta));
        let provider = Arc::new(ScriptedProvider::new(responses));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            db.clone(),
            provider.clone(),
            EngineConfig::default(),
            queue_tx,
        );

        Fixture { dispatcher, db, provider, queue_rx, conversation_id }
    }

    fn edit_response(reply: &str, title: &str) -> Result<Completion, ProviderError> {
        Ok(Completion::text(format!(
            r#"{{"message": "{reply}", "testUpdate": {{"title": "{title}"}}}}"#
        )))
    }

    // ── Classification ──────────────────────────────────────────────

    #[test]
    fn bulk_patterns_match_known_phrasings() {
        assert!(matches_bulk_pattern("add 5 questions to each section"));
        assert!(matches_bulk_pattern("Create 3 sections with 10 questions each"));
        assert!(matches_bulk_pattern("please generate a full test on biology"));
        assert!(matches_bulk_pattern("rewrite every section"));
        assert!(!matches_bulk_pattern("fix the typo in question 2"));
        assert!(!matches_bulk_pattern("add one question about photosynthesis"));
    }

    #[tokio::test]
    async fn regex_fast_path_skips_the_classification_call() {
        let f = fixture(Vec::new(), 100).await;
        let mode = f.dispatcher.classify("add 5 questions to each section").await;
        assert_eq!(mode, ExecutionMode::Batch);
        assert_eq!(f.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn classifier_batch_verdict_routes_to_batch() {
        let f = fixture(vec![Ok(Completion::text("batch"))], 100).await;
        let mode = f.dispatcher.classify("make this test much harder overall").await;
        assert_eq!(mode, ExecutionMode::Batch);
        assert_eq!(f.provider.call_count(), 1);
        assert_eq!(f.provider.calls()[0].0, CLASSIFY_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn classifier_failure_degrades_to_immediate() {
        let f = fixture(
            vec![Err(ProviderError::ConnectionFailed("down".into()))],
            100,
        )
        .await;
        let mode = f.dispatcher.classify("change the title please").await;
        assert_eq!(mode, ExecutionMode::Immediate);
    }

    // ── Immediate path ──────────────────────────────────────────────

    #[tokio::test]
    async fn immediate_path_merges_settles_and_persists() {
        let f = fixture(
            vec![
                Ok(Completion::text("immediate")), // classification
                edit_response("Renamed the test.", "Biology Final"),
            ],
            100,
        )
        .await;

        let outcome = f
            .dispatcher
            .handle(f.conversation_id, "user-1", "rename the test to Biology Final")
            .await
            .expect("dispatch should succeed");

        let DispatchOutcome::Immediate(result) = outcome else {
            panic!("expected immediate outcome");
        };
        assert_eq!(result.reply_text, "Renamed the test.");
        assert_eq!(result.document.title.as_deref(), Some("Biology Final"));
        assert!(!result.cached);
        assert!(result.token_cost > 0);
        assert_eq!(result.new_balance, 100 - result.token_cost);

        let db = f.db.lock().await;
        let stored = DocumentStore::get(db.connection(), f.conversation_id)
            .expect("document should load")
            .expect("document should exist");
        assert_eq!(stored.title.as_deref(), Some("Biology Final"));

        let messages = MessageStore::list_by_conversation(db.connection(), f.conversation_id)
            .expect("messages should load");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].reply_text.as_deref(), Some("Renamed the test."));
    }

    #[tokio::test]
    async fn precheck_denial_happens_before_any_provider_call() {
        let f = fixture(Vec::new(), 2).await; // below min_immediate_cost

        let error = f
            .dispatcher
            .handle(f.conversation_id, "user-1", "change the title")
            .await
            .expect_err("dispatch should be denied");

        assert!(matches!(
            error,
            DispatchError::InsufficientTokens { balance: 2, required: 5 }
        ));
        assert_eq!(f.provider.call_count(), 0, "no provider call on denial");
    }

    #[tokio::test]
    async fn missing_conversation_is_an_input_error() {
        let f = fixture(Vec::new(), 100).await;
        let error = f
            .dispatcher
            .handle(Uuid::new_v4(), "user-1", "hello")
            .await
            .expect_err("dispatch should fail");
        assert!(matches!(error, DispatchError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn deleted_conversation_is_rejected() {
        let f = fixture(Vec::new(), 100).await;
        {
            let db = f.db.lock().await;
            ConversationStore::soft_delete(db.connection(), f.conversation_id, Utc::now())
                .expect("soft delete should succeed");
        }

        let error = f
            .dispatcher
            .handle(f.conversation_id, "user-1", "hello")
            .await
            .expect_err("dispatch should fail");
        assert!(matches!(error, DispatchError::ConversationDeleted(_)));
    }

    #[tokio::test]
    async fn garbage_provider_output_degrades_to_plain_reply() {
        let f = fixture(
            vec![
                Ok(Completion::text("immediate")),
                Ok(Completion::text("Sorry, I got confused there.")),
            ],
            100,
        )
        .await;

        let outcome = f
            .dispatcher
            .handle(f.conversation_id, "user-1", "do something strange")
            .await
            .expect("dispatch should succeed");

        let DispatchOutcome::Immediate(result) = outcome else {
            panic!("expected immediate outcome");
        };
        assert_eq!(result.reply_text, "Sorry, I got confused there.");
        assert_eq!(result.document, TestDocument::default());
    }

    #[tokio::test]
    async fn outage_replies_are_not_cached_so_a_recovered_provider_is_reached() {
        let f = fixture(
            vec![
                Ok(Completion::text("immediate")),
                Err(ProviderError::ConnectionFailed("upstream down".into())),
                Ok(Completion::text("immediate")),
                edit_response("Recovered.", "Back Online"),
            ],
            100,
        )
        .await;

        let first = f
            .dispatcher
            .handle(f.conversation_id, "user-1", "rename the test")
            .await
            .expect("first dispatch should succeed");
        let DispatchOutcome::Immediate(first) = first else {
            panic!("expected immediate outcome");
        };
        assert!(first.reply_text.contains("unavailable"));
        assert!(!first.cached);
        assert_eq!(first.token_cost, 0);

        let second = f
            .dispatcher
            .handle(f.conversation_id, "user-1", "rename the test")
            .await
            .expect("second dispatch should succeed");
        let DispatchOutcome::Immediate(second) = second else {
            panic!("expected immediate outcome");
        };
        assert!(!second.cached, "outage reply must not be served from cache");
        assert_eq!(second.reply_text, "Recovered.");
        assert_eq!(second.document.title.as_deref(), Some("Back Online"));
        assert_eq!(f.provider.call_count(), 4, "retry must reach the provider");
    }

    #[tokio::test]
    async fn cache_hit_replays_the_truncation_flag() {
        // An oversized dangling-JSON response marks the first result
        // truncated; the idempotent replay must report the same flag.
        let broken = format!("{{{}", "x".repeat(600));
        let f = fixture(
            vec![
                Ok(Completion::text("immediate")),
                Ok(Completion::text(broken)),
                Ok(Completion::text("immediate")),
            ],
            100,
        )
        .await;

        let first = f
            .dispatcher
            .handle(f.conversation_id, "user-1", "write the whole thing out")
            .await
            .expect("first dispatch should succeed");
        let DispatchOutcome::Immediate(first) = first else {
            panic!("expected immediate outcome");
        };
        assert!(first.truncated);

        let second = f
            .dispatcher
            .handle(f.conversation_id, "user-1", "write the whole thing out")
            .await
            .expect("second dispatch should succeed");
        let DispatchOutcome::Immediate(second) = second else {
            panic!("expected immediate outcome");
        };
        assert!(second.cached);
        assert!(second.truncated, "replay must carry the original flag");
        assert_eq!(second.reply_text, first.reply_text);
    }

    // ── Batch path ──────────────────────────────────────────────────

    #[tokio::test]
    async fn per_section_batch_creates_children_and_debits_flat_cost_once() {
        let mut f = fixture(Vec::new(), 200).await; // regex fires, classifier never called
        {
            let db = f.db.lock().await;
            let mut document = TestDocument::default();
            for name in ["Mechanics", "Optics"] {
                document.sections.push(Section {
                    name: name.into(),
                    duration: None,
                    questions: Vec::new(),
                });
            }
            DocumentStore::save(db.connection(), f.conversation_id, &document, Utc::now())
                .expect("document should save");
        }

        let outcome = f
            .dispatcher
            .handle(f.conversation_id, "user-1", "add 5 questions to each section")
            .await
            .expect("dispatch should succeed");

        let DispatchOutcome::Queued { task_id } = outcome else {
            panic!("expected queued outcome");
        };

        let db = f.db.lock().await;
        let parent = TaskStore::get(db.connection(), task_id)
            .expect("task should load")
            .expect("parent should exist");
        assert_eq!(parent.status, TaskStatus::Pending);
        assert!(parent.parent_id.is_none());

        let children = TaskStore::children(db.connection(), task_id)
            .expect("children should load");
        assert_eq!(children.len(), 2);

        // Exactly one flat debit.
        let transactions =
            TokenLedger::transactions(db.connection(), "user-1").expect("transactions");
        let debits: Vec<_> = transactions.iter().filter(|t| t.amount < 0).collect();
        assert_eq!(debits.len(), 1);
        assert_eq!(debits[0].amount, -EngineConfig::default().batch_flat_cost);

        // Both children were handed to the queue.
        drop(db);
        let mut queued = Vec::new();
        while let Ok(id) = f.queue_rx.try_recv() {
            queued.push(id);
        }
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|id| children.iter().any(|c| c.id == *id)));
    }

    #[tokio::test]
    async fn batch_without_sections_enqueues_the_parent_itself() {
        let mut f = fixture(Vec::new(), 200).await;

        let outcome = f
            .dispatcher
            .handle(f.conversation_id, "user-1", "generate a full test on astronomy")
            .await
            .expect("dispatch should succeed");

        let DispatchOutcome::Queued { task_id } = outcome else {
            panic!("expected queued outcome");
        };

        assert_eq!(f.queue_rx.try_recv().expect("one queued id"), task_id);
        assert!(f.queue_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn batch_records_the_user_message_with_the_task_id() {
        let f = fixture(Vec::new(), 200).await;

        let outcome = f
            .dispatcher
            .handle(f.conversation_id, "user-1", "generate a full test on rivers")
            .await
            .expect("dispatch should succeed");
        let DispatchOutcome::Queued { task_id } = outcome else {
            panic!("expected queued outcome");
        };

        let db = f.db.lock().await;
        let messages = MessageStore::list_by_conversation(db.connection(), f.conversation_id)
            .expect("messages should load");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].task_ids, vec![task_id]);
    }
}
