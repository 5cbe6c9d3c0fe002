// quizforge-engine: the AI-assisted test-authoring orchestrator.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod ledger;
pub mod parser;
pub mod provider;
pub mod store;
pub mod tasks;
