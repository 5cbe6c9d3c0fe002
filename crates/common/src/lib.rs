// quizforge-common: shared types and the canonical test document model.

pub mod document;
pub mod types;
