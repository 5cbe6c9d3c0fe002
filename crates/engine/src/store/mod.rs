pub mod conversations;
pub mod documents;
pub mod messages;
pub mod meta_db;
