pub mod questdb;
pub mod questdb_ilp;

pub use questdb::QuestDbQuery;
pub use questdb_ilp::{IlpWriterOptions, QuestDbIlpWriter};
