pub mod context;
pub mod db;
pub mod error;
pub mod history;
pub mod types;

pub use context::{ContextManager, ManageOptions, NoopSummarizer, Summarizer};
pub use history::HistoryStore;
