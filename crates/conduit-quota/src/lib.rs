pub mod controller;
pub mod types;

pub use controller::QuotaController;
pub use types::{CompletionOptions, Decision, DenyCode, QuotaConfig, RequestOptions};
