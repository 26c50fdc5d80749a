pub mod error;
pub mod registry;
pub mod types;

pub use error::SessionError;
pub use registry::SessionRegistry;
pub use types::{SessionMetadata, UsageUpdate};
