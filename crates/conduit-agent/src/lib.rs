pub mod fleet;
pub mod llm_client;
pub mod orchestrator;
pub mod ports;
pub mod provider;
pub mod request_tracker;
pub mod stream;
pub mod summarizer;
pub mod types;

pub use fleet::{LlmRequest, NodeFleetManager, ProxyResult, Usage};
pub use orchestrator::{ChatInput, ChatOrchestrator, ChatResult};
pub use ports::{
    AllowAllEthicsReviewer, EthicsInput, EthicsReviewer, EthicsVerdict, NoopPlaybookMatcher,
    OrchestratorError, PlaybookInput, PlaybookMatch, PlaybookMatcher, SingleRoundStrategy,
    StrategyEngine, StrategyInput, StrategyOutput,
};
pub use provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
pub use request_tracker::RequestTracker;
