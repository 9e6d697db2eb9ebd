pub mod batch_manager;
pub mod duplicate_gate;
pub mod fingerprint;
pub mod inference;
pub mod prompts;
pub mod reject_log;
pub mod retry;

pub use batch_manager::{BatchLifecycleManager, BatchRun, PollSettings};
pub use duplicate_gate::{Admission, CandidatePool, DuplicateGate, GateOutcome, GatePolicy};
pub use inference::FallbackInference;
pub use prompts::{DefaultPrompts, PromptSource, Verdict};
pub use reject_log::RejectLog;
pub use retry::RetryPolicy;
