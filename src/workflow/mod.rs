pub mod handlers;
pub mod phase_flow;
pub mod unit_ctx;

pub use handlers::{EnrichHandler, FinalizeHandler, GenerateHandler, PlanHandler, ValidateHandler};
pub use phase_flow::{PhaseFailure, PhaseHandler, PhaseOrchestrator, PhaseOutcome, UnitRun};
pub use unit_ctx::UnitCtx;
