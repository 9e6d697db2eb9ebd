pub mod atom;
pub mod batch;
pub mod checkpoint;
pub mod item;
pub mod job;
pub mod loaders;
pub mod phase;

pub use atom::KnowledgeAtom;
pub use batch::{
    BatchRequest, BatchResultLine, BatchScope, BatchState, BatchSubmission, ExternalJob,
    ExternalJobState,
};
pub use checkpoint::{
    EnrichOutput, FinalizeOutput, GenerateOutput, PhasePayload, PhaseRecord, PhaseState,
    PlanOutput, PlanSlot, ValidateOutput,
};
pub use item::{
    DistanceLevel, Exemplar, GeneratedItem, ItemContent, ItemFailure, RejectReason, RejectedItem,
};
pub use job::{FailedItem, Job, JobParams, JobProgress, JobStatus, ResumeMode};
pub use loaders::{load_all_atoms, load_atom_file};
pub use phase::{Phase, PhaseTarget, UnitState};
