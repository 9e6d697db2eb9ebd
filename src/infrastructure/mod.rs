pub mod batch_store;
pub mod checkpoint_store;
pub mod clock;
pub mod fs_atomic;
pub mod job_store;

pub use batch_store::BatchStore;
pub use checkpoint_store::CheckpointStore;
pub use clock::{Clock, InstantClock, SystemClock};
pub use job_store::JobStore;
