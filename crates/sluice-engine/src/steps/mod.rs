//! Node implementations: precondition wait, bulk load, per-partition
//! transform/project, and the join barrier.

pub mod join;
pub mod load;
pub mod partition;
pub mod wait;

pub use join::JoinBarrier;
pub use load::LoadStep;
pub use partition::{PartitionPipeline, ProjectStep, Projection, TransformStep};
pub use wait::{PreconditionWaiter, WaitStep};
