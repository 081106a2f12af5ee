pub mod graph;
pub mod pipeline;
pub mod run;
pub mod scheduler;
pub mod step;
pub mod steps;

pub use graph::{Edge, GraphTemplate, TemplateNode};
pub use pipeline::{Capabilities, IngestPipeline};
pub use run::{NodeFailure, NodeOutcome, RunResult, RunStatus};
pub use scheduler::{ActiveRunGuard, ActiveRuns, GraphScheduler};
pub use step::{Step, StepContext, UpstreamStatus};
pub use steps::{
    JoinBarrier, LoadStep, PartitionPipeline, PreconditionWaiter, ProjectStep, Projection,
    TransformStep, WaitStep,
};
