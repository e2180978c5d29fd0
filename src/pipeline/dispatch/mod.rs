//! Background job execution: a durable queue, a pool of worker threads and
//! the stale-job sweeper.

pub mod queue;
pub mod sweep;
pub mod worker;

pub use queue::{AnalysisJob, analysis_payload, claim, enqueue_analysis, enqueue_extraction};
pub use sweep::{recover_stale_jobs, SweepReport, ABANDONED_MESSAGE};
pub use worker::{DispatcherHandle, JobDispatcher, JobReport};
