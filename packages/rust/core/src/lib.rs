//! Pipeline orchestration and domain logic for Gleaner.
//!
//! This crate ties the scheduler, crawler, normalizer and evaluator together:
//! - [`scheduler`]: when each source is due, crawl timeouts, failure streaks
//! - [`normalizer`]: the artifact state machine around extraction
//! - [`evaluator`]: rubric scoring through an injected policy
//! - [`pipeline`]: end-to-end runs (`gleaner run`, `gleaner crawl`)
//! - [`workers`]: the bounded blocking pool for CPU-bound stages

pub mod evaluator;
pub mod normalizer;
pub mod pipeline;
pub mod scheduler;
pub mod workers;

pub use evaluator::{
    EvaluateOptions, EvaluationOutcome, Evaluator, KeywordPolicy, Score, ScoringPolicy,
};
pub use normalizer::{
    NormalizeSummary, Normalizer, ProcessingOptions, ProcessingRequest, ProcessingResponse,
};
pub use pipeline::{
    Pipeline, PipelineConfig, ProgressReporter, RunSummary, SilentProgress, TickSummary,
};
pub use scheduler::{
    Clock, ManualClock, RunDisposition, RunOutcome, ScheduleState, Scheduler, SchedulerConfig,
    SourceSchedule, SystemClock, seed_state,
};
pub use workers::BlockingPool;
