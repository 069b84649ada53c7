//! Tower middleware layers for the invocation pipeline.
//!
//! - [`load_shed`]: Lag-based admission control
//! - [`metrics`]: Invocation span, timing and counting
//! - [`pipeline`]: Composes all layers around the executor

pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_invocation_pipeline, InvocationPipeline};
