//! Streamguard - in-flight media interception and content scanning
//!
//! Responses carrying images or video are buffered as they stream in,
//! scanned incrementally by an external scoring engine, and released,
//! replaced or passed through depending on the verdict.

pub mod config;
pub mod context;
pub mod engine;
pub mod filter;
pub mod liveness;
pub mod runtime;
pub mod scheduler;
pub mod status;
pub mod streams;
pub mod watchdog;
pub mod whitelist;
pub mod zone;

pub use context::PipelineContext;
pub use filter::{ResponseDetails, ResponseFilter, SessionHandle, StreamFilterController};
pub use runtime::Pipeline;
