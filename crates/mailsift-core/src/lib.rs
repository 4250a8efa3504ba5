//! mailsift Core - milter sessions and verdict aggregation
//!
//! This crate provides the milter session state machine, the checker
//! module interface with its built-in modules, and the aggregator that
//! turns concurrent module opinions into one verdict per message.

pub mod error;
pub mod headers;
pub mod metrics;
pub mod milter;
pub mod modules;
pub mod session;
pub mod verdict;

pub use error::{MilterError, MilterResult};
pub use headers::HeaderMutation;
pub use metrics::Metrics;
pub use milter::{make_callbacks, EomOutcome, Filter, Reply};
pub use modules::{CheckContext, MessageCheckResult, Module, ModuleRegistry};
pub use session::{Message, MilterSession, SessionRegistry, SessionState, Stage};
pub use verdict::{Aggregator, Verdict};
