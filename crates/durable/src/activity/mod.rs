//! Activity abstractions
//!
//! Activities are units of work called by workflows. They:
//! - Resolve by name through the registry at call time
//! - Run inline on the worker executing their workflow
//! - Leave one durable execution record per call

mod context;
mod definition;

pub use context::ActivityContext;
pub use definition::{
    Activity, ActivityError, PANIC_ERROR, SERIALIZATION_ERROR, UNKNOWN_HANDLER_ERROR,
};
