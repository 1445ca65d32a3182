//! This crate's error boundary is `mp_common::PipelineError`; every stage
//! converts into it rather than defining its own enum, so the HTTP API and
//! the Supervisor only ever need to match on one type.

pub use mp_common::{PipelineError, Result};
