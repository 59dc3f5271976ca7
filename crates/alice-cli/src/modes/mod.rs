//! Runtime execution modes.
//!
//! - `bridge`: JSON-lines runtime over stdin/stdout

pub mod bridge;
