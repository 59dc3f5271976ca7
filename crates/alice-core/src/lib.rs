//! Core Alice library (turn loop, stream classifier, sandbox, providers, config).

pub mod config;
pub mod core;
pub mod providers;
pub mod skills;
pub mod stream;
pub mod tools;
