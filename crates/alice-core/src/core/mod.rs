//! Core module: UI-agnostic domain and runtime.
//!
//! This module contains:
//! - `agent`: Turn orchestration (stream, classify, execute, loop)
//! - `context`: System prompt assembly from memory and skills
//! - `conversation`: Message history
//! - `events`: Presentation event types and channels
//! - `interrupt`: Input queue shared by lines and interrupts

pub mod agent;
pub mod context;
pub mod conversation;
pub mod events;
pub mod interrupt;
