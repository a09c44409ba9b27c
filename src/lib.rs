// Library interface for the service supervisor
// This allows integration tests to drive the supervisor internals directly

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod registry;
pub mod service;
pub mod status;
pub mod supervisor;
pub mod sys;
