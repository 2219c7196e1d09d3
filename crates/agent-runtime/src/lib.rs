//! Orchestrator process loop, agent runner, and HTTP/webhook surface for
//! the task orchestration engine. `main.rs` is a thin CLI/server shell over
//! this library so integration tests can drive the `Orchestrator` directly
//! against mock `VcsAdapter`/`LlmAdapter` implementations.

pub mod config;
pub mod contracts;
pub mod orchestrator;
pub mod state_machine;
