//! Durable task-execution engine.
//!
//! Users submit a named task with a JSON input; the engine runs that task's
//! handler (a Lua chunk) inside a sandbox. Every external call the handler
//! makes suspends the frame: the continuation is persisted, the call is
//! dispatched as a child stack run, and the parent later resumes with the
//! child's result by re-running the handler and replaying its recorded call
//! history. The execution graph is a dynamic tree whose every node survives
//! process crashes and is individually re-entrant.
//!
//! The moving parts:
//!
//! - [`store::RunStore`] — source of truth for task runs and stack runs,
//!   enforcing the status transition table.
//! - [`dispatcher::Dispatcher`] — claims ready stack runs, drives them
//!   through the runner or the module gateway, propagates results up the
//!   tree and self-triggers to keep draining.
//! - [`runner::TaskRunner`] — the sandboxed Lua runner with the
//!   external-call intercept and replay cursor.
//! - [`gateway::ModuleGateway`] — thin shim to out-of-core module services.
//! - [`engine::TaskEngine`] — facade wiring the above together.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod runner;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod types;
