//! foreman — a tool-calling agent core with delegated worker execution.
//!
//! Two coupled pieces: a guarded tool-calling loop (model turn → tool calls →
//! results → next turn, with runaway protection), and a worker runtime that
//! delegates instructions to isolated backends — an in-process agent, or
//! supervised CLI subprocesses run locally or inside a container — with
//! transparent fallback, timeouts, and cooperative cancellation. Task
//! lifecycle is recorded in an append-only ledger backed by libSQL.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod llm;
pub mod store;
pub mod surface;
pub mod tools;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
