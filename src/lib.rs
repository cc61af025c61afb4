//! Multilingual benchmark evaluation for chat models.
//!
//! A run loads a task's categories, sends inference (and optionally
//! translation and judge) jobs through staged model clients, and aggregates
//! per-category scores. See [`evaluation::Evaluator`] for the entry point.

pub mod client;
pub mod code_eval;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod evaluation;
pub mod metrics;
pub mod persist;
pub mod sandbox;
pub mod supervisor;
pub mod task;
pub mod template;
