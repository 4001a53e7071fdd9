//! Logic Module - Detection Pipeline & Engine Hot-Reload
//!
//! ## Layout
//! - `agent/` - Shared agent state, ingestion loop, engine rebuild
//! - `engine/`, `sync` - Rule engine and integrity-checked rule/container sync
//! - `hooks/` - Pre/post detection hook pipeline
//! - `scheduler/` - Background loops (refresh, upload, cleanup, commands, cron)
//! - `commands/` - Manager command dispatch and report

// Core pipeline
pub mod agent;
pub mod engine;
pub mod event;
pub mod hooks;
pub mod sync;
pub mod tracker;

// Background work
pub mod compress;
pub mod scheduler;
pub mod semaphore;
pub mod signal;

// Manager & I/O
pub mod commands;
pub mod forwarder;
pub mod manager;
pub mod source;

// Support
pub mod audit;
pub mod canary;
pub mod config;
pub mod integrity;

#[cfg(test)]
pub mod testing;
