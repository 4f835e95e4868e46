//! conveyor - durable multi-worker pipeline engine
//!
//! A SQLite-backed job queue drives each submitted run through the fixed
//! plan → implement → review → test → pr pipeline. Parallel workers
//! coordinate through single-claim job transactions and per-run leases;
//! progress is carried across phase boundaries by an artifact-backed
//! handoff document.

pub mod exec;
pub mod executor;
pub mod git;
pub mod phases;
pub mod queue;
pub mod status;
pub mod submit;
pub mod worker;
pub mod workspace;
