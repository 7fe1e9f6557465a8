//! Integration tests for reelforge.
//!
//! Library-level tests drive sessions and orchestrators with scripted
//! backends; the CLI tests run the `reelforge` binary against the dry-run
//! backend.

mod budget_gate;
mod checkpoint_resume;
mod cli;
mod common;
mod rate_limit;
