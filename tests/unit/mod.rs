// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for the lifecycle agent
//!
//! Each test drives one or more units' dispatchers against a shared fake
//! cluster:
//! - Bootstrap, membership and synchronous replication
//! - Signal deferral and replay
//! - The cluster-wide operation lock
//! - Backup preconditions and runs
//! - Restore, including failures and completion
//! - TLS server placement across failover

#[path = "../common/mod.rs"]
mod common;

mod dispatcher;
mod operation;
mod restore;
mod tls;
