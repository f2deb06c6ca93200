// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice,
    dead_code
)]

//! Common test utilities shared across all test targets
//!
//! [`FakeCluster`] stands in for every external system at once: the control
//! plane, the backup repository, object storage, the database containers and
//! pod metadata. [`TestUnit`] wires one unit's agent against it, sharing an
//! in-memory cluster document with every other unit.
//!
//! # Usage
//!
//! Include this module in your test file:
//! ```rust,ignore
//! #[path = "../common/mod.rs"]
//! mod common;
//! use common::*;
//! ```


pub use fakes::*;
pub use harness::*;
