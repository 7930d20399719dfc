//! End-to-end acceptance tests for the DCP slave.
//!
//! Each scenario drives one or two slaves through complete DCP sessions:
//! - Two slaves exchanging data in non-real-time lockstep
//! - Sequence supervision on data channels
//! - Heartbeat loss, error resolution and reset

mod common;
mod cosim_test;
mod recovery_test;
mod sequence_test;
