// tests/property/mod.rs

//! Property-based tests for the backup subsystem.

pub mod consistency_test;
pub mod roundtrip_test;
