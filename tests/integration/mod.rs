//! Integration tests module
//!
//! This module organizes all integration tests for the voicepool crate.

pub mod binding_test;
pub mod buffer_test;
pub mod loader_test;
pub mod source_test;
