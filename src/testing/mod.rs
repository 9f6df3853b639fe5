//! Testing utilities and mock implementations
//!
//! Mocks for the transport and discovery seams, so orchestration behavior
//! can be tested without reaching real agents.

pub mod mocks;

pub use mocks::*;
