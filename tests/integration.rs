//! Integration tests entry point
//!
//! - Attempt pipeline against a mock upstream and the in-memory store
//! - Workers, offload lane, controller and gap mode
//! - Analytics hand-off from the writer to the batcher

mod common;
mod integration_tests;
