//! Integration tests module
//!
//! End-to-end tests for the crawler, including:
//! - Fetch → classify → normalize → transactional write
//! - Worker retry lanes, escalation and the recovery log
//! - Analytics queue hand-off and batch acknowledgement

pub mod analytics_test;
pub mod crawl_test;
pub mod pipeline_test;
