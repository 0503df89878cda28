//! Test support utilities for queue and dispatcher integration tests

pub mod harness;
pub mod mock_sender;

pub use harness::TestHarness;
pub use mock_sender::{MockSender, Response};
