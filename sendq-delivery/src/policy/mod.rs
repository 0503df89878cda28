//! Policy abstractions for delivery operations.
//!
//! - [`RetryPolicy`]: decides an item's next state from the outcome of an attempt

pub mod retry;

pub use retry::RetryPolicy;
