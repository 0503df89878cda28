pub mod logging;
pub mod status;

pub use status::{QueueStatus, TrackingStatus, UnknownStatus};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
