//! Per-topic fan-out: one upstream consumer, many local subscriber queues.

mod pump;
mod registry;

pub use pump::{FanOutPump, TopicSubscription};
pub use registry::PumpRegistry;
