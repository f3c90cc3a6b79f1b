pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod queue;

pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, QueuePosition, QueueStats};
pub use executor::AttemptExecutor;
pub use metrics::DispatcherMetrics;
pub use pool::{SlotGuard, SlotInfo, WorkerPool, WorkerPoolBuilder};
pub use queue::PriorityQueue;
