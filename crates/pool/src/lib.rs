pub mod executor;
pub mod isolate_pool;

pub use executor::{ExecError, ExecutionResult, Executor, Invocation};
pub use isolate_pool::{PoolConfig, PoolMetrics, SchedulerStrategy, WorkerPool};
