//! Worker pool for guest invocations.
//!
//! Architecture:
//! - N worker threads, each with its own current-thread tokio runtime
//! - `JsRuntime` is !Send, so every isolate lives and dies on its worker
//! - Requests are routed least-loaded by default, or by consistent hash of
//!   the snippet namespace
//! - Requests that wait in a queue longer than the queue timeout are
//!   rejected with 503 without running

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use host::{Bridge, HostServices};
use tokio::sync::{mpsc, oneshot};

use crate::executor::{ExecError, ExecutionResult, Executor, Invocation};

// ========== Configuration ==========

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads (default: num_cpus)
    pub num_workers: usize,
    /// Wall-clock budget per invocation in milliseconds
    pub execution_timeout_ms: u64,
    /// Max time a request can sit in the queue in milliseconds (0 = no timeout)
    pub queue_timeout_ms: u64,
    /// Scheduler strategy for routing requests to workers
    pub scheduler_strategy: SchedulerStrategy,
    /// Pin workers to cores when the platform reports them
    pub pin_workers: bool,
}

pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 30_000;

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            execution_timeout_ms: DEFAULT_EXECUTION_TIMEOUT_MS,
            queue_timeout_ms: 10_000,
            scheduler_strategy: SchedulerStrategy::LeastLoaded,
            pin_workers: true,
        }
    }
}

impl PoolConfig {
    /// Apply environment overrides on top of `self`
    ///
    /// Environment variables:
    /// - FN_WORKERS: Number of worker threads
    /// - FN_EXECUTION_TIMEOUT_MS: Execution budget in ms
    /// - FN_QUEUE_TIMEOUT_MS: Queue timeout in ms (0 = no timeout)
    /// - FN_SCHEDULER: "consistent" or "least_loaded"
    pub fn with_env(self) -> Self {
        Self {
            num_workers: std::env::var("FN_WORKERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(self.num_workers),
            execution_timeout_ms: std::env::var("FN_EXECUTION_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|ms: &u64| *ms > 0)
                .unwrap_or(self.execution_timeout_ms),
            queue_timeout_ms: std::env::var("FN_QUEUE_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(self.queue_timeout_ms),
            scheduler_strategy: std::env::var("FN_SCHEDULER")
                .ok()
                .and_then(|value| SchedulerStrategy::parse(&value))
                .unwrap_or(self.scheduler_strategy),
            pin_workers: self.pin_workers,
        }
    }

    pub fn execution_budget(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms.max(1))
    }
}

fn default_num_workers() -> usize {
    num_cpus::get().max(1)
}

/// Scheduler strategy for routing requests to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStrategy {
    ConsistentHash,
    LeastLoaded,
}

impl SchedulerStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "consistent" | "hash" => Some(Self::ConsistentHash),
            "least_loaded" | "least" => Some(Self::LeastLoaded),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            SchedulerStrategy::ConsistentHash => "consistent_hash",
            SchedulerStrategy::LeastLoaded => "least_loaded",
        }
    }
}

// ========== Pool Metrics ==========

/// Metrics for monitoring pool health
#[derive(Default)]
pub struct PoolMetrics {
    pub total_requests: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub timeouts: AtomicU64,
    pub queue_timeouts: AtomicU64,
}

impl PoolMetrics {
    fn record(&self, result: &Result<ExecutionResult, ExecError>) {
        match result {
            Ok(_) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if err.is_timeout() {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Get metrics as a JSON-serializable snapshot
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "succeeded": self.succeeded.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "timeouts": self.timeouts.load(Ordering::Relaxed),
            "queue_timeouts": self.queue_timeouts.load(Ordering::Relaxed),
        })
    }
}

/// Load stats for a worker (used by scheduler)
#[derive(Default)]
struct WorkerLoad {
    queued_requests: AtomicUsize,
    active_requests: AtomicUsize,
}

// ========== Worker Handle ==========

struct WorkerRequest {
    invocation: Invocation,
    request_id: String,
    enqueued_at: Instant,
    response_tx: oneshot::Sender<Result<ExecutionResult, ExecError>>,
}

/// Handle to communicate with a worker thread
struct WorkerHandle {
    request_tx: mpsc::UnboundedSender<WorkerRequest>,
    load: Arc<WorkerLoad>,
    #[allow(dead_code)]
    thread: JoinHandle<()>,
}

// ========== Main Pool ==========

/// The worker pool manager
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    config: PoolConfig,
    metrics: Arc<PoolMetrics>,
    request_seq: AtomicU64,
}

impl WorkerPool {
    /// Spawn `config.num_workers` threads sharing `services`.
    pub fn new(config: PoolConfig, services: Arc<HostServices>, bridge: Bridge) -> Self {
        let metrics = Arc::new(PoolMetrics::default());
        let num_workers = config.num_workers.max(1);
        let mut workers = Vec::with_capacity(num_workers);
        let core_ids = if config.pin_workers {
            core_affinity::get_core_ids()
        } else {
            None
        };

        tracing::info!(
            "Initializing worker pool: {} workers, {}ms execution budget, scheduler {}",
            num_workers,
            config.execution_timeout_ms,
            config.scheduler_strategy.name()
        );

        for worker_id in 0..num_workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let load = Arc::new(WorkerLoad::default());
            let core_id = core_ids
                .as_ref()
                .and_then(|ids| ids.get(worker_id % ids.len().max(1)).cloned());
            let worker = WorkerThread {
                worker_id,
                queue_timeout: Duration::from_millis(config.queue_timeout_ms),
                metrics: Arc::clone(&metrics),
                load: Arc::clone(&load),
                executor: Executor::new(
                    Arc::clone(&services),
                    bridge.clone(),
                    config.execution_budget(),
                ),
            };

            let thread = thread::Builder::new()
                .name(format!("fn-worker-{}", worker_id))
                .spawn(move || {
                    if let Some(core_id) = core_id {
                        core_affinity::set_for_current(core_id);
                    }
                    worker.run(rx);
                });
            let thread = match thread {
                Ok(thread) => thread,
                Err(err) => {
                    tracing::error!("failed to spawn worker {}: {}", worker_id, err);
                    continue;
                }
            };

            workers.push(WorkerHandle {
                request_tx: tx,
                load,
                thread,
            });
        }

        Self {
            workers,
            config,
            metrics,
            request_seq: AtomicU64::new(0),
        }
    }

    /// Execute an invocation on some worker
    pub async fn execute(&self, invocation: Invocation) -> Result<ExecutionResult, ExecError> {
        if self.workers.is_empty() {
            return Err(ExecError::new(503, "no workers available"));
        }
        let worker_index = self.select_worker(&invocation.namespace);
        let (response_tx, response_rx) = oneshot::channel();
        let request = WorkerRequest {
            invocation,
            request_id: self.next_request_id(),
            enqueued_at: Instant::now(),
            response_tx,
        };

        let worker = &self.workers[worker_index];
        worker.load.queued_requests.fetch_add(1, Ordering::Relaxed);
        if worker.request_tx.send(request).is_err() {
            worker.load.queued_requests.fetch_sub(1, Ordering::Relaxed);
            return Err(ExecError::new(503, "worker thread is not running"));
        }

        response_rx
            .await
            .map_err(|_| ExecError::internal("worker dropped the invocation"))?
    }

    fn hash_to_worker(&self, key: &str) -> usize {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.workers.len()
    }

    fn select_worker(&self, key: &str) -> usize {
        if self.workers.len() <= 1 {
            return 0;
        }
        match self.config.scheduler_strategy {
            SchedulerStrategy::ConsistentHash => self.hash_to_worker(key),
            SchedulerStrategy::LeastLoaded => self
                .workers
                .iter()
                .enumerate()
                .min_by_key(|(_, worker)| {
                    worker.load.queued_requests.load(Ordering::Relaxed)
                        + worker.load.active_requests.load(Ordering::Relaxed)
                })
                .map(|(index, _)| index)
                .unwrap_or(0),
        }
    }

    fn next_request_id(&self) -> String {
        let id = self.request_seq.fetch_add(1, Ordering::Relaxed);
        format!("inv_{}", id)
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Pool stats as JSON (for the stats endpoint)
    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "config": {
                "num_workers": self.workers.len(),
                "execution_timeout_ms": self.config.execution_timeout_ms,
                "queue_timeout_ms": self.config.queue_timeout_ms,
                "scheduler": self.config.scheduler_strategy.name(),
            },
            "workers": self.workers.iter().enumerate().map(|(id, worker)| serde_json::json!({
                "id": id,
                "queued": worker.load.queued_requests.load(Ordering::Relaxed),
                "active": worker.load.active_requests.load(Ordering::Relaxed),
            })).collect::<Vec<_>>(),
            "metrics": self.metrics.to_json()
        })
    }
}

// ========== Worker Thread ==========

struct WorkerThread {
    worker_id: usize,
    queue_timeout: Duration,
    metrics: Arc<PoolMetrics>,
    load: Arc<WorkerLoad>,
    executor: Executor,
}

impl WorkerThread {
    /// Main loop - runs on a dedicated thread
    fn run(self, mut rx: mpsc::UnboundedReceiver<WorkerRequest>) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(err) => {
                tracing::error!("worker {} could not start its runtime: {}", self.worker_id, err);
                return;
            }
        };

        tracing::debug!("Worker {} started", self.worker_id);

        rt.block_on(async {
            while let Some(request) = rx.recv().await {
                let result = self.process_request(&request).await;
                let _ = request.response_tx.send(result);
            }
        });

        tracing::debug!("Worker {} shutting down", self.worker_id);
    }

    async fn process_request(&self, request: &WorkerRequest) -> Result<ExecutionResult, ExecError> {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        self.load.queued_requests.fetch_sub(1, Ordering::Relaxed);

        let waited = request.enqueued_at.elapsed();
        if !self.queue_timeout.is_zero() && waited > self.queue_timeout {
            self.metrics.queue_timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "{} for {} waited {}ms in queue, rejecting",
                request.request_id,
                request.invocation.namespace,
                waited.as_millis()
            );
            return Err(ExecError::new(
                503,
                format!("request timed out in queue after {}ms", waited.as_millis()),
            ));
        }

        self.load.active_requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = self.executor.run(&request.invocation).await;
        self.load.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.metrics.record(&result);

        match &result {
            Ok(_) => tracing::debug!(
                "{} {} finished on worker {} in {}ms",
                request.request_id,
                request.invocation.namespace,
                self.worker_id,
                started.elapsed().as_millis()
            ),
            Err(err) => tracing::info!(
                "{} {} failed with {}: {}",
                request.request_id,
                request.invocation.namespace,
                err.status,
                err.message
            ),
        }
        result
    }
}
