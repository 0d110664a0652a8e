//! Worker supervision.
//!
//! The supervisor owns the listener and round-robins accepted connections
//! to N workers. Each worker is an independent serving loop with its own
//! service graph; a crashed worker is reforked with crash-loop backoff.
//! SIGINT/SIGTERM drains: workers stop accepting, in-flight requests
//! finish under a hard-kill timer, the store closes last.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cache::KvStore;
use crate::config::{Config, SupervisorConfig};
use crate::errors::AppError;
use crate::web::{self, AppState};

/// Pending-connection backlog per worker before dispatch skips it.
const WORKER_QUEUE_DEPTH: usize = 64;

const STORE_PURGE_INTERVAL: Duration = Duration::from_secs(600);

type WorkerSlots = Arc<RwLock<Vec<Option<mpsc::Sender<TcpStream>>>>>;

pub struct Supervisor {
    config: Arc<Config>,
}

impl Supervisor {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<(), AppError> {
        let store = KvStore::connect(&self.config.database)
            .await
            .map_err(|e| AppError::internal(format!("store init failed: {e}")))?;

        let workers = worker_count(&self.config.supervisor);
        let address = format!("{}:{}", self.config.web.host, self.config.web.port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| AppError::internal(format!("bind {address} failed: {e}")))?;
        info!(%address, workers, "supervisor listening");

        let shutdown = CancellationToken::new();
        let connections = TaskTracker::new();
        let slots: WorkerSlots = Arc::new(RwLock::new(vec![None; workers]));

        // Persistent-tier housekeeping.
        {
            let store = store.clone();
            let cancel = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(STORE_PURGE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            match store.purge_expired().await {
                                Ok(0) => {}
                                Ok(purged) => debug!(purged, "expired cache rows purged"),
                                Err(e) => warn!(error = %e, "cache purge failed"),
                            }
                        }
                    }
                }
            });
        }

        // Staggered worker start avoids a thundering herd on shared
        // dependencies.
        let stagger = Duration::from_millis(self.config.supervisor.stagger_ms);
        for worker_id in 0..workers {
            let config = self.config.clone();
            let store = store.clone();
            let slots = slots.clone();
            let shutdown = shutdown.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                tokio::time::sleep(stagger * worker_id as u32).await;
                supervise_worker(worker_id, config, store, slots, shutdown, connections).await;
            });
        }

        self.accept_loop(listener, slots, shutdown.clone()).await;

        // Drain: stop accepting (done), let in-flight requests finish,
        // hard-kill stragglers, close the store.
        info!("draining workers");
        connections.close();
        let drain = Duration::from_secs(self.config.supervisor.drain_timeout_secs);
        if tokio::time::timeout(drain, connections.wait()).await.is_err() {
            warn!(timeout_secs = drain.as_secs(), "drain timed out, hard-killing remaining connections");
        }
        store.close().await;
        info!("supervisor stopped");
        Ok(())
    }

    /// Accept and dispatch round-robin, skipping dead or saturated workers.
    async fn accept_loop(
        &self,
        listener: TcpListener,
        slots: WorkerSlots,
        shutdown: CancellationToken,
    ) {
        let mut signal = std::pin::pin!(wait_for_signal());
        let mut next = 0usize;
        loop {
            let accepted = tokio::select! {
                _ = &mut signal => {
                    info!("shutdown signal received");
                    shutdown.cancel();
                    return;
                }
                accepted = listener.accept() => accepted,
            };

            let (mut stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let guard = slots.read().await;
            let count = guard.len();
            let mut dispatched = false;
            for attempt in 0..count {
                let idx = (next + attempt) % count;
                let Some(tx) = &guard[idx] else { continue };
                match tx.try_send(stream) {
                    Ok(()) => {
                        next = (idx + 1) % count;
                        dispatched = true;
                        break;
                    }
                    Err(mpsc::error::TrySendError::Full(returned))
                    | Err(mpsc::error::TrySendError::Closed(returned)) => {
                        stream = returned;
                    }
                }
            }
            if !dispatched {
                debug!(%peer, "no worker available, dropping connection");
            }
        }
    }
}

/// Keep one worker alive: fork, await, count the crash, back off, refork.
async fn supervise_worker(
    worker_id: usize,
    config: Arc<Config>,
    store: KvStore,
    slots: WorkerSlots,
    shutdown: CancellationToken,
    connections: TaskTracker,
) {
    let mut restarts: Vec<Instant> = Vec::new();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
        slots.write().await[worker_id] = Some(tx);

        let handle = tokio::spawn(run_worker(
            worker_id,
            config.clone(),
            store.clone(),
            rx,
            shutdown.child_token(),
            connections.clone(),
        ));

        match handle.await {
            Ok(()) if shutdown.is_cancelled() => break,
            Ok(()) => warn!(worker = worker_id, "worker exited unexpectedly"),
            Err(e) => error!(worker = worker_id, error = %e, "worker crashed"),
        }
        slots.write().await[worker_id] = None;

        let now = Instant::now();
        prune_restarts(&mut restarts, now, &config.supervisor);
        restarts.push(now);
        let in_window = restarts_in_window(&restarts, now, &config.supervisor);
        let delay = restart_delay(in_window, &config.supervisor);

        if !delay.is_zero() {
            warn!(
                worker = worker_id,
                restarts = in_window,
                backoff_ms = delay.as_millis() as u64,
                "crash loop detected, backing off"
            );
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    slots.write().await[worker_id] = None;
}

/// One worker: build the service graph, then serve dispatched connections
/// until told to drain.
async fn run_worker(
    worker_id: usize,
    config: Arc<Config>,
    store: KvStore,
    mut rx: mpsc::Receiver<TcpStream>,
    cancel: CancellationToken,
    connections: TaskTracker,
) {
    let state = match AppState::build(config.clone(), store, worker_id) {
        Ok(state) => state,
        Err(e) => {
            error!(worker = worker_id, error = %e, "worker init failed");
            return;
        }
    };
    let router = web::build_router(state);
    let keep_alive = Duration::from_secs(config.supervisor.keep_alive_secs);
    info!(worker = worker_id, "worker started");

    loop {
        let stream = tokio::select! {
            // Drain starts here: no new connections are taken.
            _ = cancel.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some(stream) => stream,
                None => break,
            },
        };

        let router = router.clone();
        let cancel = cancel.clone();
        connections.spawn(async move {
            serve_connection(stream, router, cancel, keep_alive).await;
        });
    }

    info!(worker = worker_id, "worker stopped accepting");
}

async fn serve_connection(
    stream: TcpStream,
    router: axum::Router,
    cancel: CancellationToken,
    keep_alive: Duration,
) {
    let service = hyper_util::service::TowerToHyperService::new(router);
    let mut builder = hyper::server::conn::http1::Builder::new();
    builder
        .keep_alive(true)
        .timer(hyper_util::rt::TokioTimer::new())
        // Slightly longer than the keep-alive window so the keep-alive
        // mechanism, not the header-read timeout, closes an idle connection.
        .header_read_timeout(keep_alive + Duration::from_secs(1));

    let conn = builder.serve_connection(hyper_util::rt::TokioIo::new(stream), service);
    let mut conn = std::pin::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(error = %e, "connection ended with error");
            }
        }
        _ = cancel.cancelled() => {
            // Finish the in-flight request, then close.
            conn.as_mut().graceful_shutdown();
            let _ = conn.as_mut().await;
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// `min(cpu × io, memory / per_worker, max)` with a floor of the CPU count.
pub fn worker_count(config: &SupervisorConfig) -> usize {
    if config.workers > 0 {
        return config.workers;
    }

    let cpu = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let total_memory_mb = {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        system.total_memory() / (1024 * 1024)
    };
    compute_worker_count(cpu, total_memory_mb, config)
}

fn compute_worker_count(cpu: usize, total_memory_mb: u64, config: &SupervisorConfig) -> usize {
    let by_memory = (total_memory_mb / config.per_worker_memory_mb.max(1)) as usize;
    let sized = (cpu * config.io_multiplier)
        .min(by_memory)
        .min(config.max_workers);
    sized.max(cpu.min(config.max_workers)).max(1)
}

/// Drop restart records older than twice the rolling window.
fn prune_restarts(restarts: &mut Vec<Instant>, now: Instant, config: &SupervisorConfig) {
    let horizon = Duration::from_secs(config.crash_window_secs * 2);
    restarts.retain(|t| now.duration_since(*t) < horizon);
}

fn restarts_in_window(restarts: &[Instant], now: Instant, config: &SupervisorConfig) -> u32 {
    let window = Duration::from_secs(config.crash_window_secs);
    restarts
        .iter()
        .filter(|t| now.duration_since(**t) < window)
        .count() as u32
}

/// Exponential backoff once the rolling window overflows: base × 2^(n-1),
/// capped. Below the threshold workers restart immediately.
fn restart_delay(restarts_in_window: u32, config: &SupervisorConfig) -> Duration {
    if restarts_in_window <= config.max_restarts_in_window {
        return Duration::ZERO;
    }
    let exponent = restarts_in_window.saturating_sub(1).min(20);
    let delay_ms = config
        .backoff_base_ms
        .saturating_mul(1u64 << exponent)
        .min(config.backoff_cap_ms);
    Duration::from_millis(delay_ms)
}
