//! Control plane facade
//!
//! Owns one instance of every component and exposes the request/response
//! operations the routing layer calls. Command execution is admitted by
//! the circuit breaker first and the request queue second.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use sandboxd_protocol::WatchEvent;
use sandboxd_utils::{Result, SandboxError};

use crate::buffer::global_buffered_bytes;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStats};
use crate::config::ServerConfig;
use crate::process::{
    ExecResult, LogStream, Process, ProcessLogs, ProcessOptions, ProcessStatus, ProcessSupervisor,
    SupervisorConfig,
};
use crate::pty::{PtyInfo, PtyManager, PtyManagerConfig, PtyOptions, PtySession};
use crate::queue::{QueueConfig, QueueStats, RequestQueue};
use crate::watch::{FileWatcher, InotifyWatcher, WatchInfo, WatchOptions, WatchService};

/// Name of the breaker guarding command execution
pub const EXEC_BREAKER: &str = "exec";

/// Execute request as received from the routing layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Return as soon as the process starts
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ExecuteRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    fn options(&self) -> ProcessOptions {
        ProcessOptions {
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            timeout: self.timeout_ms.map(Duration::from_millis),
            process_id: None,
            session_id: self.session_id.clone(),
        }
    }
}

/// Foreground result or background handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecuteResponse {
    Completed(ExecResult),
    Started(Process),
}

/// Aggregate counters for health reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStats {
    pub processes: usize,
    pub ptys: usize,
    pub watches: usize,
    pub buffered_bytes: usize,
    pub circuit: CircuitStats,
    pub queue: QueueStats,
}

/// One sandbox's control plane
pub struct ControlPlane {
    config: ServerConfig,
    processes: Arc<ProcessSupervisor>,
    ptys: Arc<PtyManager>,
    watches: Arc<WatchService>,
    breaker: Arc<CircuitBreaker>,
    queue: RequestQueue,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlPlane {
    pub fn new(config: ServerConfig) -> Self {
        let watcher = Arc::new(InotifyWatcher::new(config.watch.binary.clone()));
        Self::with_watcher(config, watcher)
    }

    /// Build with a specific notification backend
    pub fn with_watcher(config: ServerConfig, watcher: Arc<dyn FileWatcher>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            processes: Arc::new(ProcessSupervisor::new(SupervisorConfig::from(&config.process))),
            ptys: Arc::new(PtyManager::new(PtyManagerConfig::from(&config.pty))),
            watches: Arc::new(WatchService::new(
                watcher,
                config.watch.default_excludes.clone(),
            )),
            breaker: Arc::new(CircuitBreaker::new(
                EXEC_BREAKER,
                CircuitBreakerConfig::from(&config.circuit_breaker),
            )),
            queue: RequestQueue::new(QueueConfig::from(&config.queue)),
            shutdown_tx,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn processes(&self) -> &Arc<ProcessSupervisor> {
        &self.processes
    }

    pub fn ptys(&self) -> &Arc<PtyManager> {
        &self.ptys
    }

    pub fn watches(&self) -> &Arc<WatchService> {
        &self.watches
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    // ==================== Execution ====================

    /// Run a command, foreground or background
    ///
    /// Only failures to launch count against the breaker. A command that
    /// runs and exits non-zero is a normal result, and queue rejections
    /// are not recorded at all.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        if request.command.trim().is_empty() {
            return Err(SandboxError::spawn("empty command"));
        }

        if !self.breaker.can_execute() {
            return Err(SandboxError::CircuitOpen {
                remaining_ms: self.breaker.remaining_ms(),
            });
        }

        let result = self.queue.execute(|| self.run(&request)).await;
        match &result {
            Ok(ExecuteResponse::Started(process)) if process.status == ProcessStatus::Error => {
                self.breaker.record_failure()
            }
            Ok(_) => self.breaker.record_success(),
            Err(SandboxError::QueueFull { .. })
            | Err(SandboxError::QueueTimeout { .. })
            | Err(SandboxError::QueueCleared { .. }) => {}
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    async fn run(&self, request: &ExecuteRequest) -> Result<ExecuteResponse> {
        let options = request.options();
        if request.background {
            let process = self.processes.start_process(&request.command, options)?;
            debug!(process_id = %process.id, "Started background process");
            Ok(ExecuteResponse::Started(process))
        } else {
            let result = self.processes.exec(&request.command, options).await?;
            Ok(ExecuteResponse::Completed(result))
        }
    }

    // ==================== Processes ====================

    pub fn list_processes(&self) -> Vec<Process> {
        self.processes.list_processes()
    }

    pub fn get_process(&self, id: &str) -> Result<Process> {
        self.processes.get_process(id)
    }

    pub fn kill_process(&self, id: &str, signal: Option<&str>) -> Result<()> {
        self.processes.kill_process(id, signal)
    }

    pub async fn wait_for_exit(&self, id: &str, timeout: Option<Duration>) -> Result<Process> {
        self.processes.wait_for_exit(id, timeout).await
    }

    pub fn get_process_logs(&self, id: &str) -> Result<ProcessLogs> {
        self.processes.get_process_logs(id)
    }

    pub fn stream_process_logs(&self, id: &str) -> Result<LogStream> {
        self.processes.stream_process_logs(id)
    }

    // ==================== Watches ====================

    pub fn watch_directory(&self, path: impl AsRef<Path>, options: WatchOptions) -> Result<WatchInfo> {
        self.watches.watch_directory(path, options)
    }

    pub fn subscribe_watch(&self, id: &str) -> Result<broadcast::Receiver<WatchEvent>> {
        self.watches.subscribe(id)
    }

    pub async fn stop_watch(&self, id: &str) -> Result<()> {
        self.watches.stop_watch(id).await
    }

    pub async fn stop_all_watches(&self) -> usize {
        self.watches.stop_all_watches().await
    }

    pub fn get_active_watches(&self) -> Vec<WatchInfo> {
        self.watches.get_active_watches()
    }

    // ==================== PTYs ====================

    pub fn create_pty(&self, options: PtyOptions) -> Result<Arc<PtySession>> {
        self.ptys.create(options)
    }

    pub fn get_pty(&self, id: Uuid) -> Result<Arc<PtySession>> {
        self.ptys.get(id)
    }

    pub fn list_ptys(&self) -> Vec<PtyInfo> {
        self.ptys.list()
    }

    pub async fn destroy_pty(&self, id: Uuid) -> Result<()> {
        self.ptys.destroy(id).await
    }

    // ==================== Lifecycle ====================

    pub fn stats(&self) -> ControlPlaneStats {
        ControlPlaneStats {
            processes: self.processes.count(),
            ptys: self.ptys.count(),
            watches: self.watches.get_active_watches().len(),
            buffered_bytes: global_buffered_bytes(),
            circuit: self.breaker.stats(),
            queue: self.queue.stats(),
        }
    }

    /// Periodically sweep finished processes until shutdown
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let processes = Arc::clone(&self.processes);
        let period = Duration::from_secs(self.config.process.cleanup_interval_secs.max(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        processes.cleanup_completed_processes();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Maintenance task stopped");
        })
    }

    /// Stop background work and release every process, watch and pty
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let cleared = self.queue.clear(Some("control plane shutting down"));
        let killed = self.processes.kill_all_processes();
        let watches = self.watches.stop_all_watches().await;
        let ptys = self.ptys.destroy_all().await;
        info!(
            queued = cleared,
            processes = killed,
            watches = watches,
            ptys = ptys,
            "Control plane shut down"
        );
    }
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("processes", &self.processes)
            .field("ptys", &self.ptys)
            .field("watches", &self.watches)
            .field("breaker", &self.breaker)
            .field("queue", &self.queue)
            .finish()
    }
}
