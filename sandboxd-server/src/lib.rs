//! sandboxd-server: sandbox control plane
//!
//! Supervises shell commands, hosts interactive pseudo-terminals streamed
//! over TCP and watches directories for changes. Command execution is
//! protected by a circuit breaker and a bounded request queue.

pub mod buffer;
pub mod circuit_breaker;
pub mod config;
pub mod control;
pub mod process;
pub mod pty;
pub mod queue;
pub mod stream;
pub mod tcp;
pub mod watch;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use config::{ConfigLoader, ServerConfig};
pub use control::{ControlPlane, ControlPlaneStats, ExecuteRequest, ExecuteResponse};
pub use process::{ProcessSupervisor, SupervisorConfig};
pub use pty::{PtyManager, PtyOptions, PtySession};
pub use queue::{QueueConfig, QueueStats, RequestQueue};
pub use watch::{FileWatcher, WatchOptions, WatchService};
