//! Bounded request queue
//!
//! Admission control in front of a shared resource: up to
//! `max_concurrent` calls run at once, up to `max_queue_size` more wait in
//! strict FIFO order, anything beyond that is rejected immediately.
//!
//! A finishing call hands its slot directly to the oldest waiter, so
//! `active_count` never exceeds `max_concurrent` and a late arrival can
//! never jump the queue.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use sandboxd_utils::{Result, SandboxError};

/// Called after an entry is queued, with the new queue length
pub type EnqueueHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Called when a queued entry is dispatched, with the time it waited
pub type DequeueHook = Arc<dyn Fn(Duration) + Send + Sync>;

/// Configuration for the request queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    /// How long an entry may wait before it is rejected
    pub queue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 100,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = max;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }
}

/// Optional observability callbacks
#[derive(Clone, Default)]
pub struct QueueHooks {
    pub on_enqueue: Option<EnqueueHook>,
    pub on_dequeue: Option<DequeueHook>,
}

/// Queue occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub active_count: usize,
    pub queue_length: usize,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
}

struct Waiter {
    id: u64,
    grant: oneshot::Sender<Result<()>>,
}

struct State {
    active: usize,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

struct Shared {
    config: QueueConfig,
    hooks: QueueHooks,
    state: Mutex<State>,
}

impl Shared {
    /// Give a freed slot to the oldest live waiter, or return it to the pool
    fn release(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.grant.send(Ok(())).is_ok() {
                debug!(waiter = waiter.id, "Queue slot handed to next waiter");
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }
}

/// Bounded FIFO admission queue
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<Shared>,
}

/// An occupied execution slot; dropping it frees the slot
pub struct QueueSlot {
    shared: Arc<Shared>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// A queued entry; dropping it before dispatch withdraws it
struct Ticket {
    shared: Arc<Shared>,
    id: u64,
    rx: Option<oneshot::Receiver<Result<()>>>,
}

impl Ticket {
    /// Remove the entry if it is still waiting. False means it was already dispatched.
    fn withdraw(&self) -> bool {
        let mut state = self.shared.state.lock();
        match state.waiters.iter().position(|w| w.id == self.id) {
            Some(index) => {
                state.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    fn into_slot(mut self) -> QueueSlot {
        self.rx = None;
        QueueSlot {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        if self.withdraw() {
            return;
        }
        // Dispatched between the caller giving up and now: pass the slot on
        rx.close();
        if let Ok(Ok(())) = rx.try_recv() {
            self.shared.release();
        }
    }
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_hooks(config, QueueHooks::default())
    }

    pub fn with_hooks(config: QueueConfig, hooks: QueueHooks) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                hooks,
                state: Mutex::new(State {
                    active: 0,
                    waiters: VecDeque::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Run `f` once a slot is available
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _slot = self.acquire().await?;
        f().await
    }

    /// Wait for an execution slot
    ///
    /// Fails immediately with `QueueFull` when the queue is at capacity,
    /// or with `QueueTimeout` when the entry waited longer than the
    /// configured timeout.
    pub async fn acquire(&self) -> Result<QueueSlot> {
        let config = &self.shared.config;

        let (id, rx, queue_length) = {
            let mut state = self.shared.state.lock();
            if state.active < config.max_concurrent {
                state.active += 1;
                return Ok(QueueSlot {
                    shared: Arc::clone(&self.shared),
                });
            }

            if state.waiters.len() >= config.max_queue_size {
                let queue_size = state.waiters.len();
                warn!(queue_size = queue_size, "Request queue full, rejecting");
                return Err(SandboxError::QueueFull { queue_size });
            }

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, grant: tx });
            (id, rx, state.waiters.len())
        };

        debug!(waiter = id, queue_length = queue_length, "Request queued");
        if let Some(hook) = &self.shared.hooks.on_enqueue {
            hook(queue_length);
        }

        let enqueued_at = Instant::now();
        let mut ticket = Ticket {
            shared: Arc::clone(&self.shared),
            id,
            rx: Some(rx),
        };

        let outcome = match ticket.rx.as_mut() {
            Some(rx) => tokio::time::timeout(config.queue_timeout, rx).await,
            None => return Err(SandboxError::internal("queue ticket lost its receiver")),
        };

        let granted = match outcome {
            Ok(Ok(grant)) => grant,
            Ok(Err(_)) => Err(SandboxError::QueueCleared {
                reason: "queue dropped".into(),
            }),
            Err(_) => {
                let wait_time_ms = enqueued_at.elapsed().as_millis() as u64;
                if ticket.withdraw() {
                    ticket.rx = None;
                    debug!(waiter = id, wait_time_ms = wait_time_ms, "Queued request timed out");
                    return Err(SandboxError::QueueTimeout { wait_time_ms });
                }
                // Dispatch won the race against the timer
                match ticket.rx.as_mut().map(|rx| rx.try_recv()) {
                    Some(Ok(grant)) => grant,
                    _ => Err(SandboxError::QueueTimeout { wait_time_ms }),
                }
            }
        };

        match granted {
            Ok(()) => {
                let waited = enqueued_at.elapsed();
                if let Some(hook) = &self.shared.hooks.on_dequeue {
                    hook(waited);
                }
                Ok(ticket.into_slot())
            }
            Err(e) => {
                ticket.rx = None;
                Err(e)
            }
        }
    }

    /// Reject every queued entry; running calls are unaffected
    pub fn clear(&self, reason: Option<&str>) -> usize {
        let reason = reason.unwrap_or("queue cleared").to_string();
        let drained: Vec<Waiter> = self.shared.state.lock().waiters.drain(..).collect();
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.grant.send(Err(SandboxError::QueueCleared {
                reason: reason.clone(),
            }));
        }
        if count > 0 {
            warn!(count = count, reason = %reason, "Request queue cleared");
        }
        count
    }

    /// Whether a new call would be accepted (run or queued) rather than rejected
    pub fn has_capacity(&self) -> bool {
        let state = self.shared.state.lock();
        state.active < self.shared.config.max_concurrent
            || state.waiters.len() < self.shared.config.max_queue_size
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            active_count: state.active,
            queue_length: state.waiters.len(),
            max_concurrent: self.shared.config.max_concurrent,
            max_queue_size: self.shared.config.max_queue_size,
        }
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    fn queue(max_concurrent: usize, max_queue_size: usize) -> RequestQueue {
        RequestQueue::new(
            QueueConfig::new()
                .with_max_concurrent(max_concurrent)
                .with_max_queue_size(max_queue_size)
                .with_queue_timeout(Duration::from_secs(5)),
        )
    }

    /// Spawn a call that holds its slot until `gate` hands out a permit
    fn spawn_blocked(
        q: &RequestQueue,
        gate: Arc<Semaphore>,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let q = q.clone();
        tokio::spawn(async move {
            q.execute(|| async move {
                gate.acquire().await.unwrap().forget();
                Ok(())
            })
            .await
        })
    }

    async fn wait_for(q: &RequestQueue, active: usize, queued: usize) {
        for _ in 0..1000 {
            let stats = q.stats();
            if stats.active_count == active && stats.queue_length == queued {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("queue never reached {}/{}: {:?}", active, queued, q.stats());
    }

    #[test]
    fn test_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.max_queue_size, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_immediately_under_capacity() {
        let q = queue(3, 10);
        let gate = Arc::new(Semaphore::new(0));
        let handles: Vec<_> = (0..3).map(|_| spawn_blocked(&q, gate.clone())).collect();

        wait_for(&q, 3, 0).await;

        gate.add_permits(3);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        wait_for(&q, 0, 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_when_full() {
        let q = queue(2, 3);
        let gate = Arc::new(Semaphore::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(spawn_blocked(&q, gate.clone()));
        }
        wait_for(&q, 2, 3).await;
        assert!(!q.has_capacity());

        let result = q.execute(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(SandboxError::QueueFull { queue_size: 3 })));

        gate.add_permits(5);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        wait_for(&q, 0, 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_dispatch() {
        let q = queue(1, 10);
        let slot = q.acquire().await.unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let q2 = q.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                q2.execute(|| async move {
                    order.lock().push(i);
                    Ok(())
                })
                .await
            }));
            wait_for(&q, 1, i + 1).await;
        }

        drop(slot);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_removes_entry() {
        let q = queue(1, 10);
        let _slot = q.acquire().await.unwrap();

        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.execute(|| async { Ok(()) }).await });
        wait_for(&q, 1, 1).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        match waiter.await.unwrap() {
            Err(SandboxError::QueueTimeout { wait_time_ms }) => assert!(wait_time_ms >= 5_000),
            other => panic!("expected QueueTimeout, got {:?}", other),
        }
        assert_eq!(q.stats().queue_length, 0);
        assert_eq!(q.stats().active_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_rejects_only_queued() {
        let q = queue(1, 10);
        let gate = Arc::new(Semaphore::new(0));
        let active = spawn_blocked(&q, gate.clone());
        wait_for(&q, 1, 0).await;

        let queued: Vec<_> = (0..2).map(|_| spawn_blocked(&q, gate.clone())).collect();
        wait_for(&q, 1, 2).await;

        assert_eq!(q.clear(Some("shutting down")), 2);
        for handle in queued {
            match handle.await.unwrap() {
                Err(SandboxError::QueueCleared { reason }) => assert_eq!(reason, "shutting down"),
                other => panic!("expected QueueCleared, got {:?}", other),
            }
        }
        assert_eq!(q.stats().active_count, 1);

        gate.add_permits(1);
        active.await.unwrap().unwrap();
        wait_for(&q, 0, 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_is_withdrawn() {
        let q = queue(1, 10);
        let slot = q.acquire().await.unwrap();

        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.execute(|| async { Ok(()) }).await });
        wait_for(&q, 1, 1).await;

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(q.stats().queue_length, 0);

        drop(slot);
        wait_for(&q, 0, 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks_fire() {
        let enqueued = Arc::new(AtomicUsize::new(0));
        let dequeued = Arc::new(AtomicUsize::new(0));
        let hooks = QueueHooks {
            on_enqueue: Some({
                let enqueued = enqueued.clone();
                Arc::new(move |_len| {
                    enqueued.fetch_add(1, Ordering::SeqCst);
                })
            }),
            on_dequeue: Some({
                let dequeued = dequeued.clone();
                Arc::new(move |_wait| {
                    dequeued.fetch_add(1, Ordering::SeqCst);
                })
            }),
        };
        let q = RequestQueue::with_hooks(QueueConfig::new().with_max_concurrent(1), hooks);

        let slot = q.acquire().await.unwrap();
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.execute(|| async { Ok(()) }).await });
        wait_for(&q, 1, 1).await;
        assert_eq!(enqueued.load(Ordering::SeqCst), 1);

        drop(slot);
        waiter.await.unwrap().unwrap();
        assert_eq!(dequeued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_from_call_frees_slot() {
        let q = queue(1, 1);
        let result: Result<()> = q
            .execute(|| async { Err(SandboxError::internal("boom")) })
            .await;
        assert!(result.is_err());
        assert_eq!(q.stats().active_count, 0);
        assert!(q.has_capacity());
    }
}
