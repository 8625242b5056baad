//! Registry of live PTY sessions

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use sandboxd_utils::{Result, SandboxError};

use super::{PtyInfo, PtyManagerConfig, PtyOptions, PtySession};

/// Owns every PTY session of one control plane
#[derive(Debug)]
pub struct PtyManager {
    config: PtyManagerConfig,
    sessions: Arc<DashMap<Uuid, Arc<PtySession>>>,
}

impl PtyManager {
    pub fn new(config: PtyManagerConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &PtyManagerConfig {
        &self.config
    }

    /// Spawn a session and track it until its process exits
    pub fn create(&self, mut options: PtyOptions) -> Result<Arc<PtySession>> {
        let id = *options.session_id.get_or_insert_with(Uuid::new_v4);

        // The vacant entry holds the id until the spawn resolves
        let session = match self.sessions.entry(id) {
            Entry::Occupied(_) => {
                return Err(SandboxError::pty(format!("session id already in use: {}", id)));
            }
            Entry::Vacant(slot) => {
                let session = PtySession::spawn(options, &self.config)?;
                slot.insert(Arc::clone(&session));
                session
            }
        };

        // Drop the registry entry once the process is gone
        let sessions = Arc::clone(&self.sessions);
        let watched = Arc::clone(&session);
        tokio::spawn(async move {
            watched.wait_closed().await;
            let removed = sessions
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &watched))
                .is_some();
            if removed {
                debug!(session_id = %id, "Removed closed PTY session");
            }
        });

        Ok(session)
    }

    pub fn get(&self, id: Uuid) -> Result<Arc<PtySession>> {
        self.sessions
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| SandboxError::PtySessionNotFound(id.to_string()))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn list(&self) -> Vec<PtyInfo> {
        let mut list: Vec<PtyInfo> = self.sessions.iter().map(|s| s.value().info()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Destroy one session
    pub async fn destroy(&self, id: Uuid) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(&id)
            .ok_or_else(|| SandboxError::PtySessionNotFound(id.to_string()))?;
        session.destroy().await;
        Ok(())
    }

    /// Destroy every session; returns how many there were
    pub async fn destroy_all(&self) -> usize {
        let ids: Vec<Uuid> = self.sessions.iter().map(|s| *s.key()).collect();
        let sessions: Vec<Arc<PtySession>> = ids
            .iter()
            .filter_map(|id| self.sessions.remove(id).map(|(_, s)| s))
            .collect();

        let count = sessions.len();
        futures::future::join_all(sessions.iter().map(|s| s.destroy())).await;
        if count > 0 {
            info!(count = count, "Destroyed all PTY sessions");
        }
        count
    }
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new(PtyManagerConfig::default())
    }
}
