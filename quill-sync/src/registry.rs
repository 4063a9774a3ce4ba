//! Process-wide map from document name to live [`Session`].
//!
//! Sessions are created on first attach and torn down once they have been
//! empty for a grace period, so a quick reload does not lose in-memory state.
//! A registry is an owned value; clone it to share (clones refer to the same
//! map).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::doc::{yrs_factory, StateFactory};
use crate::session::{Attachment, Session};

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long an empty session survives before it is reaped
    pub grace_period: Duration,
    /// Frames buffered per connection before a slow peer starts lagging
    pub broadcast_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            broadcast_capacity: 256,
        }
    }
}

struct RegistryInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: RegistryConfig,
    factory: StateFactory,
}

/// Document registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Registry whose sessions hold Yrs documents.
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_factory(config, yrs_factory())
    }

    /// Registry whose sessions get their replicated state from `factory`.
    pub fn with_factory(config: RegistryConfig, factory: StateFactory) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                config,
                factory,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Get the session for `name`, creating it if needed.
    ///
    /// Concurrent callers for the same name always get the same session.
    pub async fn get_or_create(&self, name: &str) -> Arc<Session> {
        // Fast path: read lock
        {
            let sessions = self.inner.sessions.read().await;
            if let Some(session) = sessions.get(name) {
                return session.clone();
            }
        }

        let mut sessions = self.inner.sessions.write().await;
        self.create_locked(&mut sessions, name)
    }

    /// Attach a new connection to the session for `name`.
    ///
    /// The registry lock is held until the connection is registered with the
    /// session, so a concurrent reap cannot remove the session in between.
    pub async fn attach(&self, name: &str) -> Attachment {
        {
            let sessions = self.inner.sessions.read().await;
            if let Some(session) = sessions.get(name) {
                return session.attach(self);
            }
        }

        let mut sessions = self.inner.sessions.write().await;
        let session = self.create_locked(&mut sessions, name);
        session.attach(self)
    }

    /// Double-checked creation; caller holds the write lock.
    fn create_locked(&self, sessions: &mut HashMap<String, Arc<Session>>, name: &str) -> Arc<Session> {
        sessions
            .entry(name.to_string())
            .or_insert_with(|| {
                log::info!("Created new document: {name}");
                Arc::new(Session::new(
                    name,
                    (self.inner.factory)(name),
                    self.inner.config.broadcast_capacity,
                ))
            })
            .clone()
    }

    /// Schedule teardown of `name` if its session has no connections.
    ///
    /// Attachments do this on their own when the last one detaches; calling
    /// it again just restarts the grace period.
    pub async fn release(&self, name: &str) {
        if let Some(session) = self.get(name).await {
            if session.is_empty() {
                self.schedule_reap(&session);
            }
        }
    }

    pub(crate) fn schedule_reap(&self, session: &Arc<Session>) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!("No runtime to schedule cleanup of {}", session.name());
                return;
            }
        };

        let registry = self.clone();
        let target = session.clone();
        let grace = self.inner.config.grace_period;
        let task = runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            registry.reap_if_idle(&target).await;
        });
        session.set_pending_reap(task);
    }

    /// Remove `session` if it is still registered and still empty.
    async fn reap_if_idle(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        let idle = sessions
            .get(session.name())
            .is_some_and(|current| Arc::ptr_eq(current, session) && current.is_empty());
        if idle {
            sessions.remove(session.name());
            log::info!("Document cleaned up: {}", session.name());
        }
        idle
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.sessions.read().await.contains_key(name)
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Names of live sessions, sorted.
    pub async fn document_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Expire stale presence records across all sessions.
    ///
    /// Returns the number of records removed.
    pub async fn sweep_presence(&self, timeout: Duration) -> usize {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.read().await.values().cloned().collect();
        sessions
            .iter()
            .map(|session| session.expire_presence(timeout).removed.len())
            .sum()
    }
}
