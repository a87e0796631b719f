//! Session pool: at most one live session per endpoint.
//!
//! The map holds weak references, plus a strong one per entry when the
//! pool keeps idle sessions alive. A session removes its own entry when it
//! closes. The pool lock and a session's lock are never held together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::request::Endpoint;
use crate::session::FlipSession;
use crate::transport::{Connector, TcpConnector};

struct PoolEntry {
    session: Weak<FlipSession>,
    /// Holds idle sessions open when the pool keeps them alive.
    #[allow(dead_code)]
    keep_alive: Option<Arc<FlipSession>>,
}

impl PoolEntry {
    fn live(&self) -> Option<Arc<FlipSession>> {
        self.session.upgrade().filter(|s| !s.is_closed())
    }
}

pub(crate) struct PoolShared {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    sessions: Mutex<HashMap<Endpoint, PoolEntry>>,
}

impl PoolShared {
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<Endpoint, PoolEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the entry for `endpoint` if it still points at `session`.
    pub(crate) fn forget(&self, endpoint: &Endpoint, session: &FlipSession) {
        let removed = {
            let mut sessions = self.lock_sessions();
            match sessions.get(endpoint) {
                Some(entry) if std::ptr::eq(entry.session.as_ptr(), session) => {
                    sessions.remove(endpoint)
                }
                _ => None,
            }
        };
        if removed.is_some() {
            debug!(%endpoint, "session removed from pool");
        }
    }
}

/// Registry of sessions keyed by endpoint. Cheap to clone; clones share
/// the same sessions.
#[derive(Clone)]
pub struct FlipSessionPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for FlipSessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlipSessionPool")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl FlipSessionPool {
    pub fn new(config: SessionConfig, connector: impl Connector) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                connector: Arc::new(connector),
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// A pool connecting over plain TCP.
    pub fn with_tcp(config: SessionConfig) -> Result<Self> {
        Self::new(config, TcpConnector)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// The live session for `endpoint`, or a new one whose connect runs in
    /// the background. Never waits. Must be called from within a Tokio
    /// runtime.
    pub fn get(&self, endpoint: &Endpoint) -> Arc<FlipSession> {
        let (session, replaced) = {
            let mut sessions = self.shared.lock_sessions();
            if let Some(session) = sessions.get(endpoint).and_then(PoolEntry::live) {
                return session;
            }
            let session = FlipSession::spawn(
                endpoint.clone(),
                self.shared.config.clone(),
                Arc::clone(&self.shared.connector),
                Arc::downgrade(&self.shared),
            );
            let entry = PoolEntry {
                session: Arc::downgrade(&session),
                keep_alive: self.shared.config.keep_alive.then(|| Arc::clone(&session)),
            };
            (session, sessions.insert(endpoint.clone(), entry))
        };
        // A replaced entry may hold the last reference to a dead session.
        drop(replaced);
        session
    }

    pub fn has_session(&self, endpoint: &Endpoint) -> bool {
        self.shared
            .lock_sessions()
            .get(endpoint)
            .and_then(PoolEntry::live)
            .is_some()
    }

    /// Take `endpoint` out of the pool without closing its session.
    pub fn remove(&self, endpoint: &Endpoint) -> Option<Arc<FlipSession>> {
        let entry = self.shared.lock_sessions().remove(endpoint)?;
        entry.live()
    }

    /// Close every pooled session.
    pub fn close_all_sessions(&self) {
        let entries: Vec<PoolEntry> = {
            let mut sessions = self.shared.lock_sessions();
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(session) = entry.live() {
                session.close();
            }
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.shared
            .lock_sessions()
            .values()
            .filter(|e| e.live().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
