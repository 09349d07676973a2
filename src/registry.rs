//! Object registry and per-session resource tracking.
//!
//! Every adapter created on behalf of a client is registered under a fresh
//! string identity and charged to the session that created it. Closing an
//! adapter is idempotent, routes tagger handles through the explicit
//! hardware teardown entry, and always unregisters the identity even when
//! the native release fails. Tearing down a session closes every resource it
//! still owns, each one independently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::adapter::{Adapter, ClassSpec};
use crate::error::{RpcError, RpcResult};
use crate::introspect::AdapterKind;
use crate::native::{NativeError, NativeHandle, NativeLibrary};

#[derive(Debug)]
struct Session {
    resources: HashSet<String>,
    last_seen: Instant,
}

pub struct Registry {
    native: Arc<dyn NativeLibrary>,
    objects: RwLock<HashMap<String, Arc<Adapter>>>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Registry {
    pub fn new(native: Arc<dyn NativeLibrary>) -> Arc<Self> {
        Arc::new(Self {
            native,
            objects: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn objects_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Adapter>>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn objects_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Adapter>>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a new session and returns its id.
    pub fn open_session(&self) -> String {
        let id = format!("session-{}", Uuid::new_v4().simple());
        self.sessions_lock().insert(
            id.clone(),
            Session {
                resources: HashSet::new(),
                last_seen: Instant::now(),
            },
        );
        tracing::info!(session = %id, "session opened");
        id
    }

    /// Marks a session as live. Every request from the session goes through
    /// here before anything else.
    pub fn touch(&self, session: &str) -> RpcResult<()> {
        match self.sessions_lock().get_mut(session) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                Ok(())
            }
            None => Err(RpcError::UnknownSession(session.to_string())),
        }
    }

    /// Sessions idle longer than `timeout`, for the expiry sweeper.
    pub fn expired_sessions(&self, timeout: Duration) -> Vec<String> {
        self.sessions_lock()
            .iter()
            .filter(|(_, session)| session.last_seen.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Registers a freshly constructed adapter and charges it to `session`.
    pub fn register(
        &self,
        kind: AdapterKind,
        spec: Arc<ClassSpec>,
        handle: NativeHandle,
        session: &str,
    ) -> RpcResult<Arc<Adapter>> {
        if !self.sessions_lock().contains_key(session) {
            self.dispose(kind, handle);
            return Err(RpcError::UnknownSession(session.to_string()));
        }

        let adapter = {
            let mut objects = self.objects_write();
            let mut id = new_identity(&spec.name);
            while objects.contains_key(&id) {
                id = new_identity(&spec.name);
            }
            let adapter = Arc::new(Adapter::new(
                id.clone(),
                kind,
                spec,
                Some(session.to_string()),
                handle,
            ));
            objects.insert(id, Arc::clone(&adapter));
            adapter
        };

        let mut sessions = self.sessions_lock();
        match sessions.get_mut(session) {
            Some(entry) => {
                entry.resources.insert(adapter.id().to_string());
                Ok(adapter)
            }
            None => {
                // Session torn down while we registered; roll back.
                drop(sessions);
                self.close(&adapter)?;
                Err(RpcError::UnknownSession(session.to_string()))
            }
        }
    }

    /// Looks up a live adapter by identity.
    pub fn resolve(&self, id: &str) -> RpcResult<Arc<Adapter>> {
        self.objects_read()
            .get(id)
            .cloned()
            .ok_or_else(|| RpcError::StaleReference(id.to_string()))
    }

    /// Closes an adapter: releases the native handle and retires the remote
    /// identity. Returns `false` if another close already won; subsequent
    /// resolves fail with a stale reference either way.
    pub fn close(&self, adapter: &Adapter) -> RpcResult<bool> {
        let Some(handle) = adapter.take_handle() else {
            return Ok(false);
        };

        let released = match adapter.kind() {
            AdapterKind::Tagger => match self.native.free_tagger(handle) {
                // The device may already be gone (power loss, another free);
                // teardown still retires the identity.
                Err(NativeError::MissingAttribute(attr)) => {
                    tracing::debug!(id = %adapter.id(), attr = %attr, "tagger already released");
                    Ok(())
                }
                other => other,
            },
            _ => {
                self.native.release(handle);
                Ok(())
            }
        };

        // Unregister even when the native release failed: the identity must
        // not stay resolvable after close.
        self.objects_write().remove(adapter.id());
        if let Some(owner) = adapter.owner() {
            if let Some(session) = self.sessions_lock().get_mut(owner) {
                session.resources.remove(adapter.id());
            }
        }

        released?;
        Ok(true)
    }

    /// Tears down a session, closing every resource it still owns. Failures
    /// are logged and do not stop the sweep. Returns the number of resources
    /// actually released.
    pub fn close_session(&self, session: &str) -> usize {
        let Some(entry) = self.sessions_lock().remove(session) else {
            return 0;
        };

        let mut released = 0;
        for id in &entry.resources {
            let adapter = match self.resolve(id) {
                Ok(adapter) => adapter,
                Err(_) => continue,
            };
            match self.close(&adapter) {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(session = %session, id = %id, error = %err,
                        "failed to release resource during session teardown");
                }
            }
        }
        tracing::info!(session = %session, released, "session closed");
        released
    }

    /// Live object count, for diagnostics.
    pub fn object_count(&self) -> usize {
        self.objects_read().len()
    }

    /// Best-effort release for a handle that never got an adapter.
    fn dispose(&self, kind: AdapterKind, handle: NativeHandle) {
        match kind {
            AdapterKind::Tagger => {
                if let Err(err) = self.native.free_tagger(handle) {
                    tracing::warn!(error = %err, "failed to free orphaned tagger");
                }
            }
            _ => self.native.release(handle),
        }
    }
}

fn new_identity(class_name: &str) -> String {
    format!("{}-{}", class_name, Uuid::new_v4().simple())
}
