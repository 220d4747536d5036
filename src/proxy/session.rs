//! Per-connection sessions and per-request contexts.
//!
//! A [`Session`] lives for the whole client connection and records what
//! the connection has become: whether TLS has been terminated inside the
//! proxy (`secure`) and whether a modifier has taken ownership of it
//! (`hijacked`). A [`Context`] is the per-request envelope handed to
//! modifiers; it is re-created for every request, including on re-entry
//! after a MITM upgrade, while the session survives.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

/// Per-connection state shared between the handler and the modifiers it
/// invokes.
#[derive(Debug)]
pub struct Session {
    id: String,
    state: Mutex<SessionState>,
}

#[derive(Debug, Default)]
struct SessionState {
    secure: bool,
    hijacked: bool,
}

impl Session {
    /// Create a session for a newly accepted connection.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Opaque session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the stream has been upgraded to proxy-terminated TLS.
    pub fn is_secure(&self) -> bool {
        self.lock().secure
    }

    /// Mark the stream as proxy-terminated TLS.
    pub fn mark_secure(&self) {
        self.lock().secure = true;
    }

    /// Whether a modifier has taken ownership of the connection.
    pub fn hijacked(&self) -> bool {
        self.lock().hijacked
    }

    /// Take ownership of the connection. The core performs no further
    /// reads or writes on it after the current modifier returns.
    pub fn hijack(&self) {
        self.lock().hijacked = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state poisoned")
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request envelope handed to modifiers.
pub struct Context {
    session: std::sync::Arc<Session>,
    skip_round_trip: bool,
    vals: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Context {
    /// Create a context bound to `session`.
    pub fn new(session: std::sync::Arc<Session>) -> Self {
        Self {
            session,
            skip_round_trip: false,
            vals: HashMap::new(),
        }
    }

    /// The session this request belongs to.
    pub fn session(&self) -> &std::sync::Arc<Session> {
        &self.session
    }

    /// Skip the round trip for this request; the pipeline synthesizes a
    /// `200` instead of contacting the origin.
    pub fn skip_round_trip(&mut self) {
        self.skip_round_trip = true;
    }

    /// Whether the round trip will be skipped.
    pub fn skipping_round_trip(&self) -> bool {
        self.skip_round_trip
    }

    /// Store a request-scoped value for later modifier stages.
    pub fn set(&mut self, key: impl Into<String>, val: impl Any + Send + Sync) {
        self.vals.insert(key.into(), Box::new(val));
    }

    /// Fetch a request-scoped value stored with [`Context::set`].
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.vals.get(key)?.downcast_ref()
    }
}
