//! BITS session state and registry
//!
//! A session spans many HTTP requests: it owns the upload sink (a VHD
//! import state machine or a raw positioned-write target) and the
//! monotonically advancing absolute write cursor fragments are validated
//! against. The process-wide registry maps braced session-id strings to
//! live sessions, evicting the oldest entry if a misbehaving client leaks
//! enough of them.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use uuid::Uuid;
use vdigate_import::VhdImport;

/// Where fragment bytes go
pub enum Sink {
    /// Streaming VHD parse into a backing device
    Vhd(VhdImport),
    /// Raw positioned writes into a backing device
    Raw { path: PathBuf, off: u64 },
}

/// One BITS upload in flight
pub struct Session {
    id: String,
    sink: Sink,
}

impl Session {
    /// Allocate a session with a fresh braced session id
    pub fn new(sink: Sink) -> Self {
        Self {
            id: braced_id(Uuid::new_v4()),
            sink,
        }
    }

    /// The braced, lowercase session id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Absolute stream offset consumed so far
    pub fn abs_off(&self) -> u64 {
        match &self.sink {
            Sink::Vhd(import) => import.abs_off(),
            Sink::Raw { off, .. } => *off,
        }
    }

    pub fn sink_mut(&mut self) -> &mut Sink {
        &mut self.sink
    }
}

/// Canonical braced lowercase form of a session UUID
pub fn braced_id(uuid: Uuid) -> String {
    format!("{{{}}}", uuid)
}

/// Normalize a client-supplied `BITS-Session-Id` header value.
///
/// Requires the braced UUID form; matching is case-insensitive. Returns the
/// canonical registry key.
pub fn normalize_session_id(header: &str) -> Option<String> {
    let trimmed = header.trim();
    let inner = trimmed.strip_prefix('{')?.strip_suffix('}')?;
    let uuid = Uuid::parse_str(inner).ok()?;
    Some(braced_id(uuid))
}

/// Process-wide session directory
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    order: VecDeque<String>,
}

impl SessionRegistry {
    /// Registry capacity; callers are expected to Close their sessions long
    /// before this fills up.
    pub const MAX_SESSIONS: usize = 100;

    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, evicting the oldest one on overflow.
    pub fn insert(&mut self, session: Session) {
        if self.sessions.len() >= Self::MAX_SESSIONS {
            if let Some(oldest) = self.order.pop_front() {
                tracing::warn!(session = %oldest, "BITS session leak detected, evicting the oldest session");
                self.sessions.remove(&oldest);
            }
        }
        self.order.push_back(session.id.clone());
        self.sessions.insert(session.id.clone(), session);
    }

    /// Look up a live session by its canonical id
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove a session (Close-Session, Cancel-Session, or replacement)
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.order.retain(|k| k != id);
        self.sessions.remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
