//! Process-wide directory of live session masters.

use std::collections::HashMap;

use actix::Addr;
use parking_lot::Mutex;

use crate::error::DirectoryError;
use crate::session::handler::SessionHandler;

/// Maps a live master's [`SessionHandler`] address by session ID.
///
/// Only masters that are currently attached are listed here — a paused
/// session has no entry; the authoritative lookup during the paused
/// window is the [`crate::parking::ParkingLot`] instead. Lookups never
/// suspend: the whole thing is one `parking_lot::Mutex`-guarded map, held
/// only across the synchronous insert/remove/clone.
#[derive(Default)]
pub struct SessionDirectory {
    masters: Mutex<HashMap<String, Addr<SessionHandler>>>,
}

impl SessionDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: String, addr: Addr<SessionHandler>) {
        self.masters.lock().insert(session_id, addr);
    }

    pub fn unregister(&self, session_id: &str) {
        self.masters.lock().remove(session_id);
    }

    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] if no master is currently
    /// registered under `session_id`.
    pub fn lookup(
        &self,
        session_id: &str,
    ) -> Result<Addr<SessionHandler>, DirectoryError> {
        self.masters
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(session_id.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.masters.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
