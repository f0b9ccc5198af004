//! The parking lot: keeps a `guacd` connection alive while no browser is
//! attached, by draining it and answering keep-alive `sync` instructions.
//!
//! Without this, `guacd` would close the remote-desktop session the
//! moment a session's reader stops being read.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::codec;
use crate::error::ParkingError;
use crate::guacd::{GuacdConnection, GuacdReader, GuacdWriter};

struct ParkedEntry {
    stop_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<(Box<dyn GuacdWriter>, Box<dyn GuacdReader>)>,
    parked_at: DateTime<Utc>,
}

/// Process-wide map of parked `guacd` connections, keyed by session ID.
///
/// A `guacd` connection is in the `ParkingLot` xor owned by a live
/// `SessionHandler` — never both, never neither while the session is
/// alive.
#[derive(Default)]
pub struct ParkingLot {
    entries: Mutex<HashMap<String, ParkedEntry>>,
}

impl ParkingLot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `connection` under `session_id`, spawning its keepalive task.
    ///
    /// # Errors
    ///
    /// Returns [`ParkingError::AlreadyParked`] if `session_id` is already
    /// parked; the caller keeps ownership of `connection` in that case.
    pub fn park(
        &self,
        session_id: impl Into<String>,
        connection: GuacdConnection,
    ) -> Result<(), ParkingError> {
        let session_id = session_id.into();
        let mut entries = self.entries.lock();
        if entries.contains_key(&session_id) {
            return Err(ParkingError::AlreadyParked(session_id));
        }

        let (writer, reader) = connection.split();
        let (stop_tx, stop_rx) = oneshot::channel();
        let join_handle = tokio::spawn(keepalive_loop(writer, reader, stop_rx));
        entries.insert(
            session_id,
            ParkedEntry {
                stop_tx,
                join_handle,
                parked_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Remove and return the parked connection, stopping its keepalive
    /// task first.
    ///
    /// # Errors
    ///
    /// Returns [`ParkingError::NotParked`] if nothing is parked under
    /// `session_id`.
    pub async fn unpark(
        &self,
        session_id: &str,
    ) -> Result<GuacdConnection, ParkingError> {
        let entry = {
            let mut entries = self.entries.lock();
            entries
                .remove(session_id)
                .ok_or_else(|| ParkingError::NotParked(session_id.to_string()))?
        };
        // Stopping the keepalive task is the sole cancellation primitive
        // here; its loop exits promptly on the next select! tick.
        let _ = entry.stop_tx.send(());
        let (writer, reader) = entry
            .join_handle
            .await
            .map_err(|_| ParkingError::NotParked(session_id.to_string()))?;
        Ok(GuacdConnection::from_halves(writer, reader))
    }

    /// Remove the parked connection and drop it, closing the upstream
    /// socket.
    ///
    /// # Errors
    ///
    /// Returns [`ParkingError::NotParked`] if nothing is parked under
    /// `session_id`.
    pub async fn evict(&self, session_id: &str) -> Result<(), ParkingError> {
        let _connection = self.unpark(session_id).await?;
        Ok(())
    }

    /// Is a connection currently parked under `session_id`?
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.lock().contains_key(session_id)
    }

    /// Evict every entry parked for longer than `timeout`, returning the
    /// session IDs that were swept.
    pub async fn sweep_idle(&self, timeout: Duration) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, e)| {
                    (now - e.parked_at)
                        .to_std()
                        .map(|age| age >= timeout)
                        .unwrap_or(true)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &expired {
            let _ = self.evict(id).await;
        }
        expired
    }
}

/// Drains the parked `guacd` connection, answering `sync` so `guacd`
/// doesn't time the session out for lack of a peer. Everything else is
/// discarded — there's no browser to show it to. Exits (handing the
/// halves back) when told to stop, or when the upstream dies.
async fn keepalive_loop(
    mut writer: Box<dyn GuacdWriter>,
    mut reader: Box<dyn GuacdReader>,
    mut stop_rx: oneshot::Receiver<()>,
) -> (Box<dyn GuacdWriter>, Box<dyn GuacdReader>) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            result = reader.receive() => {
                match result {
                    Ok(inst) if inst.opcode == "sync" => {
                        if let Some(ts) = inst.args.first() {
                            let reply = codec::encode("sync", &[ts.as_str()]);
                            if writer.send(&reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }
    }
    (writer, reader)
}
