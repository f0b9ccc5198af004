//! The upstream→downstream pump: one Tokio task per active master, reading
//! `guacd` instructions and pushing them into the master's actor mailbox
//! for fan-out. Kept as a plain task rather than another actor so the
//! long-lived blocking `receive()` never competes with the handler's own
//! mailbox processing for a lock.

use actix::Addr;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::guacd::GuacdReader;
use crate::session::handler::SessionHandler;
use crate::session::messages::{DeliverUpstream, UpstreamClosed};

/// A running pump task and the means to stop it.
pub struct ReaderHandle {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<Box<dyn GuacdReader>>,
}

impl ReaderHandle {
    /// Spawn the pump, reading from `reader` and delivering to `master`.
    pub fn spawn(
        reader: Box<dyn GuacdReader>,
        master: Addr<SessionHandler>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(run(reader, master, stop_rx));
        Self { stop_tx, join }
    }

    /// Signal the pump to stop and wait for it to hand back its reader
    /// half. Idempotent from the caller's perspective: always resolves
    /// once the task notices the stop signal or the upstream closes on
    /// its own.
    pub async fn stop(self) -> Box<dyn GuacdReader> {
        let _ = self.stop_tx.send(());
        self.join.await.expect("reader task panicked")
    }
}

async fn run(
    mut reader: Box<dyn GuacdReader>,
    master: Addr<SessionHandler>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Box<dyn GuacdReader> {
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            result = reader.receive() => {
                match result {
                    Ok(instruction) => {
                        master.do_send(DeliverUpstream(instruction.encode()));
                    }
                    Err(_) => {
                        master.do_send(UpstreamClosed);
                        break;
                    }
                }
            }
        }
    }
    reader
}
