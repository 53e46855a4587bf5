use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{info, warn};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::{Session, SessionSink};

/// A session as persisted: the store-assigned id plus its content.
#[derive(Debug, Serialize)]
pub struct StoredSession {
    pub id: u64,
    #[serde(flatten)]
    pub session: Session,
}

/// Append-only JSON-lines session store that broadcasts every stored
/// session to its subscribers.
pub struct SessionStore {
    writer: Option<Mutex<BufWriter<File>>>,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Sender<Arc<StoredSession>>>>,
}

impl SessionStore {
    /// Store that only notifies subscribers.
    pub fn in_memory() -> Self {
        SessionStore {
            writer: None,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Append sessions to `path`, creating it if needed.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context(format!("Failed to open session store: {}", path.display()))?;
        info!("Writing sessions to {}", path.display());
        Ok(SessionStore {
            writer: Some(Mutex::new(BufWriter::new(file))),
            ..Self::in_memory()
        })
    }

    /// Receive every session stored from now on.
    pub fn subscribe(&self) -> Receiver<Arc<StoredSession>> {
        let (tx, rx) = unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Number of sessions stored so far.
    pub fn stored(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    /// Drop all subscriber channels so their receivers see disconnection.
    pub fn close_subscribers(&self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
    }

    fn write_line(&self, stored: &StoredSession) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };
        let mut w = writer
            .lock()
            .map_err(|_| anyhow::anyhow!("session store writer poisoned"))?;
        serde_json::to_writer(&mut *w, stored)?;
        w.write_all(b"\n")?;
        w.flush()?;
        Ok(())
    }

    fn notify(&self, stored: Arc<StoredSession>) {
        if let Ok(mut subs) = self.subscribers.lock() {
            // Receivers that went away are forgotten.
            subs.retain(|tx| tx.send(Arc::clone(&stored)).is_ok());
        }
    }
}

impl SessionSink for SessionStore {
    fn persist_and_notify(&self, session: Session) -> bool {
        let stored = StoredSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            session,
        };
        if let Err(e) = self.write_line(&stored) {
            warn!("Failed to store session {}: {:#}", stored.id, e);
            return false;
        }
        info!(
            "Stored session {} ({} {} -> {}, {} packets)",
            stored.id,
            stored.session.protocol,
            stored.session.client,
            stored.session.server,
            stored.session.packets.len()
        );
        self.notify(Arc::new(stored));
        true
    }
}
