//! Ack-handler table: correlates inbound acks with outstanding probes.
//!
//! Every outgoing ping registers a handler keyed by its sequence number.
//! The handler is destroyed either by `invoke` when the ack arrives or by
//! its timeout reaper, whichever removes the entry from the map first;
//! that removal is the linearization point, so exactly one of the two
//! outcomes is ever signalled.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum AckSignal {
    /// Probe path: `true` on ack, `false` on timeout. Delivery is
    /// non-blocking; a consumer that is not waiting misses the signal.
    Channel(mpsc::Sender<bool>),

    /// Indirect-relay path: run on ack, silently reaped on timeout.
    Callback(Box<dyn FnOnce() + Send>),
}

struct AckEntry {
    signal: AckSignal,
    reaper: Option<JoinHandle<()>>,
}

/// Table of outstanding probe completions, guarded by its own mutex.
///
/// The mutex is never held while signalling a channel or running a
/// callback.
#[derive(Clone)]
pub struct AckTable {
    entries: Arc<Mutex<HashMap<u32, AckEntry>>>,
}

impl AckTable {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a channel-backed handler. After `timeout` the entry is
    /// reaped and `false` is offered on the channel.
    pub fn register_channel(&self, seq_no: u32, tx: mpsc::Sender<bool>, timeout: Duration) {
        self.register(seq_no, AckSignal::Channel(tx), timeout);
    }

    /// Register a callback handler. After `timeout` the entry is reaped
    /// without running the callback.
    pub fn register_callback<F>(&self, seq_no: u32, callback: F, timeout: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(seq_no, AckSignal::Callback(Box::new(callback)), timeout);
    }

    fn register(&self, seq_no: u32, signal: AckSignal, timeout: Duration) {
        // The entry goes in before the reaper is armed so the reaper can
        // never race an entry it cannot see.
        self.entries
            .lock()
            .insert(seq_no, AckEntry { signal, reaper: None });

        let entries = Arc::clone(&self.entries);
        let reaper = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let removed = entries.lock().remove(&seq_no);
            if let Some(entry) = removed {
                if let AckSignal::Channel(tx) = entry.signal {
                    let _ = tx.try_send(false);
                }
            }
        });

        let mut entries = self.entries.lock();
        match entries.get_mut(&seq_no) {
            Some(entry) => entry.reaper = Some(reaper),
            // The ack already arrived; the reaper will find nothing.
            None => reaper.abort(),
        }
    }

    /// Signal success for a sequence number, if its handler is still
    /// registered, and reap the entry.
    pub fn invoke(&self, seq_no: u32) {
        let removed = self.entries.lock().remove(&seq_no);
        let Some(entry) = removed else {
            return;
        };
        if let Some(reaper) = entry.reaper {
            reaper.abort();
        }
        match entry.signal {
            AckSignal::Channel(tx) => {
                let _ = tx.try_send(true);
            }
            AckSignal::Callback(callback) => callback(),
        }
    }

    /// Number of outstanding handlers.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every outstanding handler and cancel its reaper. Used on
    /// shutdown; pending waiters observe their channels closing.
    pub fn clear(&self) {
        let drained: Vec<AckEntry> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            if let Some(reaper) = entry.reaper {
                reaper.abort();
            }
        }
    }
}

impl Default for AckTable {
    fn default() -> Self {
        Self::new()
    }
}
