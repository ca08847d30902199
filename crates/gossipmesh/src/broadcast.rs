//! Queue of pending gossip broadcasts.
//!
//! Broadcasts are dedup-keyed by subject node: queueing a newer message
//! about a node retires any older one, so the queue always carries the
//! freshest known delta per subject. Entries retire after a
//! cluster-size-scaled number of transmissions, signalling an optional
//! drain notifier; `leave()` uses that notifier to wait until its own
//! death notice has been disseminated.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

struct QueuedBroadcast {
    /// Subject node name; the dedup key.
    name: String,

    /// Encoded message, ready to pack into a compound datagram.
    message: Bytes,

    /// How many gossip rounds have carried this entry so far.
    transmits: usize,

    /// Signalled when the entry leaves the queue.
    notify: Option<oneshot::Sender<()>>,
}

/// Shared broadcast queue, guarded by its own mutex.
pub struct BroadcastQueue {
    entries: Mutex<Vec<QueuedBroadcast>>,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Queue a broadcast about `name`, superseding any older entry for the
    /// same subject. The superseded entry's notifier fires immediately.
    pub fn enqueue(&self, name: &str, message: Bytes, notify: Option<oneshot::Sender<()>>) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|entry| entry.name == name) {
            let old = entries.remove(pos);
            if let Some(tx) = old.notify {
                let _ = tx.send(());
            }
        }
        entries.push(QueuedBroadcast {
            name: name.to_string(),
            message,
            transmits: 0,
            notify,
        });
    }

    /// Pull messages for one gossip datagram.
    ///
    /// Selects least-transmitted entries first, takes as many as fit in
    /// `bytes_available` counting `overhead` per message, bumps their
    /// transmit counts, and retires entries that have reached
    /// `transmit_limit`.
    pub fn get_broadcasts(
        &self,
        overhead: usize,
        bytes_available: usize,
        transmit_limit: usize,
    ) -> Vec<Bytes> {
        let mut entries = self.entries.lock();
        entries.sort_by_key(|entry| entry.transmits);

        let mut selected = Vec::new();
        let mut used = 0;
        let mut retired = Vec::new();
        for (pos, entry) in entries.iter_mut().enumerate() {
            let cost = overhead + entry.message.len();
            if used + cost > bytes_available {
                continue;
            }
            used += cost;
            selected.push(entry.message.clone());
            entry.transmits += 1;
            if entry.transmits >= transmit_limit {
                retired.push(pos);
            }
        }

        for pos in retired.into_iter().rev() {
            let old = entries.remove(pos);
            if let Some(tx) = old.notify {
                let _ = tx.send(());
            }
        }
        selected
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for BroadcastQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Retire a broadcast after `retransmit_mult * log10(n + 1)` rounds,
/// mirroring how the suspicion timeout scales with cluster size.
pub(crate) fn transmit_limit(retransmit_mult: u32, n: usize) -> usize {
    let scale = ((n.max(1) + 1) as f64).log10();
    ((retransmit_mult as f64) * scale).ceil() as usize
}
