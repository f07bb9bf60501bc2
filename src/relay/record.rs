//! Connection records and the sub-connection registry

use super::{Frame, RelayError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

/// State shared by every task bound to one connection.
///
/// Represents either the main channel (empty id) or a sub-connection. The
/// queue receivers are handed to the pump tasks at spawn time; the record
/// keeps the senders for frame routing.
pub struct ConnRecord {
    id: String,
    info: String,
    established: AtomicBool,
    established_notify: Notify,
    needs_close: AtomicBool,
    activity: AtomicU64,
    pending_pings: AtomicU32,
    outbound_tx: mpsc::Sender<Frame>,
    inbound_tx: mpsc::Sender<Frame>,
}

/// Queue receivers belonging to a freshly created record.
pub struct ConnQueues {
    pub outbound_rx: mpsc::Receiver<Frame>,
    pub inbound_rx: mpsc::Receiver<Frame>,
}

impl ConnRecord {
    /// Create a record with bounded queues of `capacity` frames each.
    pub fn new(id: String, info: String, capacity: usize) -> (Arc<Self>, ConnQueues) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);

        let record = Arc::new(Self {
            id,
            info,
            established: AtomicBool::new(false),
            established_notify: Notify::new(),
            needs_close: AtomicBool::new(false),
            activity: AtomicU64::new(0),
            pending_pings: AtomicU32::new(0),
            outbound_tx,
            inbound_tx,
        });

        (
            record,
            ConnQueues {
                outbound_rx,
                inbound_rx,
            },
        )
    }

    /// Sub-connection id; empty for the main channel.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Peer description for logging.
    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    pub fn set_established(&self) {
        self.established.store(true, Ordering::SeqCst);
        self.established_notify.notify_waiters();
    }

    /// Resolve once the record is established.
    pub async fn established(&self) {
        loop {
            let notified = self.established_notify.notified();
            if self.is_established() {
                return;
            }
            notified.await;
        }
    }

    /// True once any task has requested orderly teardown. Latches.
    pub fn needs_close(&self) -> bool {
        self.needs_close.load(Ordering::SeqCst)
    }

    pub fn request_close(&self) {
        self.needs_close.store(true, Ordering::SeqCst);
    }

    /// Count one moved frame toward the activity window.
    pub fn touch_activity(&self) {
        self.activity.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset the activity counter.
    pub fn take_activity(&self) -> u64 {
        self.activity.swap(0, Ordering::Relaxed)
    }

    /// Pings sent since the last pong.
    pub fn pending_pings(&self) -> u32 {
        self.pending_pings.load(Ordering::SeqCst)
    }

    pub fn ping_sent(&self) {
        self.pending_pings.fetch_add(1, Ordering::SeqCst);
    }

    /// Any pong counts; pings are not individually matched.
    pub fn pong_received(&self) {
        self.pending_pings.store(0, Ordering::SeqCst);
    }

    /// Queue of frames to be written to this record's stream.
    pub fn outbound(&self) -> &mpsc::Sender<Frame> {
        &self.outbound_tx
    }

    /// Queue of frames read from this record's stream.
    pub fn inbound(&self) -> &mpsc::Sender<Frame> {
        &self.inbound_tx
    }
}

impl std::fmt::Debug for ConnRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnRecord")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("established", &self.is_established())
            .field("needs_close", &self.needs_close())
            .finish_non_exhaustive()
    }
}

/// Registry of live sub-connections, keyed by id.
///
/// Frames arrive on the main-channel dispatcher while records are inserted
/// and removed by per-connection supervisors, so all access goes through a
/// mutexed map with insert-if-absent semantics.
#[derive(Default)]
pub struct ConnRegistry {
    inner: Mutex<HashMap<String, Arc<ConnRecord>>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the record unless its id is already taken.
    pub fn insert(&self, record: Arc<ConnRecord>) -> Result<(), RelayError> {
        let mut map = self.inner.lock().expect("registry poisoned");
        match map.entry(record.id().to_string()) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(RelayError::DuplicateId(record.id().to_string()))
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConnRecord>> {
        self.inner.lock().expect("registry poisoned").get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ConnRecord>> {
        self.inner.lock().expect("registry poisoned").remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
