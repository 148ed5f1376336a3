//! Connection records (spec §3), held in a central ownership container
//! per the §9 redesign note ("arena + stable index, event-loop slots
//! hold only indices") rather than an intrusive linked list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use parking_lot::Mutex;

use crate::db::AuthorizedSession;
use crate::event_loop::Handle;

pub type ConnId = u64;

/// Per-connection mutable state, guarded by the record's own lock
/// (spec §5 "per-connection mutex"). Reset in place when a record is
/// recycled rather than reallocated.
pub struct ConnectionState {
    pub client: Option<TcpStream>,
    pub backend: Option<TcpStream>,
    pub client_handle: Option<Handle>,
    pub backend_handle: Option<Handle>,
    pub request_count: u32,
    pub response_count: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub start_time: Instant,
    pub recent_time: Instant,
    pub in_list: bool,
    pub session: Option<AuthorizedSession>,
    pub insert_id: i64,
    pub ip: String,
    pub attempts: u64,
    pub analyzer_handle: Option<u64>,
}

impl ConnectionState {
    fn reset(&mut self) {
        self.client = None;
        self.backend = None;
        self.client_handle = None;
        self.backend_handle = None;
        self.request_count = 0;
        self.response_count = 0;
        self.bytes_sent = 0;
        self.bytes_received = 0;
        let now = Instant::now();
        self.start_time = now;
        self.recent_time = now;
        self.in_list = false;
        self.session = None;
        self.insert_id = 0;
        self.ip.clear();
        self.attempts = 0;
        self.analyzer_handle = None;
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        let now = Instant::now();
        ConnectionState {
            client: None,
            backend: None,
            client_handle: None,
            backend_handle: None,
            request_count: 0,
            response_count: 0,
            bytes_sent: 0,
            bytes_received: 0,
            start_time: now,
            recent_time: now,
            in_list: false,
            session: None,
            insert_id: 0,
            ip: String::new(),
            attempts: 0,
            analyzer_handle: None,
        }
    }
}

/// One live (or recycled-but-idle) client↔backend pair.
pub struct Connection {
    /// Assigned fresh on each allocation from the free pool; strictly
    /// increasing across the process lifetime (spec §8 "connection id
    /// monotonicity"). An `AtomicU64` rather than a plain field so a
    /// free-pooled record can be reassigned an id before its next use.
    id: AtomicU64,
    pub state: Mutex<ConnectionState>,
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.id.load(Ordering::Relaxed)
    }
}

/// Owns the global connection list, the free pool, and connection id
/// assignment (spec §3 "Global state").
pub struct ConnectionTable {
    next_id: AtomicU64,
    list: Mutex<HashMap<ConnId, Arc<Connection>>>,
    free_pool: Mutex<Vec<Arc<Connection>>>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        ConnectionTable {
            next_id: AtomicU64::new(1),
            list: Mutex::new(HashMap::new()),
            free_pool: Mutex::new(Vec::new()),
        }
    }

    /// Takes a record from the free pool (resetting it) or allocates a
    /// fresh one, assigns the next monotonic id, but does **not**
    /// attach it to the global list — the caller does that once the
    /// backend connect succeeds.
    pub fn allocate(&self) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.free_pool.lock().pop() {
            Some(mut arc) => {
                // Uniquely owned: nothing else can hold a reference to
                // a free-pooled record, so `get_mut` never fails here.
                let conn = Arc::get_mut(&mut arc).expect("free-pooled record is not shared");
                conn.id.store(id, Ordering::Relaxed);
                arc
            }
            None => Arc::new(Connection {
                id: AtomicU64::new(id),
                state: Mutex::new(ConnectionState::default()),
            }),
        }
    }

    /// O(1) lookup by id, used by the relay to resolve an event
    /// loop's opaque `payload` back to a record.
    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.list.lock().get(&id).cloned()
    }

    pub fn attach(&self, conn: Arc<Connection>) {
        conn.state.lock().in_list = true;
        self.list.lock().insert(conn.id(), conn);
    }

    /// Detaches `id` from the global list, returning the record if it
    /// was present. Does not release it to the free pool — the caller
    /// does that once it has finished closing fds/unregistering
    /// handles.
    pub fn detach(&self, id: ConnId) -> Option<Arc<Connection>> {
        let conn = self.list.lock().remove(&id);
        if let Some(conn) = &conn {
            conn.state.lock().in_list = false;
        }
        conn
    }

    /// Returns a record to the free pool. Panics in debug builds if
    /// the caller forgot to `detach` first, since that would violate
    /// the free-pool/list mutual-exclusion invariant (spec §8).
    pub fn release(&self, conn: Arc<Connection>) {
        debug_assert!(!conn.state.lock().in_list, "releasing a record still in the list");
        conn.state.lock().reset();
        self.free_pool.lock().push(conn);
    }

    /// Snapshot of all currently-live records, taken under the list
    /// lock and then released — the reaper walks this copy without
    /// holding the list lock (spec §4.5).
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.list.lock().values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.list.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_monotonic() {
        let table = ConnectionTable::new();
        let a = table.allocate();
        let b = table.allocate();
        assert!(a.id() < b.id());
    }

    #[test]
    fn detach_then_release_is_not_simultaneously_listed_and_pooled() {
        let table = ConnectionTable::new();
        let conn = table.allocate();
        let id = conn.id();
        table.attach(conn);
        assert_eq!(table.live_count(), 1);

        let detached = table.detach(id).expect("was attached");
        assert_eq!(table.live_count(), 0);
        table.release(detached);
    }

    #[test]
    fn snapshot_reflects_attached_records() {
        let table = ConnectionTable::new();
        let conn = table.allocate();
        table.attach(conn);
        assert_eq!(table.snapshot().len(), 1);
    }
}
