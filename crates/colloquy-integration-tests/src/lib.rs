//! Shared harness for the end-to-end scenarios.
//!
//! Provides an in-process fake transport (`FakeLink` / `FakeFactory`),
//! store seeding helpers, and event/polling utilities. Tests drive the
//! engine through its public handle and observe effects through the event
//! bus, the fake link's sent frames, and a second read-only connection to
//! the same database file.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use colloquy_db::Store;
use colloquy_engine::{EngineEvent, LinkFactory};
use colloquy_model::Conversation;
use colloquy_proto::{Iq, PeerLink};
use colloquy_types::{DatabaseId, ErrorCode, DEVICE_STATE_VALID};

/// A recording in-process peer link.
pub struct FakeLink {
    /// Conversation this link was opened for.
    pub conversation: Uuid,
    minor: i32,
    best_chunk_size: usize,
    files_dir: Option<PathBuf>,
    device_state: AtomicU32,
    next_request: AtomicI64,
    sent: Mutex<VecDeque<Vec<u8>>>,
    closed: Mutex<Option<ErrorCode>>,
}

impl FakeLink {
    pub fn new(
        conversation: Uuid,
        minor: i32,
        best_chunk_size: usize,
        files_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conversation,
            minor,
            best_chunk_size,
            files_dir,
            device_state: AtomicU32::new(DEVICE_STATE_VALID),
            next_request: AtomicI64::new(1),
            sent: Mutex::new(VecDeque::new()),
            closed: Mutex::new(None),
        })
    }

    fn lock_sent(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Frames sent so far.
    pub fn sent_count(&self) -> usize {
        self.lock_sent().len()
    }

    /// Decode and drain every sent frame.
    pub fn drain_sent(&self) -> Vec<Iq> {
        let frames: Vec<Vec<u8>> = self.lock_sent().drain(..).collect();
        frames
            .iter()
            .filter_map(|bytes| Iq::decode(bytes).expect("sent frame decodes"))
            .collect()
    }

    /// The reason this link was closed with, when it was.
    pub fn closed_reason(&self) -> Option<ErrorCode> {
        *self
            .closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Override the peer device state bits reported by this link.
    pub fn set_device_state(&self, state: u32) {
        self.device_state.store(state, Ordering::SeqCst);
    }
}

impl PeerLink for FakeLink {
    fn send_packet(&self, bytes: Vec<u8>) -> Result<(), ErrorCode> {
        self.lock_sent().push_back(bytes);
        Ok(())
    }

    fn new_request_id(&self) -> i64 {
        self.next_request.fetch_add(1, Ordering::SeqCst)
    }

    fn max_peer_major_version(&self) -> i32 {
        2
    }

    fn max_peer_minor_version(&self, major: i32) -> i32 {
        if major == 2 {
            self.minor
        } else {
            0
        }
    }

    fn best_chunk_size(&self) -> usize {
        self.best_chunk_size
    }

    fn files_dir(&self) -> Option<PathBuf> {
        self.files_dir.clone()
    }

    fn peer_device_state(&self) -> u32 {
        self.device_state.load(Ordering::SeqCst)
    }

    fn close(&self, reason: ErrorCode) {
        let mut closed = self
            .closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *closed = Some(reason);
    }
}

/// Factory handing out recording links.
pub struct FakeFactory {
    minor: i32,
    best_chunk_size: usize,
    files_dir: Option<PathBuf>,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeFactory {
    pub fn new(minor: i32, best_chunk_size: usize, files_dir: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            minor,
            best_chunk_size,
            files_dir,
            links: Mutex::new(Vec::new()),
        })
    }

    fn lock_links(&self) -> std::sync::MutexGuard<'_, Vec<Arc<FakeLink>>> {
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// How many outgoing links were started.
    pub fn link_count(&self) -> usize {
        self.lock_links().len()
    }

    /// The most recently started link.
    pub fn last_link(&self) -> Option<Arc<FakeLink>> {
        self.lock_links().last().cloned()
    }

    /// The most recent link for one conversation.
    pub fn link_for(&self, conversation: &Uuid) -> Option<Arc<FakeLink>> {
        self.lock_links()
            .iter()
            .rev()
            .find(|link| link.conversation == *conversation)
            .cloned()
    }
}

impl LinkFactory for FakeFactory {
    fn start_outgoing(&self, conversation: &Conversation) -> Result<Arc<dyn PeerLink>, ErrorCode> {
        let link = FakeLink::new(
            conversation.uuid,
            self.minor,
            self.best_chunk_size,
            self.files_dir.clone(),
        );
        self.lock_links().push(link.clone());
        Ok(link)
    }
}

/// Initialize test logging once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Open a store on a fresh temp database; returns the store and the path
/// reusable for read-only assertion connections.
pub fn open_store(dir: &tempfile::TempDir) -> (Store, PathBuf) {
    let path = dir.path().join("colloquy.db");
    let store = Store::open(&path, &|_| None).expect("open store");
    (store, path)
}

/// A second connection to the database for assertions.
pub fn reader(path: &Path) -> rusqlite::Connection {
    rusqlite::Connection::open(path).expect("open reader")
}

/// Seed a contact conversation. With `ours_low`, our twincode sorts below
/// the peer's so incoming links are accepted.
pub fn seed_contact(store: &mut Store, ours_low: bool) -> Conversation {
    let (ours, peer) = if ours_low {
        (Uuid::from_u128(0x10), Uuid::from_u128(0x20))
    } else {
        (Uuid::from_u128(0x20), Uuid::from_u128(0x10))
    };
    store
        .create_conversation(Uuid::new_v4(), ours, peer, Uuid::new_v4(), 1_000)
        .expect("seed contact")
}

/// Seed a group with two members; returns `(group, member1, member2)`.
pub fn seed_group(store: &mut Store) -> (Conversation, Conversation, Conversation) {
    let group = store
        .create_group_conversation(
            Uuid::new_v4(),
            Uuid::from_u128(0x0b),
            Uuid::new_v4(),
            true,
            1_000,
        )
        .expect("seed group");
    let member1 = store
        .create_group_member(
            &group,
            Uuid::from_u128(0xa1),
            colloquy_types::DEFAULT_PERMISSIONS,
            None,
            1_001,
        )
        .expect("member 1")
        .expect("member 1 created");
    let member2 = store
        .create_group_member(
            &group,
            Uuid::from_u128(0xa2),
            colloquy_types::DEFAULT_PERMISSIONS,
            None,
            1_002,
        )
        .expect("member 2")
        .expect("member 2 created");
    (group, member1, member2)
}

/// Wait until a matching event arrives; `None` on timeout.
pub async fn wait_event(
    rx: &mut broadcast::Receiver<EngineEvent>,
    predicate: impl Fn(&EngineEvent) -> bool,
) -> Option<EngineEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if predicate(&event) => return Some(event),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

/// Poll a condition until it holds; returns whether it did within 5 s.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Count rows of a table through a reader connection.
pub fn count_rows(conn: &rusqlite::Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .expect("count rows")
}

/// Load one descriptor column by row id.
pub fn descriptor_date(conn: &rusqlite::Connection, id: DatabaseId, column: &str) -> i64 {
    conn.query_row(
        &format!("SELECT {column} FROM descriptor WHERE id = ?1"),
        [id],
        |row| row.get(0),
    )
    .expect("descriptor date")
}
