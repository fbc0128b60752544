//! In-memory room hubs: the set of live WebSocket connections per room.
//!
//! A hub is a cache of live peers, not the source of truth — rooms persist in
//! storage and the hub for a token is recreated whenever the next peer
//! connects.  Each connection carries a small bounded outbound queue with two
//! enqueue modes: best-effort for live fan-out (a slow peer drops frames
//! rather than stalling the room) and reliable for history replay (a
//! reconnecting client must not observe gaps).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::config::OUTBOUND_QUEUE_DEPTH;

/// Returned by [`Connection::enqueue_reliable`] when the writer side is gone.
#[derive(Debug)]
pub struct ConnectionClosed;

impl std::fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection closed")
    }
}

impl std::error::Error for ConnectionClosed {}

/// One peer's outbound half.  The paired receiver is drained into the socket
/// by the connection's writer task; dropping every sender (hub removal plus
/// this handle) terminates that task exactly once.
pub struct Connection {
    id: u64,
    outbound: mpsc::Sender<String>,
}

impl Connection {
    fn open(id: u64) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        (Self { id, outbound }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Best-effort enqueue: if the queue is full the frame is dropped
    /// silently.  Never blocks the broadcaster.
    pub fn enqueue(&self, frame: &str) {
        let _ = self.outbound.try_send(frame.to_string());
    }

    /// Reliable enqueue: waits for queue space.  Fails only when the
    /// connection has closed.
    pub async fn enqueue_reliable(&self, frame: String) -> Result<(), ConnectionClosed> {
        self.outbound.send(frame).await.map_err(|_| ConnectionClosed)
    }
}

/// Live connections of one room.
pub struct Hub {
    members: Mutex<HashMap<u64, mpsc::Sender<String>>>,
}

impl Hub {
    fn new() -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
        }
    }

    fn add(&self, conn: &Connection) {
        self.members
            .lock()
            .unwrap()
            .insert(conn.id, conn.outbound.clone());
    }

    fn remove(&self, conn_id: u64) {
        self.members.lock().unwrap().remove(&conn_id);
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort enqueue to every member.
    pub fn broadcast(&self, frame: &str) {
        let members = self.members.lock().unwrap();
        for sender in members.values() {
            let _ = sender.try_send(frame.to_string());
        }
    }

    /// Best-effort enqueue to every member except the sender.
    pub fn broadcast_except(&self, frame: &str, sender_id: u64) {
        let members = self.members.lock().unwrap();
        for (id, sender) in members.iter() {
            if *id == sender_id {
                continue;
            }
            let _ = sender.try_send(frame.to_string());
        }
    }
}

/// Process-wide map of room token → hub.  Populated lazily on the first
/// connection for a room and dropped when the last member departs.
pub struct HubRegistry {
    next_conn_id: AtomicU64,
    hubs: Mutex<HashMap<String, std::sync::Arc<Hub>>>,
}

/// The room already holds the maximum allowed members.
#[derive(Debug)]
pub struct RoomFull;

impl HubRegistry {
    pub fn new() -> Self {
        Self {
            next_conn_id: AtomicU64::new(1),
            hubs: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live members in a room's hub, 0 when no hub exists.
    pub fn member_count(&self, token: &str) -> usize {
        self.hubs
            .lock()
            .unwrap()
            .get(token)
            .map(|hub| hub.len())
            .unwrap_or(0)
    }

    /// Register a fresh connection in the room's hub, creating the hub if
    /// this is the first peer.  The capacity check and the insert happen
    /// under the registry lock, so the cap cannot be exceeded by racing
    /// joins.
    pub fn join(
        &self,
        token: &str,
        max_members: usize,
    ) -> Result<(std::sync::Arc<Hub>, Connection, mpsc::Receiver<String>), RoomFull> {
        let mut hubs = self.hubs.lock().unwrap();

        let hub = hubs
            .entry(token.to_string())
            .or_insert_with(|| std::sync::Arc::new(Hub::new()))
            .clone();

        if hub.len() >= max_members {
            if hub.is_empty() {
                hubs.remove(token);
            }
            return Err(RoomFull);
        }

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (conn, rx) = Connection::open(id);
        hub.add(&conn);
        Ok((hub, conn, rx))
    }

    /// Deregister a connection; the hub itself is dropped with its last
    /// member.  The room may still exist in storage and gets a fresh hub on
    /// the next join.
    pub fn leave(&self, token: &str, conn_id: u64) {
        let mut hubs = self.hubs.lock().unwrap();
        if let Some(hub) = hubs.get(token) {
            hub.remove(conn_id);
            if hub.is_empty() {
                hubs.remove(token);
            }
        }
    }
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn best_effort_enqueue_drops_when_full() {
        let (conn, mut rx) = Connection::open(1);

        for i in 0..OUTBOUND_QUEUE_DEPTH + 4 {
            conn.enqueue(&format!("frame-{i}"));
        }

        let mut received = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            received.push(frame);
        }
        // Exactly the queue depth survives, in enqueue order.
        assert_eq!(received.len(), OUTBOUND_QUEUE_DEPTH);
        assert_eq!(received[0], "frame-0");
        assert_eq!(received[OUTBOUND_QUEUE_DEPTH - 1], format!("frame-{}", OUTBOUND_QUEUE_DEPTH - 1));
    }

    #[tokio::test]
    async fn reliable_enqueue_waits_for_space() {
        let (conn, mut rx) = Connection::open(1);
        for _ in 0..OUTBOUND_QUEUE_DEPTH {
            conn.enqueue("filler");
        }

        let pending = tokio::spawn(async move {
            conn.enqueue_reliable("important".to_string()).await.unwrap();
            conn
        });

        // Drain one slot; the blocked send must complete.
        let _ = rx.recv().await;
        let conn = pending.await.unwrap();

        let mut last = None;
        while let Ok(frame) = rx.try_recv() {
            last = Some(frame);
        }
        assert_eq!(last.as_deref(), Some("important"));
        drop(conn);
    }

    #[tokio::test]
    async fn reliable_enqueue_fails_after_close() {
        let (conn, rx) = Connection::open(1);
        drop(rx);
        assert!(conn.enqueue_reliable("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_sender() {
        let registry = HubRegistry::new();
        let (hub, alice, mut alice_rx) = registry.join("room", 2).unwrap();
        let (_, bob, mut bob_rx) = registry.join("room", 2).unwrap();

        hub.broadcast_except("from-alice", alice.id());

        assert_eq!(bob_rx.try_recv().unwrap(), "from-alice");
        assert!(alice_rx.try_recv().is_err());

        hub.broadcast("to-everyone");
        assert_eq!(alice_rx.try_recv().unwrap(), "to-everyone");
        assert_eq!(bob_rx.try_recv().unwrap(), "to-everyone");
        drop(bob);
    }

    #[tokio::test]
    async fn join_enforces_member_cap() {
        let registry = HubRegistry::new();
        let (_hub, _a, _arx) = registry.join("room", 2).unwrap();
        let (_, _b, _brx) = registry.join("room", 2).unwrap();

        assert!(registry.join("room", 2).is_err());
        assert_eq!(registry.member_count("room"), 2);
    }

    #[tokio::test]
    async fn last_leave_drops_the_hub() {
        let registry = HubRegistry::new();
        let (_hub, a, _arx) = registry.join("room", 2).unwrap();
        let (_, b, _brx) = registry.join("room", 2).unwrap();

        registry.leave("room", a.id());
        assert_eq!(registry.member_count("room"), 1);

        registry.leave("room", b.id());
        assert_eq!(registry.member_count("room"), 0);
        assert!(registry.hubs.lock().unwrap().is_empty());

        // A later join recreates the hub from scratch.
        assert!(registry.join("room", 2).is_ok());
    }
}
