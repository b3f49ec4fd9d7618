//! # Connection Log — who is connected to what
//!
//! Active sessions keyed by a monotonically assigned id, with closed
//! sessions retained in a bounded history for after-action review. The
//! gate opens records at admission; listeners close them when the socket
//! goes away.

use gridforge_core::SimClock;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_HISTORY: usize = 1000;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionRecord {
    pub session_id: u64,
    pub peer: String,
    pub device: String,
    pub protocol: String,
    pub port: u16,
    pub src_network: String,
    pub connected_at: f64,
    pub closed_at: Option<f64>,
    pub requests_served: u64,
}

pub struct ConnectionLog {
    clock: Arc<SimClock>,
    active: RwLock<HashMap<u64, SessionRecord>>,
    history: RwLock<Vec<SessionRecord>>,
    next_id: AtomicU64,
}

impl ConnectionLog {
    pub fn new(clock: Arc<SimClock>) -> Self {
        Self {
            clock,
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn sim_now(&self) -> f64 {
        self.clock.now()
    }

    pub fn open(
        &self,
        peer: SocketAddr,
        device: &str,
        protocol: &str,
        port: u16,
        src_network: &str,
    ) -> u64 {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = SessionRecord {
            session_id,
            peer: peer.to_string(),
            device: device.to_string(),
            protocol: protocol.to_string(),
            port,
            src_network: src_network.to_string(),
            connected_at: self.clock.now(),
            closed_at: None,
            requests_served: 0,
        };
        info!(
            session = session_id,
            peer = %peer,
            device,
            protocol,
            "Session opened"
        );
        self.active.write().insert(session_id, record);
        session_id
    }

    pub fn record_request(&self, session_id: u64) {
        if let Some(record) = self.active.write().get_mut(&session_id) {
            record.requests_served += 1;
        }
    }

    pub fn close(&self, session_id: u64) {
        let record = self.active.write().remove(&session_id);
        if let Some(mut record) = record {
            record.closed_at = Some(self.clock.now());
            debug!(
                session = session_id,
                requests = record.requests_served,
                "Session closed"
            );
            let mut history = self.history.write();
            if history.len() >= MAX_HISTORY {
                history.remove(0);
            }
            history.push(record);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn active_sessions(&self) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = self.active.read().values().cloned().collect();
        sessions.sort_by_key(|s| s.session_id);
        sessions
    }

    pub fn history(&self) -> Vec<SessionRecord> {
        self.history.read().clone()
    }
}
