//! # Network Gate — admission control at connection accept
//!
//! Every listener hands each accepted socket's peer address here before a
//! session task exists. The gate classifies the peer into a source
//! network, evaluates reachability, and either admits (session record +
//! `ConnectionAllowed`) or denies (socket is closed by the caller,
//! `ConnectionDenied` appended to the bounded denial log). Reachability:
//! the destination is a member of the source network, or an explicit
//! allow rule matches `(src_network, device, protocol, port)`.

use crate::connections::ConnectionLog;
use crate::topology::Topology;
use gridforge_core::config::AllowRuleSpec;
use gridforge_core::{EventLog, KernelEvent};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_DENIALS: usize = 10_000;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed {
        src_network: String,
        session_id: u64,
    },
    Denied {
        src_network: String,
        reason: String,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DenialRecord {
    pub peer: String,
    pub device: String,
    pub protocol: String,
    pub port: u16,
    pub src_network: String,
    pub reason: String,
    pub sim_time: f64,
}

pub struct NetworkGate {
    topology: RwLock<Topology>,
    allow_rules: RwLock<Vec<AllowRuleSpec>>,
    connections: Arc<ConnectionLog>,
    events: Arc<EventLog>,
    denials: RwLock<Vec<DenialRecord>>,
    total_allowed: AtomicU64,
    total_denied: AtomicU64,
}

impl NetworkGate {
    pub fn new(
        topology: Topology,
        allow_rules: Vec<AllowRuleSpec>,
        connections: Arc<ConnectionLog>,
        events: Arc<EventLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            topology: RwLock::new(topology),
            allow_rules: RwLock::new(allow_rules),
            connections,
            events,
            denials: RwLock::new(Vec::new()),
            total_allowed: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
        })
    }

    /// Run a closure against the topology (membership edits, queries).
    pub fn with_topology<R>(&self, f: impl FnOnce(&mut Topology) -> R) -> R {
        f(&mut self.topology.write())
    }

    pub fn add_allow_rule(&self, rule: AllowRuleSpec) {
        info!(?rule, "Allow rule added");
        self.allow_rules.write().push(rule);
    }

    pub fn connections(&self) -> &Arc<ConnectionLog> {
        &self.connections
    }

    /// Reachability decision without side effects.
    pub fn can_reach(
        &self,
        src_network: &str,
        device: &str,
        protocol: &str,
        port: u16,
    ) -> (bool, &'static str) {
        let topo = self.topology.read();
        match topo.service_protocol(device, port) {
            None => return (false, "service_not_exposed"),
            Some(p) if p != protocol => return (false, "protocol_mismatch"),
            Some(_) => {}
        }
        if topo.is_member(device, src_network) {
            return (true, "same_network");
        }
        drop(topo);
        let rules = self.allow_rules.read();
        let matched = rules.iter().any(|r| {
            r.src_network == src_network
                && r.device == device
                && r.protocol == protocol
                && r.port == port
        });
        if matched {
            (true, "allow_rule")
        } else {
            (false, "not_reachable")
        }
    }

    /// Admission check for an accepted connection. On deny the caller
    /// closes the socket immediately; no session task may be spawned.
    pub fn admit(
        &self,
        peer: SocketAddr,
        device: &str,
        protocol: &str,
        port: u16,
    ) -> Admission {
        let src_network = self.topology.read().classify_peer(peer.ip());
        let (allowed, reason) = self.can_reach(&src_network, device, protocol, port);

        if allowed {
            self.total_allowed.fetch_add(1, Ordering::Relaxed);
            let session_id = self.connections.open(peer, device, protocol, port, &src_network);
            debug!(
                peer = %peer,
                device,
                protocol,
                port,
                src_network = %src_network,
                reason,
                "Connection admitted"
            );
            self.events.publish(KernelEvent::ConnectionAllowed {
                peer: peer.to_string(),
                device: device.to_string(),
                protocol: protocol.to_string(),
                port,
                src_network: src_network.clone(),
            });
            Admission::Allowed {
                src_network,
                session_id,
            }
        } else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            warn!(
                peer = %peer,
                device,
                protocol,
                port,
                src_network = %src_network,
                reason,
                "Connection denied"
            );
            let record = DenialRecord {
                peer: peer.to_string(),
                device: device.to_string(),
                protocol: protocol.to_string(),
                port,
                src_network: src_network.clone(),
                reason: reason.to_string(),
                sim_time: self.connections.sim_now(),
            };
            let mut denials = self.denials.write();
            if denials.len() >= MAX_DENIALS {
                denials.remove(0);
            }
            denials.push(record);
            drop(denials);
            self.events.publish(KernelEvent::ConnectionDenied {
                peer: peer.to_string(),
                device: device.to_string(),
                protocol: protocol.to_string(),
                port,
                reason: reason.to_string(),
            });
            Admission::Denied {
                src_network,
                reason: reason.to_string(),
            }
        }
    }

    pub fn denials(&self) -> Vec<DenialRecord> {
        self.denials.read().clone()
    }

    pub fn total_allowed(&self) -> u64 {
        self.total_allowed.load(Ordering::Relaxed)
    }

    pub fn total_denied(&self) -> u64 {
        self.total_denied.load(Ordering::Relaxed)
    }
}
