//! # Topology — networks, memberships, service registry
//!
//! Loaded once at boot from the catalogue and validated against the state
//! fabric: every membership must reference a registered device, else the
//! load fails with `TopologyInvalid`. Memberships can be edited at
//! runtime (scenario tooling moves devices between segments); the service
//! registry records which `(device, protocol, port)` listeners exist.

use crate::cidr::Ipv4Cidr;
use gridforge_core::config::TopologySpec;
use gridforge_core::{CoreError, CoreResult, StateFabric};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct NetworkDef {
    pub name: String,
    pub subnet: Ipv4Cidr,
    pub vlan: u16,
}

#[derive(Debug, Default)]
pub struct Topology {
    networks: HashMap<String, NetworkDef>,
    /// device → networks it is homed on
    memberships: HashMap<String, BTreeSet<String>>,
    /// (device, port) → protocol
    services: HashMap<(String, u16), String>,
    fallback_network: String,
}

impl Topology {
    /// Build and validate a topology. Every membership must name a defined
    /// network and a device registered in the fabric.
    pub fn load(spec: &TopologySpec, fabric: &StateFabric) -> CoreResult<Self> {
        let mut networks = HashMap::new();
        for net in &spec.networks {
            let subnet = Ipv4Cidr::parse(&net.subnet)
                .map_err(|e| CoreError::TopologyInvalid(format!("{}: {e}", net.name)))?;
            networks.insert(
                net.name.clone(),
                NetworkDef {
                    name: net.name.clone(),
                    subnet,
                    vlan: net.vlan,
                },
            );
        }

        let mut memberships: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (network, devices) in &spec.memberships {
            if !networks.contains_key(network) {
                return Err(CoreError::TopologyInvalid(format!(
                    "membership references unknown network '{network}'"
                )));
            }
            for device in devices {
                if !fabric.contains(device) {
                    return Err(CoreError::TopologyInvalid(format!(
                        "network '{network}' references unregistered device '{device}'"
                    )));
                }
                memberships
                    .entry(device.clone())
                    .or_default()
                    .insert(network.clone());
            }
        }

        if !spec.fallback_network.is_empty()
            && !networks.contains_key(&spec.fallback_network)
        {
            warn!(
                network = %spec.fallback_network,
                "Fallback network is not a defined segment"
            );
        }

        info!(
            networks = networks.len(),
            devices = memberships.len(),
            "Topology loaded"
        );
        Ok(Self {
            networks,
            memberships,
            services: HashMap::new(),
            fallback_network: spec.fallback_network.clone(),
        })
    }

    // ── Service registry ────────────────────────────────────────────────

    pub fn expose_service(&mut self, device: &str, protocol: &str, port: u16) {
        if !self.memberships.contains_key(device) {
            warn!(
                device,
                protocol, port, "Exposing service on device with no network membership"
            );
        }
        info!(device, protocol, port, "Service exposed");
        self.services
            .insert((device.to_string(), port), protocol.to_string());
    }

    pub fn service_protocol(&self, device: &str, port: u16) -> Option<&str> {
        self.services
            .get(&(device.to_string(), port))
            .map(String::as_str)
    }

    pub fn services(&self) -> BTreeMap<(String, u16), String> {
        self.services
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // ── Memberships ─────────────────────────────────────────────────────

    pub fn device_networks(&self, device: &str) -> BTreeSet<String> {
        self.memberships.get(device).cloned().unwrap_or_default()
    }

    pub fn network_devices(&self, network: &str) -> BTreeSet<String> {
        self.memberships
            .iter()
            .filter(|(_, nets)| nets.contains(network))
            .map(|(dev, _)| dev.clone())
            .collect()
    }

    pub fn add_membership(&mut self, device: &str, network: &str) -> CoreResult<()> {
        if !self.networks.contains_key(network) {
            return Err(CoreError::TopologyInvalid(format!(
                "unknown network '{network}'"
            )));
        }
        self.memberships
            .entry(device.to_string())
            .or_default()
            .insert(network.to_string());
        Ok(())
    }

    pub fn remove_membership(&mut self, device: &str, network: &str) -> bool {
        self.memberships
            .get_mut(device)
            .map_or(false, |nets| nets.remove(network))
    }

    pub fn is_member(&self, device: &str, network: &str) -> bool {
        self.memberships
            .get(device)
            .map_or(false, |nets| nets.contains(network))
    }

    // ── Peer classification ─────────────────────────────────────────────

    /// Classify a peer address into a source network by longest-prefix
    /// subnet match, falling back to the designated outside network.
    pub fn classify_peer(&self, peer: IpAddr) -> String {
        self.networks
            .values()
            .filter(|net| net.subnet.contains(peer))
            .max_by_key(|net| net.subnet.prefix_len())
            .map(|net| net.name.clone())
            .unwrap_or_else(|| self.fallback_network.clone())
    }

    pub fn network(&self, name: &str) -> Option<&NetworkDef> {
        self.networks.get(name)
    }

    pub fn network_count(&self) -> usize {
        self.networks.len()
    }
}
