//! # DNP3 surface (TCP 20000) — link-layer session registration
//!
//! Answers the two link-layer frames probes send first: reset link states
//! (ACK back) and request link status (link status back). Frames carry
//! the standard DNP3 CRC over the header block, so conformant tooling
//! accepts the replies.

use crate::listener::{ExchangeAction, SessionListener, WireExchange};
use crate::mirror::{MapMirror, MirrorSizes};
use gridforge_network::NetworkGate;
use std::sync::Arc;
use tracing::debug;

const START_1: u8 = 0x05;
const START_2: u8 = 0x64;

const FUNC_RESET_LINK: u8 = 0x00;
const FUNC_REQUEST_LINK_STATUS: u8 = 0x09;
const FUNC_ACK: u8 = 0x00;
const FUNC_LINK_STATUS: u8 = 0x0B;

/// DNP3 CRC-16 (polynomial 0x3D65 reflected, complemented result).
fn dnp3_crc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA6BC;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

pub struct Dnp3Exchange {
    device: String,
    /// Outstation link address.
    address: u16,
}

impl Dnp3Exchange {
    fn frame(&self, function: u8, destination: u16) -> Vec<u8> {
        // Secondary-to-primary frame: DIR=0, PRM=0
        let control = function & 0x0F;
        let mut header = vec![START_1, START_2, 0x05, control];
        header.extend_from_slice(&destination.to_le_bytes());
        header.extend_from_slice(&self.address.to_le_bytes());
        let crc = dnp3_crc(&header);
        header.extend_from_slice(&crc.to_le_bytes());
        header
    }
}

impl WireExchange for Dnp3Exchange {
    fn protocol(&self) -> &'static str {
        "dnp3"
    }

    fn respond(&self, request: &[u8]) -> ExchangeAction {
        if request.len() < 10 || request[0] != START_1 || request[1] != START_2 {
            return ExchangeAction::Close;
        }
        let header_crc = u16::from_le_bytes([request[8], request[9]]);
        if dnp3_crc(&request[0..8]) != header_crc {
            debug!(device = %self.device, "DNP3 header CRC mismatch");
            return ExchangeAction::Close;
        }
        let control = request[3];
        let source = u16::from_le_bytes([request[6], request[7]]);
        match control & 0x0F {
            FUNC_REQUEST_LINK_STATUS => {
                debug!(device = %self.device, source, "Link status requested");
                ExchangeAction::Reply(self.frame(FUNC_LINK_STATUS, source))
            }
            FUNC_RESET_LINK => {
                debug!(device = %self.device, source, "Link reset acknowledged");
                ExchangeAction::Reply(self.frame(FUNC_ACK, source))
            }
            _ => ExchangeAction::Ignore,
        }
    }
}

pub fn dnp3_listener(
    device: &str,
    host: &str,
    port: u16,
    address: u16,
    gate: Arc<NetworkGate>,
) -> SessionListener {
    let mirror = Arc::new(MapMirror::new(MirrorSizes::default()));
    SessionListener::new(
        device,
        host,
        port,
        gate,
        mirror,
        Arc::new(Dnp3Exchange {
            device: device.to_string(),
            address,
        }),
    )
}
