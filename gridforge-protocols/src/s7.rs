//! # S7 surface (TCP 102) — ISO-on-TCP session registration
//!
//! Serves the two exchanges discovery tooling performs against an S7
//! controller: the COTP connection request → connection confirm, and the
//! S7 communication-setup job → ack with a negotiated PDU size. Deeper
//! S7 semantics are out of scope; a scanner sees a live controller.

use crate::listener::{ExchangeAction, SessionListener, WireExchange};
use crate::mirror::{MapMirror, MirrorSizes};
use gridforge_network::NetworkGate;
use std::sync::Arc;
use tracing::debug;

const TPKT_VERSION: u8 = 0x03;
const COTP_CONNECT_REQUEST: u8 = 0xE0;
const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const COTP_DATA: u8 = 0xF0;
const S7_PROTOCOL_ID: u8 = 0x32;
const NEGOTIATED_PDU_LEN: u16 = 240;

pub struct S7Exchange {
    device: String,
}

impl S7Exchange {
    fn tpkt(payload: Vec<u8>) -> Vec<u8> {
        let total = (payload.len() + 4) as u16;
        let mut out = vec![TPKT_VERSION, 0x00];
        out.extend_from_slice(&total.to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn connect_confirm(request: &[u8]) -> Vec<u8> {
        // Echo the caller's source reference as our destination reference
        let dst_ref = [
            request.get(6).copied().unwrap_or(0),
            request.get(7).copied().unwrap_or(1),
        ];
        let cotp = vec![
            0x11, // length
            COTP_CONNECT_CONFIRM,
            dst_ref[0],
            dst_ref[1],
            0x00,
            0x01, // our source reference
            0x00, // class 0
            // TPDU size parameter: 1024
            0xC0, 0x01, 0x0A,
            // calling/called TSAP parameters echoed as rack/slot defaults
            0xC1, 0x02, 0x01, 0x00,
            0xC2, 0x02, 0x01, 0x02,
        ];
        Self::tpkt(cotp)
    }

    fn setup_ack() -> Vec<u8> {
        let mut s7 = vec![
            S7_PROTOCOL_ID,
            0x03, // ack-data
            0x00, 0x00, // reserved
            0x00, 0x00, // pdu reference
            0x00, 0x08, // parameter length
            0x00, 0x00, // data length
            0x00, 0x00, // error class/code
            0xF0, // setup communication
            0x00,
            0x00, 0x01, // max AMQ calling
            0x00, 0x01, // max AMQ called
        ];
        s7.extend_from_slice(&NEGOTIATED_PDU_LEN.to_be_bytes());
        let mut payload = vec![0x02, COTP_DATA, 0x80];
        payload.extend_from_slice(&s7);
        Self::tpkt(payload)
    }
}

impl WireExchange for S7Exchange {
    fn protocol(&self) -> &'static str {
        "s7"
    }

    fn respond(&self, request: &[u8]) -> ExchangeAction {
        if request.len() < 6 || request[0] != TPKT_VERSION {
            return ExchangeAction::Close;
        }
        match request[5] {
            COTP_CONNECT_REQUEST => {
                debug!(device = %self.device, "COTP connection confirmed");
                ExchangeAction::Reply(Self::connect_confirm(request))
            }
            COTP_DATA if request.get(7) == Some(&S7_PROTOCOL_ID) => {
                debug!(device = %self.device, "S7 communication setup acknowledged");
                ExchangeAction::Reply(Self::setup_ack())
            }
            _ => ExchangeAction::Close,
        }
    }
}

pub fn s7_listener(
    device: &str,
    host: &str,
    port: u16,
    gate: Arc<NetworkGate>,
) -> SessionListener {
    let mirror = Arc::new(MapMirror::new(MirrorSizes::default()));
    SessionListener::new(
        device,
        host,
        port,
        gate,
        mirror,
        Arc::new(S7Exchange {
            device: device.to_string(),
        }),
    )
}
