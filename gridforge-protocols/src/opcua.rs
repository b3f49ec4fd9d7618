//! # OPC UA surface (TCP 4840) — transport hello handshake
//!
//! Serves the UACP Hello → Acknowledge exchange that every OPC UA client
//! (and scanner) opens with. Secure-channel and session services are out
//! of scope for the surface.

use crate::listener::{ExchangeAction, SessionListener, WireExchange};
use crate::mirror::{MapMirror, MirrorSizes};
use gridforge_network::NetworkGate;
use std::sync::Arc;
use tracing::debug;

const PROTOCOL_VERSION: u32 = 0;
const RECEIVE_BUFFER: u32 = 65536;
const SEND_BUFFER: u32 = 65536;
const MAX_MESSAGE: u32 = 16 * 1024 * 1024;
const MAX_CHUNKS: u32 = 64;

pub struct OpcUaExchange {
    device: String,
}

fn acknowledge() -> Vec<u8> {
    let mut body = Vec::with_capacity(20);
    for value in [
        PROTOCOL_VERSION,
        RECEIVE_BUFFER,
        SEND_BUFFER,
        MAX_MESSAGE,
        MAX_CHUNKS,
    ] {
        body.extend_from_slice(&value.to_le_bytes());
    }
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(b"ACK");
    out.push(b'F');
    out.extend_from_slice(&((8 + body.len()) as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

fn error_message(code: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(b"ERR");
    out.push(b'F');
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // empty reason string
    out
}

impl WireExchange for OpcUaExchange {
    fn protocol(&self) -> &'static str {
        "opcua"
    }

    fn respond(&self, request: &[u8]) -> ExchangeAction {
        if request.len() < 8 {
            return ExchangeAction::Close;
        }
        match &request[0..4] {
            b"HELF" => {
                debug!(device = %self.device, "OPC UA hello acknowledged");
                ExchangeAction::Reply(acknowledge())
            }
            // Anything further (OPN, MSG) is beyond this surface:
            // Bad_ServiceUnsupported, then the peer hangs up.
            b"OPNF" | b"MSGF" => {
                ExchangeAction::Reply(error_message(0x801D_0000))
            }
            _ => ExchangeAction::Close,
        }
    }
}

pub fn opcua_listener(
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
        Arc::new(OpcUaExchange {
            device: device.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> OpcUaExchange {
        OpcUaExchange {
            device: "historian_primary".into(),
        }
    }

    fn hello() -> Vec<u8> {
        let endpoint = b"opc.tcp://192.168.1.20:4840";
        let body_len = 20 + 4 + endpoint.len();
        let mut out = Vec::new();
        out.extend_from_slice(b"HELF");
        out.extend_from_slice(&((8 + body_len) as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // protocol version
        out.extend_from_slice(&65536u32.to_le_bytes());
        out.extend_from_slice(&65536u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(endpoint.len() as u32).to_le_bytes());
        out.extend_from_slice(endpoint);
        out
    }

    #[test]
    fn test_hello_acknowledged() {
        match exchange().respond(&hello()) {
            ExchangeAction::Reply(reply) => {
                assert_eq!(&reply[0..4], b"ACKF");
                let size = u32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]);
                assert_eq!(size as usize, reply.len());
                let version = u32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]]);
                assert_eq!(version, PROTOCOL_VERSION);
            }
            _ => panic!("expected acknowledge"),
        }
    }

    #[test]
    fn test_secure_channel_open_unsupported() {
        let mut open = b"OPNF".to_vec();
        open.extend_from_slice(&[0u8; 12]);
        match exchange().respond(&open) {
            ExchangeAction::Reply(reply) => assert_eq!(&reply[0..4], b"ERRF"),
            _ => panic!("expected error message"),
        }
    }

    #[test]
    fn test_non_uacp_closes() {
        assert!(matches!(
            exchange().respond(b"GET / HTTP/1.0\r\n\r\n"),
            ExchangeAction::Close
        ));
    }
}
