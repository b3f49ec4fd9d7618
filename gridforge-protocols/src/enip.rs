//! # EtherNet/IP surface (TCP 44818) — encapsulation session handling
//!
//! Serves RegisterSession and ListIdentity, the two encapsulation
//! commands scanners lead with. ListIdentity carries a CIP identity item
//! built from the listener's own identity strings, so every device in the
//! plant fingerprints distinctly.

use crate::listener::{ExchangeAction, SessionListener, WireExchange};
use crate::mirror::{MapMirror, MirrorSizes};
use gridforge_network::NetworkGate;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

const CMD_NOP: u16 = 0x0000;
const CMD_LIST_IDENTITY: u16 = 0x0063;
const CMD_REGISTER_SESSION: u16 = 0x0065;
const CMD_UNREGISTER_SESSION: u16 = 0x0066;

const ENCAP_HEADER_LEN: usize = 24;
const IDENTITY_ITEM_TYPE: u16 = 0x000C;

pub struct EnipExchange {
    device: String,
    vendor_id: u16,
    product_code: u16,
    product_name: String,
    next_session: AtomicU32,
}

struct EncapHeader {
    command: u16,
    session: u32,
    context: [u8; 8],
}

impl EnipExchange {
    fn parse_header(request: &[u8]) -> Option<EncapHeader> {
        if request.len() < ENCAP_HEADER_LEN {
            return None;
        }
        let mut context = [0u8; 8];
        context.copy_from_slice(&request[12..20]);
        Some(EncapHeader {
            command: u16::from_le_bytes([request[0], request[1]]),
            session: u32::from_le_bytes([request[4], request[5], request[6], request[7]]),
            context,
        })
    }

    fn encap(command: u16, session: u32, context: [u8; 8], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCAP_HEADER_LEN + body.len());
        out.extend_from_slice(&command.to_le_bytes());
        out.extend_from_slice(&(body.len() as u16).to_le_bytes());
        out.extend_from_slice(&session.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // status: success
        out.extend_from_slice(&context);
        out.extend_from_slice(&0u32.to_le_bytes()); // options
        out.extend_from_slice(body);
        out
    }

    fn identity_body(&self) -> Vec<u8> {
        let name = self.product_name.as_bytes();
        let name_len = name.len().min(u8::MAX as usize);
        let item_len = 33 + name_len;

        let mut body = Vec::with_capacity(item_len + 4);
        body.extend_from_slice(&1u16.to_le_bytes()); // item count
        body.extend_from_slice(&IDENTITY_ITEM_TYPE.to_le_bytes());
        body.extend_from_slice(&(item_len as u16).to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes()); // encapsulation version
        // Socket address (sin_family, port, addr, zero pad) — reported
        // as-configured, not discovered
        body.extend_from_slice(&0x0002u16.to_be_bytes());
        body.extend_from_slice(&44818u16.to_be_bytes());
        body.extend_from_slice(&[0u8; 4]);
        body.extend_from_slice(&[0u8; 8]);
        body.extend_from_slice(&self.vendor_id.to_le_bytes());
        body.extend_from_slice(&0x000Eu16.to_le_bytes()); // device type: PLC
        body.extend_from_slice(&self.product_code.to_le_bytes());
        body.push(2); // revision major
        body.push(1); // revision minor
        body.extend_from_slice(&0x0030u16.to_le_bytes()); // status
        body.extend_from_slice(&0xC0FF_EE01u32.to_le_bytes()); // serial
        body.push(name_len as u8);
        body.extend_from_slice(&name[..name_len]);
        body.push(0x03); // state: operational
        body
    }
}

impl WireExchange for EnipExchange {
    fn protocol(&self) -> &'static str {
        "enip"
    }

    fn respond(&self, request: &[u8]) -> ExchangeAction {
        let Some(header) = Self::parse_header(request) else {
            return ExchangeAction::Close;
        };
        match header.command {
            CMD_REGISTER_SESSION => {
                let session = self.next_session.fetch_add(1, Ordering::Relaxed);
                debug!(device = %self.device, session, "EtherNet/IP session registered");
                let body = [1u16.to_le_bytes(), 0u16.to_le_bytes()].concat();
                ExchangeAction::Reply(Self::encap(
                    CMD_REGISTER_SESSION,
                    session,
                    header.context,
                    &body,
                ))
            }
            CMD_LIST_IDENTITY => {
                debug!(device = %self.device, "EtherNet/IP identity listed");
                ExchangeAction::Reply(Self::encap(
                    CMD_LIST_IDENTITY,
                    header.session,
                    header.context,
                    &self.identity_body(),
                ))
            }
            CMD_UNREGISTER_SESSION => ExchangeAction::Close,
            CMD_NOP => ExchangeAction::Ignore,
            _ => {
                // Unknown command: encapsulation status 0x01, empty body
                let mut reply = Self::encap(header.command, header.session, header.context, &[]);
                reply[8..12].copy_from_slice(&1u32.to_le_bytes());
                ExchangeAction::Reply(reply)
            }
        }
    }
}

pub fn enip_listener(
    device: &str,
    host: &str,
    port: u16,
    vendor_id: u16,
    product_code: u16,
    product_name: &str,
    gate: Arc<NetworkGate>,
) -> SessionListener {
    let mirror = Arc::new(MapMirror::new(MirrorSizes::default()));
    SessionListener::new(
        device,
        host,
        port,
        gate,
        mirror,
        Arc::new(EnipExchange {
            device: device.to_string(),
            vendor_id,
            product_code,
            product_name: product_name.to_string(),
            next_session: AtomicU32::new(1),
        }),
    )
}
