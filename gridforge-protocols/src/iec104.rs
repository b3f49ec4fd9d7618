//! # IEC 60870-5-104 surface (TCP 2404) — control-frame session handling
//!
//! Serves the U-format control exchanges a master opens a session with:
//! STARTDT, STOPDT, and TESTFR activations each earn their confirmation.
//! I/S-format traffic is out of scope for the surface and is ignored.

use crate::listener::{ExchangeAction, SessionListener, WireExchange};
use crate::mirror::{MapMirror, MirrorSizes};
use gridforge_network::NetworkGate;
use std::sync::Arc;
use tracing::debug;

const START_BYTE: u8 = 0x68;

const STARTDT_ACT: u8 = 0x07;
const STARTDT_CON: u8 = 0x0B;
const STOPDT_ACT: u8 = 0x13;
const STOPDT_CON: u8 = 0x23;
const TESTFR_ACT: u8 = 0x43;
const TESTFR_CON: u8 = 0x83;

pub struct Iec104Exchange {
    device: String,
}

fn u_frame(control: u8) -> Vec<u8> {
    vec![START_BYTE, 0x04, control, 0x00, 0x00, 0x00]
}

impl WireExchange for Iec104Exchange {
    fn protocol(&self) -> &'static str {
        "iec104"
    }

    fn respond(&self, request: &[u8]) -> ExchangeAction {
        if request.len() < 6 || request[0] != START_BYTE {
            return ExchangeAction::Close;
        }
        // U-format frames have bits 0..1 of the first control octet set
        let control = request[2];
        if control & 0x03 != 0x03 {
            return ExchangeAction::Ignore;
        }
        let confirm = match control {
            STARTDT_ACT => STARTDT_CON,
            STOPDT_ACT => STOPDT_CON,
            TESTFR_ACT => TESTFR_CON,
            _ => return ExchangeAction::Ignore,
        };
        debug!(device = %self.device, control, confirm, "U-frame confirmed");
        ExchangeAction::Reply(u_frame(confirm))
    }
}

pub fn iec104_listener(
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
        Arc::new(Iec104Exchange {
            device: device.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> Iec104Exchange {
        Iec104Exchange {
            device: "substation_rtu_1".into(),
        }
    }

    #[test]
    fn test_startdt_confirmed() {
        match exchange().respond(&u_frame(STARTDT_ACT)) {
            ExchangeAction::Reply(reply) => {
                assert_eq!(reply, vec![0x68, 0x04, STARTDT_CON, 0x00, 0x00, 0x00]);
            }
            _ => panic!("expected STARTDT con"),
        }
    }

    #[test]
    fn test_testfr_confirmed() {
        match exchange().respond(&u_frame(TESTFR_ACT)) {
            ExchangeAction::Reply(reply) => {
                assert_eq!(reply[2], TESTFR_CON);
            }
            _ => panic!("expected TESTFR con"),
        }
    }

    #[test]
    fn test_stopdt_confirmed() {
        match exchange().respond(&u_frame(STOPDT_ACT)) {
            ExchangeAction::Reply(reply) => {
                assert_eq!(reply[2], STOPDT_CON);
            }
            _ => panic!("expected STOPDT con"),
        }
    }

    #[test]
    fn test_i_frames_ignored_and_garbage_closes() {
        // I-format frame (control bit 0 clear)
        let i_frame = [0x68, 0x04, 0x02, 0x00, 0x02, 0x00];
        assert!(matches!(exchange().respond(&i_frame), ExchangeAction::Ignore));
        assert!(matches!(exchange().respond(b"nope"), ExchangeAction::Close));
    }
}
