//! # Modbus TCP — bit-exact application protocol server
//!
//! MBAP framing plus the PDU function codes real tooling exercises:
//! 1/2/3/4 reads, 5/6 single writes, 15/16 multiple writes, and 43/14
//! device identification (the reconnaissance surface — each listener
//! carries its own identity). Exceptions follow the application protocol:
//! high bit set on the function code, one exception byte.
//!
//! Unit-id handling is strict: a mismatched unit id earns exception 0x0B
//! (gateway target device failed to respond) rather than an answer from
//! the wrong device.

use crate::listener::{ListenerCore, ProtocolServer, SessionCtx, SessionFuture, SessionHandler};
use crate::mirror::{MapMirror, MirrorSizes};
use async_trait::async_trait;
use gridforge_core::{AddressSpace, CoreResult, MemKey, MemValue};
use gridforge_network::NetworkGate;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

// Function codes
pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FC_ENCAPSULATED_INTERFACE: u8 = 0x2B;
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

// Exception codes
pub const EXC_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXC_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXC_ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const EXC_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// Quantity limits per the application protocol
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// MBAP header: 7 bytes, big-endian words.
pub const MBAP_LEN: usize = 7;
/// Largest legal ADU length field (1 unit byte + 253 PDU bytes + margin).
const MAX_FRAME_LEN: u16 = 260;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8; MBAP_LEN]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        }
    }

    pub fn encode(&self) -> [u8; MBAP_LEN] {
        let mut out = [0u8; MBAP_LEN];
        out[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        out[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6] = self.unit_id;
        out
    }
}

/// Identity served through FC 43 / MEI 14. One per listener — two devices
/// in one process must never collapse to a single identity record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeviceIdentity {
    pub vendor_name: String,
    pub product_code: String,
    pub revision: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            vendor_name: "Gridforge Controls".into(),
            product_code: "GF-PLC-4000".into(),
            revision: "2.1".into(),
        }
    }
}

pub fn exception(function: u8, code: u8) -> Vec<u8> {
    vec![function | 0x80, code]
}

fn be_u16(pdu: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *pdu.get(offset)?,
        *pdu.get(offset + 1)?,
    ]))
}

/// Pack bits LSB-first into bytes, as the read-bit responses require.
fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

fn read_bits_response(
    mirror: &MapMirror,
    space: AddressSpace,
    function: u8,
    pdu: &[u8],
) -> Vec<u8> {
    let (Some(addr), Some(count)) = (be_u16(pdu, 1), be_u16(pdu, 3)) else {
        return exception(function, EXC_ILLEGAL_DATA_VALUE);
    };
    if count == 0 || count > MAX_READ_BITS {
        return exception(function, EXC_ILLEGAL_DATA_VALUE);
    }
    if !mirror.range_mapped(space, addr, count) {
        return exception(function, EXC_ILLEGAL_DATA_ADDRESS);
    }
    let bits = mirror.read_bits(space, addr, count);
    let packed = pack_bits(&bits);
    let mut out = Vec::with_capacity(2 + packed.len());
    out.push(function);
    out.push(packed.len() as u8);
    out.extend_from_slice(&packed);
    out
}

fn read_words_response(
    mirror: &MapMirror,
    space: AddressSpace,
    function: u8,
    pdu: &[u8],
) -> Vec<u8> {
    let (Some(addr), Some(count)) = (be_u16(pdu, 1), be_u16(pdu, 3)) else {
        return exception(function, EXC_ILLEGAL_DATA_VALUE);
    };
    if count == 0 || count > MAX_READ_REGISTERS {
        return exception(function, EXC_ILLEGAL_DATA_VALUE);
    }
    if !mirror.range_mapped(space, addr, count) {
        return exception(function, EXC_ILLEGAL_DATA_ADDRESS);
    }
    let words = mirror.read_words(space, addr, count);
    let mut out = Vec::with_capacity(2 + words.len() * 2);
    out.push(function);
    out.push((words.len() * 2) as u8);
    for word in words {
        out.extend_from_slice(&word.to_be_bytes());
    }
    out
}

fn write_single_coil(mirror: &MapMirror, pdu: &[u8]) -> Vec<u8> {
    let (Some(addr), Some(value)) = (be_u16(pdu, 1), be_u16(pdu, 3)) else {
        return exception(FC_WRITE_SINGLE_COIL, EXC_ILLEGAL_DATA_VALUE);
    };
    let bit = match value {
        0xFF00 => true,
        0x0000 => false,
        _ => return exception(FC_WRITE_SINGLE_COIL, EXC_ILLEGAL_DATA_VALUE),
    };
    if !mirror.range_mapped(AddressSpace::Coils, addr, 1) {
        return exception(FC_WRITE_SINGLE_COIL, EXC_ILLEGAL_DATA_ADDRESS);
    }
    mirror.write_batch(&[(MemKey::coil(addr), MemValue::Bit(bit))]);
    // Response echoes the request
    pdu[..5].to_vec()
}

fn write_single_register(mirror: &MapMirror, pdu: &[u8]) -> Vec<u8> {
    let (Some(addr), Some(value)) = (be_u16(pdu, 1), be_u16(pdu, 3)) else {
        return exception(FC_WRITE_SINGLE_REGISTER, EXC_ILLEGAL_DATA_VALUE);
    };
    if !mirror.range_mapped(AddressSpace::HoldingRegisters, addr, 1) {
        return exception(FC_WRITE_SINGLE_REGISTER, EXC_ILLEGAL_DATA_ADDRESS);
    }
    mirror.write_batch(&[(MemKey::holding(addr), MemValue::Word(value))]);
    pdu[..5].to_vec()
}

fn write_multiple_coils(mirror: &MapMirror, pdu: &[u8]) -> Vec<u8> {
    let (Some(addr), Some(count)) = (be_u16(pdu, 1), be_u16(pdu, 3)) else {
        return exception(FC_WRITE_MULTIPLE_COILS, EXC_ILLEGAL_DATA_VALUE);
    };
    let Some(&byte_count) = pdu.get(5) else {
        return exception(FC_WRITE_MULTIPLE_COILS, EXC_ILLEGAL_DATA_VALUE);
    };
    if count == 0
        || count > MAX_WRITE_BITS
        || byte_count as usize != (count as usize + 7) / 8
        || pdu.len() < 6 + byte_count as usize
    {
        return exception(FC_WRITE_MULTIPLE_COILS, EXC_ILLEGAL_DATA_VALUE);
    }
    if !mirror.range_mapped(AddressSpace::Coils, addr, count) {
        return exception(FC_WRITE_MULTIPLE_COILS, EXC_ILLEGAL_DATA_ADDRESS);
    }
    let data = &pdu[6..6 + byte_count as usize];
    let writes: Vec<(MemKey, MemValue)> = (0..count)
        .map(|i| {
            let bit = data[(i / 8) as usize] & (1 << (i % 8)) != 0;
            (MemKey::coil(addr + i), MemValue::Bit(bit))
        })
        .collect();
    mirror.write_batch(&writes);
    let mut out = Vec::with_capacity(5);
    out.push(FC_WRITE_MULTIPLE_COILS);
    out.extend_from_slice(&addr.to_be_bytes());
    out.extend_from_slice(&count.to_be_bytes());
    out
}

fn write_multiple_registers(mirror: &MapMirror, pdu: &[u8]) -> Vec<u8> {
    let (Some(addr), Some(count)) = (be_u16(pdu, 1), be_u16(pdu, 3)) else {
        return exception(FC_WRITE_MULTIPLE_REGISTERS, EXC_ILLEGAL_DATA_VALUE);
    };
    let Some(&byte_count) = pdu.get(5) else {
        return exception(FC_WRITE_MULTIPLE_REGISTERS, EXC_ILLEGAL_DATA_VALUE);
    };
    if count == 0
        || count > MAX_WRITE_REGISTERS
        || byte_count as usize != count as usize * 2
        || pdu.len() < 6 + byte_count as usize
    {
        return exception(FC_WRITE_MULTIPLE_REGISTERS, EXC_ILLEGAL_DATA_VALUE);
    }
    if !mirror.range_mapped(AddressSpace::HoldingRegisters, addr, count) {
        return exception(FC_WRITE_MULTIPLE_REGISTERS, EXC_ILLEGAL_DATA_ADDRESS);
    }
    let data = &pdu[6..6 + byte_count as usize];
    let writes: Vec<(MemKey, MemValue)> = (0..count)
        .map(|i| {
            let off = i as usize * 2;
            let word = u16::from_be_bytes([data[off], data[off + 1]]);
            (MemKey::holding(addr + i), MemValue::Word(word))
        })
        .collect();
    mirror.write_batch(&writes);
    let mut out = Vec::with_capacity(5);
    out.push(FC_WRITE_MULTIPLE_REGISTERS);
    out.extend_from_slice(&addr.to_be_bytes());
    out.extend_from_slice(&count.to_be_bytes());
    out
}

fn read_device_identification(identity: &DeviceIdentity, pdu: &[u8]) -> Vec<u8> {
    let Some(&mei_type) = pdu.get(1) else {
        return exception(FC_ENCAPSULATED_INTERFACE, EXC_ILLEGAL_DATA_VALUE);
    };
    if mei_type != MEI_READ_DEVICE_ID {
        return exception(FC_ENCAPSULATED_INTERFACE, EXC_ILLEGAL_FUNCTION);
    }
    let read_code = pdu.get(2).copied().unwrap_or(0x01);
    if !(0x01..=0x04).contains(&read_code) {
        return exception(FC_ENCAPSULATED_INTERFACE, EXC_ILLEGAL_DATA_VALUE);
    }

    let objects: [(u8, &str); 3] = [
        (0x00, &identity.vendor_name),
        (0x01, &identity.product_code),
        (0x02, &identity.revision),
    ];
    let mut out = Vec::with_capacity(16);
    out.push(FC_ENCAPSULATED_INTERFACE);
    out.push(MEI_READ_DEVICE_ID);
    out.push(read_code);
    out.push(0x01); // conformity: basic identification
    out.push(0x00); // more follows: no
    out.push(0x00); // next object id
    out.push(objects.len() as u8);
    for (id, text) in objects {
        let bytes = text.as_bytes();
        let len = bytes.len().min(u8::MAX as usize);
        out.push(id);
        out.push(len as u8);
        out.extend_from_slice(&bytes[..len]);
    }
    out
}

/// Process one request PDU against the mirror. Always yields a response
/// PDU — malformed or unsupported requests yield exceptions.
pub fn process_pdu(mirror: &MapMirror, identity: &DeviceIdentity, pdu: &[u8]) -> Vec<u8> {
    let Some(&function) = pdu.first() else {
        return exception(0, EXC_ILLEGAL_DATA_VALUE);
    };
    match function {
        FC_READ_COILS => read_bits_response(mirror, AddressSpace::Coils, function, pdu),
        FC_READ_DISCRETE_INPUTS => {
            read_bits_response(mirror, AddressSpace::DiscreteInputs, function, pdu)
        }
        FC_READ_HOLDING_REGISTERS => {
            read_words_response(mirror, AddressSpace::HoldingRegisters, function, pdu)
        }
        FC_READ_INPUT_REGISTERS => {
            read_words_response(mirror, AddressSpace::InputRegisters, function, pdu)
        }
        FC_WRITE_SINGLE_COIL => write_single_coil(mirror, pdu),
        FC_WRITE_SINGLE_REGISTER => write_single_register(mirror, pdu),
        FC_WRITE_MULTIPLE_COILS => write_multiple_coils(mirror, pdu),
        FC_WRITE_MULTIPLE_REGISTERS => write_multiple_registers(mirror, pdu),
        FC_ENCAPSULATED_INTERFACE => read_device_identification(identity, pdu),
        _ => exception(function, EXC_ILLEGAL_FUNCTION),
    }
}

// ── Listener ────────────────────────────────────────────────────────────────

struct ModbusHandler {
    unit_id: u8,
    identity: Arc<DeviceIdentity>,
}

impl SessionHandler for ModbusHandler {
    fn run(&self, mut stream: TcpStream, ctx: SessionCtx) -> SessionFuture {
        let unit_id = self.unit_id;
        let identity = Arc::clone(&self.identity);
        Box::pin(async move {
            let mut header_buf = [0u8; MBAP_LEN];
            let mut pdu_buf = vec![0u8; MAX_FRAME_LEN as usize];
            loop {
                // Requests are processed strictly in arrival order; one
                // in-flight request per session.
                match tokio::time::timeout(ctx.idle_timeout, stream.read_exact(&mut header_buf))
                    .await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) | Err(_) => break,
                }
                let header = MbapHeader::parse(&header_buf);
                if header.protocol_id != 0x0000
                    || header.length < 2
                    || header.length > MAX_FRAME_LEN
                {
                    warn!(
                        device = %ctx.device,
                        protocol_id = header.protocol_id,
                        length = header.length,
                        "Malformed MBAP header, closing session"
                    );
                    break;
                }
                let pdu_len = header.length as usize - 1;
                if stream.read_exact(&mut pdu_buf[..pdu_len]).await.is_err() {
                    break;
                }
                ctx.connections.record_request(ctx.session_id);
                let pdu = &pdu_buf[..pdu_len];

                let response = if header.unit_id != unit_id {
                    debug!(
                        device = %ctx.device,
                        got = header.unit_id,
                        expected = unit_id,
                        "Unit id mismatch"
                    );
                    exception(pdu[0], EXC_GATEWAY_TARGET_FAILED)
                } else {
                    process_pdu(&ctx.mirror, &identity, pdu)
                };
                trace!(
                    device = %ctx.device,
                    txn = header.transaction_id,
                    function = pdu[0],
                    response_len = response.len(),
                    "Request served"
                );

                let reply_header = MbapHeader {
                    transaction_id: header.transaction_id,
                    protocol_id: 0x0000,
                    length: (response.len() + 1) as u16,
                    unit_id: header.unit_id,
                };
                let mut frame = Vec::with_capacity(MBAP_LEN + response.len());
                frame.extend_from_slice(&reply_header.encode());
                frame.extend_from_slice(&response);
                if stream.write_all(&frame).await.is_err() {
                    break;
                }
            }
        })
    }
}

pub struct ModbusTcpListener {
    core: ListenerCore,
    unit_id: u8,
    identity: Arc<DeviceIdentity>,
}

impl ModbusTcpListener {
    pub fn new(
        device: &str,
        host: &str,
        port: u16,
        unit_id: u8,
        sizes: MirrorSizes,
        identity: DeviceIdentity,
        gate: Arc<NetworkGate>,
    ) -> Self {
        let mirror = Arc::new(MapMirror::new(sizes));
        let core = ListenerCore::new(device, "modbus", host, port, gate, mirror);
        Self {
            core,
            unit_id,
            identity: Arc::new(identity),
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn active_sessions(&self) -> usize {
        self.core.active_sessions()
    }
}

#[async_trait]
impl ProtocolServer for ModbusTcpListener {
    fn device_name(&self) -> &str {
        &self.core.device
    }

    fn protocol(&self) -> &'static str {
        "modbus"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    fn mirror(&self) -> &Arc<MapMirror> {
        &self.core.mirror
    }

    async fn start(&self) -> CoreResult<()> {
        self.core
            .start(Arc::new(ModbusHandler {
                unit_id: self.unit_id,
                identity: Arc::clone(&self.identity),
            }))
            .await
    }

    async fn stop(&self) {
        self.core.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror() -> MapMirror {
        MapMirror::new(MirrorSizes::default())
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::default()
    }

    fn req(bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }

    #[test]
    fn test_read_holding_registers() {
        let m = mirror();
        m.write_batch(&[
            (MemKey::holding(0), MemValue::Word(0x0E10)), // 3600
            (MemKey::holding(1), MemValue::Word(0x0002)),
        ]);
        let pdu = req(&[FC_READ_HOLDING_REGISTERS, 0x00, 0x00, 0x00, 0x02]);
        let resp = process_pdu(&m, &identity(), &pdu);
        assert_eq!(resp, vec![0x03, 0x04, 0x0E, 0x10, 0x00, 0x02]);
    }

    #[test]
    fn test_read_unmapped_address_is_exception_02() {
        let m = MapMirror::new(MirrorSizes::uniform(16));
        // Address 9999 on a device that only maps 0..16
        let pdu = req(&[FC_READ_HOLDING_REGISTERS, 0x27, 0x0F, 0x00, 0x01]);
        let resp = process_pdu(&m, &identity(), &pdu);
        assert_eq!(resp, vec![0x83, EXC_ILLEGAL_DATA_ADDRESS]);
    }

    #[test]
    fn test_read_straddling_map_edge_is_exception_02() {
        let m = MapMirror::new(MirrorSizes::uniform(16));
        // 15..17 straddles the end of the 16-wide window
        let pdu = req(&[FC_READ_INPUT_REGISTERS, 0x00, 0x0F, 0x00, 0x02]);
        let resp = process_pdu(&m, &identity(), &pdu);
        assert_eq!(resp, vec![0x84, EXC_ILLEGAL_DATA_ADDRESS]);
    }

    #[test]
    fn test_read_count_limits() {
        let m = mirror();
        // 126 registers breaches the 125 limit → illegal data value
        let pdu = req(&[FC_READ_HOLDING_REGISTERS, 0x00, 0x00, 0x00, 0x7E]);
        assert_eq!(
            process_pdu(&m, &identity(), &pdu),
            vec![0x83, EXC_ILLEGAL_DATA_VALUE]
        );
        // Zero count is also illegal
        let pdu = req(&[FC_READ_COILS, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            process_pdu(&m, &identity(), &pdu),
            vec![0x81, EXC_ILLEGAL_DATA_VALUE]
        );
    }

    #[test]
    fn test_coil_bit_packing_lsb_first() {
        let m = mirror();
        m.write_batch(&[
            (MemKey::coil(0), MemValue::Bit(true)),
            (MemKey::coil(2), MemValue::Bit(true)),
            (MemKey::coil(8), MemValue::Bit(true)),
        ]);
        let pdu = req(&[FC_READ_COILS, 0x00, 0x00, 0x00, 0x0A]);
        let resp = process_pdu(&m, &identity(), &pdu);
        // 10 coils → 2 bytes; bit 0 and 2 in the first, bit 8 → lsb of second
        assert_eq!(resp, vec![0x01, 0x02, 0b0000_0101, 0b0000_0001]);
    }

    #[test]
    fn test_write_single_register_echo_and_buffer() {
        let m = mirror();
        let pdu = req(&[FC_WRITE_SINGLE_REGISTER, 0x00, 0x0A, 0x11, 0x94]); // 4500 → reg 10
        let resp = process_pdu(&m, &identity(), &pdu);
        assert_eq!(resp, pdu);
        assert_eq!(
            m.read_words(AddressSpace::HoldingRegisters, 10, 1),
            vec![4500]
        );
        assert_eq!(m.drain_writes(), vec![(MemKey::holding(10), MemValue::Word(4500))]);
    }

    #[test]
    fn test_write_single_coil_value_validation() {
        let m = mirror();
        let on = req(&[FC_WRITE_SINGLE_COIL, 0x00, 0x0B, 0xFF, 0x00]);
        assert_eq!(process_pdu(&m, &identity(), &on), on);
        assert_eq!(m.read_bits(AddressSpace::Coils, 11, 1), vec![true]);

        let off = req(&[FC_WRITE_SINGLE_COIL, 0x00, 0x0B, 0x00, 0x00]);
        assert_eq!(process_pdu(&m, &identity(), &off), off);
        assert_eq!(m.read_bits(AddressSpace::Coils, 11, 1), vec![false]);

        let junk = req(&[FC_WRITE_SINGLE_COIL, 0x00, 0x0B, 0x12, 0x34]);
        assert_eq!(
            process_pdu(&m, &identity(), &junk),
            vec![0x85, EXC_ILLEGAL_DATA_VALUE]
        );
    }

    #[test]
    fn test_write_to_read_only_spaces_is_function_illegal() {
        // There is no function code that writes discrete inputs or input
        // registers; the nearest misuse is an undefined function code.
        let m = mirror();
        let pdu = req(&[0x45, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(
            process_pdu(&m, &identity(), &pdu),
            vec![0xC5, EXC_ILLEGAL_FUNCTION]
        );
    }

    #[test]
    fn test_write_multiple_registers() {
        let m = mirror();
        let pdu = req(&[
            FC_WRITE_MULTIPLE_REGISTERS,
            0x00, 0x05, // addr 5
            0x00, 0x02, // count 2
            0x04, // byte count
            0x00, 0x64, // 100
            0x01, 0xF4, // 500
        ]);
        let resp = process_pdu(&m, &identity(), &pdu);
        assert_eq!(resp, vec![0x10, 0x00, 0x05, 0x00, 0x02]);
        assert_eq!(
            m.read_words(AddressSpace::HoldingRegisters, 5, 2),
            vec![100, 500]
        );

        // Byte count disagreeing with quantity is illegal
        let bad = req(&[FC_WRITE_MULTIPLE_REGISTERS, 0x00, 0x05, 0x00, 0x02, 0x03, 0, 0, 0]);
        assert_eq!(
            process_pdu(&m, &identity(), &bad),
            vec![0x90, EXC_ILLEGAL_DATA_VALUE]
        );
    }

    #[test]
    fn test_write_multiple_coils() {
        let m = mirror();
        let pdu = req(&[
            FC_WRITE_MULTIPLE_COILS,
            0x00, 0x00, // addr 0
            0x00, 0x0A, // 10 coils
            0x02, // byte count
            0b0000_0101,
            0b0000_0001,
        ]);
        let resp = process_pdu(&m, &identity(), &pdu);
        assert_eq!(resp, vec![0x0F, 0x00, 0x00, 0x00, 0x0A]);
        let bits = m.read_bits(AddressSpace::Coils, 0, 10);
        assert!(bits[0] && bits[2] && bits[8]);
        assert!(!bits[1] && !bits[9]);
    }

    #[test]
    fn test_device_identification() {
        let m = mirror();
        let ident = DeviceIdentity {
            vendor_name: "UU Power & Light".into(),
            product_code: "HEX-TRB-1".into(),
            revision: "3.1".into(),
        };
        let pdu = req(&[FC_ENCAPSULATED_INTERFACE, MEI_READ_DEVICE_ID, 0x01, 0x00]);
        let resp = process_pdu(&m, &ident, &pdu);
        assert_eq!(&resp[..7], &[0x2B, 0x0E, 0x01, 0x01, 0x00, 0x00, 0x03]);
        // First object: id 0, vendor name
        assert_eq!(resp[7], 0x00);
        assert_eq!(resp[8] as usize, ident.vendor_name.len());
        assert_eq!(&resp[9..9 + ident.vendor_name.len()], ident.vendor_name.as_bytes());
        // Unknown MEI type is an illegal function
        let bad = req(&[FC_ENCAPSULATED_INTERFACE, 0x0D, 0x01]);
        assert_eq!(
            process_pdu(&m, &ident, &bad),
            vec![0xAB, EXC_ILLEGAL_FUNCTION]
        );
    }

    #[test]
    fn test_truncated_pdu_is_illegal_data_value() {
        let m = mirror();
        let pdu = req(&[FC_READ_HOLDING_REGISTERS, 0x00]);
        assert_eq!(
            process_pdu(&m, &identity(), &pdu),
            vec![0x83, EXC_ILLEGAL_DATA_VALUE]
        );
    }

    #[test]
    fn test_mbap_roundtrip() {
        let header = MbapHeader {
            transaction_id: 0xBEEF,
            protocol_id: 0,
            length: 6,
            unit_id: 17,
        };
        let encoded = header.encode();
        assert_eq!(MbapHeader::parse(&encoded), header);
        assert_eq!(encoded[0..2], [0xBE, 0xEF]);
        assert_eq!(encoded[6], 17);
    }
}
