//! Control-plane wire format.
//!
//! The kernel exchanges fixed-size control packets on the well-known control
//! port. The layout matches `struct qrtr_ctrl_pkt`, all fields little-endian:
//!
//! ```text
//! offset  0: cmd      u32    NEW_SERVER = 2 | DEL_SERVER = 3 | NEW_LOOKUP = 4
//! offset  4: service  u32
//! offset  8: instance u32    low 8 bits = version, high 24 bits = instance
//! offset 12: node     u32
//! offset 16: port     u32
//! ```
//!
//! Packets are decoded field by field from the byte buffer; platform structs
//! are never reinterpreted, so host endianness and ABI never leak into the
//! parse.

pub const QRTR_TYPE_NEW_SERVER: u32 = 2;
pub const QRTR_TYPE_DEL_SERVER: u32 = 3;
pub const QRTR_TYPE_NEW_LOOKUP: u32 = 4;

/// Size of `struct qrtr_ctrl_pkt` on the wire.
pub const CTRL_PACKET_LEN: usize = 20;

/// Payload of a `NEW_SERVER`/`DEL_SERVER` control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerAnnouncement {
    pub service: u32,
    pub version: u8,
    pub instance: u32,
    pub node: u32,
    pub port: u32,
}

impl ServerAnnouncement {
    /// The kernel terminates the initial `NEW_LOOKUP` reply burst with an
    /// all-zero `NEW_SERVER` packet.
    pub fn is_lookup_terminator(&self) -> bool {
        self.service == 0 && self.version == 0 && self.instance == 0 && self.node == 0 && self.port == 0
    }

    fn instance_field(&self) -> u32 {
        (self.instance << 8) | u32::from(self.version)
    }
}

/// One decoded control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlPacket {
    NewServer(ServerAnnouncement),
    DelServer(ServerAnnouncement),
    /// Any command this library does not handle; carried for diagnostics.
    Unknown(u32),
}

/// The buffer held fewer bytes than a full control packet.
#[derive(Debug, thiserror::Error)]
#[error("short control packet: {len} bytes")]
pub struct ShortPacket {
    pub len: usize,
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Decode one control packet from the front of `buf`.
pub fn decode(buf: &[u8]) -> Result<CtrlPacket, ShortPacket> {
    if buf.len() < CTRL_PACKET_LEN {
        return Err(ShortPacket { len: buf.len() });
    }

    let cmd = read_u32_le(buf, 0);
    if cmd != QRTR_TYPE_NEW_SERVER && cmd != QRTR_TYPE_DEL_SERVER {
        return Ok(CtrlPacket::Unknown(cmd));
    }

    let instance_field = read_u32_le(buf, 8);
    let announcement = ServerAnnouncement {
        service: read_u32_le(buf, 4),
        version: (instance_field & 0xff) as u8,
        instance: instance_field >> 8,
        node: read_u32_le(buf, 12),
        port: read_u32_le(buf, 16),
    };

    if cmd == QRTR_TYPE_NEW_SERVER {
        Ok(CtrlPacket::NewServer(announcement))
    } else {
        Ok(CtrlPacket::DelServer(announcement))
    }
}

/// Encode the `NEW_LOOKUP` request that asks the kernel to replay the
/// current bus state. The payload is zeroed by contract.
pub fn encode_new_lookup() -> [u8; CTRL_PACKET_LEN] {
    let mut buf = [0u8; CTRL_PACKET_LEN];
    buf[0..4].copy_from_slice(&QRTR_TYPE_NEW_LOOKUP.to_le_bytes());
    buf
}

/// Encode a `NEW_SERVER` packet. Useful for bus simulators and tests.
pub fn encode_new_server(announcement: &ServerAnnouncement) -> [u8; CTRL_PACKET_LEN] {
    encode_server(QRTR_TYPE_NEW_SERVER, announcement)
}

/// Encode a `DEL_SERVER` packet. Useful for bus simulators and tests.
pub fn encode_del_server(announcement: &ServerAnnouncement) -> [u8; CTRL_PACKET_LEN] {
    encode_server(QRTR_TYPE_DEL_SERVER, announcement)
}

fn encode_server(cmd: u32, announcement: &ServerAnnouncement) -> [u8; CTRL_PACKET_LEN] {
    let mut buf = [0u8; CTRL_PACKET_LEN];
    buf[0..4].copy_from_slice(&cmd.to_le_bytes());
    buf[4..8].copy_from_slice(&announcement.service.to_le_bytes());
    buf[8..12].copy_from_slice(&announcement.instance_field().to_le_bytes());
    buf[12..16].copy_from_slice(&announcement.node.to_le_bytes());
    buf[16..20].copy_from_slice(&announcement.port.to_le_bytes());
    buf
}
