//! Tor cell framing
//!
//! Cells are the basic unit of communication on a link. Two wire versions
//! exist: v3 frames carry 2-byte circuit IDs (512-byte fixed cells), v4
//! frames carry 4-byte circuit IDs (514-byte fixed cells). Rather than
//! dispatching on the version for every field access, [`Cell`] is a tagged
//! variant decided once when the cell crosses the codec boundary.

use super::cellbuf::CellBuf;

/// Negotiated link protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LinkVersion(u16);

/// Lowest link version this relay speaks.
pub const OUR_MIN_VERSION: u16 = 4;
/// Highest link version this relay speaks.
pub const OUR_MAX_VERSION: u16 = 4;

impl LinkVersion {
    pub const V3: LinkVersion = LinkVersion(3);
    pub const V4: LinkVersion = LinkVersion(4);

    pub fn new(v: u16) -> LinkVersion {
        LinkVersion(v)
    }

    pub fn get(self) -> u16 {
        self.0
    }

    /// Width of the circuit-ID field on the wire.
    pub fn circ_id_len(self) -> usize {
        if self.0 < 4 {
            2
        } else {
            4
        }
    }

    /// Total size of a fixed-length cell: circuit ID, command byte, and a
    /// 509-byte payload.
    pub fn fixed_cell_len(self) -> usize {
        self.circ_id_len() + 1 + PAYLOAD_LEN
    }

    /// Bytes preceding the payload of a fixed-length cell.
    pub fn header_len(self) -> usize {
        self.circ_id_len() + 1
    }
}

/// Payload size of a fixed-length cell.
pub const PAYLOAD_LEN: usize = 509;

/// Maximum data bytes in one relay cell body.
pub const MAX_RELAY_LEN: usize = PAYLOAD_LEN - RELAY_HEADER_LEN;

/// Relay body header: command, recognized, stream ID, digest, length.
pub const RELAY_HEADER_LEN: usize = 11;

/// Circuit identifier.
///
/// Held internally as 32 bits with the initiator bit at 0x8000_0000 for
/// every link version; on a v3 link only the upper 16 bits exist on the
/// wire, so the lower 16 are always zero there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId(u32);

impl CircuitId {
    pub const ZERO: CircuitId = CircuitId(0);

    pub fn new(v: u32) -> CircuitId {
        CircuitId(v)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Whether the initiator bit is set, i.e. the side that allocated this
    /// ID originated the circuit on its link.
    pub fn initiator_bit(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Decode from wire bytes of the given width.
    fn from_wire(version: LinkVersion, bytes: &[u8]) -> CircuitId {
        if version < LinkVersion::V4 {
            CircuitId((u16::from_be_bytes([bytes[0], bytes[1]]) as u32) << 16)
        } else {
            CircuitId(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
    }

    /// Encode into wire bytes of the given width.
    fn write_wire(self, version: LinkVersion, out: &mut [u8]) {
        if version < LinkVersion::V4 {
            out[..2].copy_from_slice(&((self.0 >> 16) as u16).to_be_bytes());
        } else {
            out[..4].copy_from_slice(&self.0.to_be_bytes());
        }
    }
}

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Link-level cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    Versions = 7,
    Netinfo = 8,
    RelayEarly = 9,
    Create2 = 10,
    Created2 = 11,
    Vpadding = 128,
    Certs = 129,
    AuthChallenge = 130,
    Authenticate = 131,
    Authorize = 132,
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }
}

/// Whether a command byte marks a variable-length cell: VERSIONS, or any
/// command with the high bit set.
pub fn is_variable_command(cmd: u8) -> bool {
    cmd == CellCommand::Versions as u8 || cmd & 0x80 != 0
}

/// Relay command types (first byte of a decrypted relay body)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Extend = 6,
    Extended = 7,
    Truncate = 8,
    Truncated = 9,
    Drop = 10,
    Resolve = 11,
    Resolved = 12,
    BeginDir = 13,
    Extend2 = 14,
    Extended2 = 15,
}

impl RelayCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// A framed cell, fixed or variable length, in wire form.
pub enum Cell {
    V3(CellBuf),
    V4(CellBuf),
}

impl Cell {
    /// Build a fixed-length cell, zero-padding the payload.
    ///
    /// Panics if `data` exceeds the 509-byte payload; callers never frame
    /// oversized payloads.
    pub fn new(version: LinkVersion, id: CircuitId, cmd: CellCommand, data: &[u8]) -> Cell {
        assert!(data.len() <= PAYLOAD_LEN, "fixed cell payload too large");
        let header = version.header_len();
        let mut buf = CellBuf::get(false);
        id.write_wire(version, &mut buf);
        buf[header - 1] = cmd as u8;
        buf[header..header + data.len()].copy_from_slice(data);
        // Wipe whatever the recycled buffer held after the payload.
        buf[header + data.len()..version.fixed_cell_len()].fill(0);
        buf.truncate(version.fixed_cell_len());
        Cell::wrap(version, buf)
    }

    /// Build a variable-length cell carrying `data`.
    pub fn new_var(version: LinkVersion, id: CircuitId, cmd: CellCommand, data: &[u8]) -> Cell {
        let mut cell = Cell::new_var_zeroed(version, id, cmd, data.len());
        cell.payload_mut().copy_from_slice(data);
        cell
    }

    /// Build a variable-length cell with a zeroed payload of `len` bytes,
    /// to be filled in place.
    pub fn new_var_zeroed(
        version: LinkVersion,
        id: CircuitId,
        cmd: CellCommand,
        len: usize,
    ) -> Cell {
        let header = version.header_len();
        let mut buf = CellBuf::with_len(header + 2 + len);
        id.write_wire(version, &mut buf);
        buf[header - 1] = cmd as u8;
        buf[header..header + 2].copy_from_slice(&(len as u16).to_be_bytes());
        Cell::wrap(version, buf)
    }

    /// Wrap an already-framed buffer read off the wire.
    pub fn from_buf(version: LinkVersion, buf: CellBuf) -> Cell {
        Cell::wrap(version, buf)
    }

    fn wrap(version: LinkVersion, buf: CellBuf) -> Cell {
        if version < LinkVersion::V4 {
            Cell::V3(buf)
        } else {
            Cell::V4(buf)
        }
    }

    pub fn version(&self) -> LinkVersion {
        match self {
            Cell::V3(_) => LinkVersion::V3,
            Cell::V4(_) => LinkVersion::V4,
        }
    }

    fn buf(&self) -> &CellBuf {
        match self {
            Cell::V3(b) | Cell::V4(b) => b,
        }
    }

    fn buf_mut(&mut self) -> &mut CellBuf {
        match self {
            Cell::V3(b) | Cell::V4(b) => b,
        }
    }

    pub fn circ_id(&self) -> CircuitId {
        CircuitId::from_wire(self.version(), self.buf())
    }

    pub fn command_byte(&self) -> u8 {
        self.buf()[self.version().header_len() - 1]
    }

    pub fn command(&self) -> Option<CellCommand> {
        CellCommand::from_u8(self.command_byte())
    }

    pub fn is_variable(&self) -> bool {
        is_variable_command(self.command_byte())
    }

    /// The logical payload: everything after the header for fixed cells,
    /// everything after the length prefix for variable ones.
    pub fn payload(&self) -> &[u8] {
        let start = self.payload_start();
        &self.buf()[start..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.payload_start();
        &mut self.buf_mut()[start..]
    }

    fn payload_start(&self) -> usize {
        let header = self.version().header_len();
        if self.is_variable() {
            header + 2
        } else {
            header
        }
    }

    /// The full wire image.
    pub fn bytes(&self) -> &[u8] {
        self.buf()
    }

    /// Surrender the backing buffer, e.g. to push it onto a write queue.
    pub fn into_buf(self) -> CellBuf {
        match self {
            Cell::V3(b) | Cell::V4(b) => b,
        }
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cell(v{}, circ {}, cmd {}, {} bytes)",
            self.version().get(),
            self.circ_id(),
            self.command_byte(),
            self.bytes().len()
        )
    }
}

/// View over a decrypted relay cell body.
///
/// Layout: command (1) | recognized (2) | stream ID (2) | digest (4) |
/// length (2) | data.
pub struct RelayCellView<'a> {
    bytes: &'a [u8],
}

impl<'a> RelayCellView<'a> {
    pub fn new(bytes: &'a [u8]) -> RelayCellView<'a> {
        debug_assert!(bytes.len() >= RELAY_HEADER_LEN);
        RelayCellView { bytes }
    }

    pub fn command_byte(&self) -> u8 {
        self.bytes[0]
    }

    pub fn command(&self) -> Option<RelayCommand> {
        RelayCommand::from_u8(self.bytes[0])
    }

    /// True when the two-byte recognized field is zero.
    pub fn recognized(&self) -> bool {
        self.bytes[1] == 0 && self.bytes[2] == 0
    }

    pub fn stream_id(&self) -> u16 {
        u16::from_be_bytes([self.bytes[3], self.bytes[4]])
    }

    pub fn digest(&self) -> &[u8] {
        &self.bytes[5..9]
    }

    pub fn length(&self) -> usize {
        u16::from_be_bytes([self.bytes[9], self.bytes[10]]) as usize
    }

    /// The declared data. Callers must have validated `length()` against
    /// the body size first.
    pub fn data(&self) -> &[u8] {
        &self.bytes[RELAY_HEADER_LEN..RELAY_HEADER_LEN + self.length()]
    }

    pub fn body(&self) -> &[u8] {
        self.bytes
    }
}
