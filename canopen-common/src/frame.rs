// frame.rs
use std::fmt;

use socketcan::{CanFrame, EmbeddedFrame, Id, StandardId};

/// Largest valid 11-bit CAN identifier.
pub const COB_MAX: u16 = 0x7FF;

/// Errors raised while constructing or converting a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// COB-ID does not fit the 11-bit identifier space.
    IdOutOfRange(u16),
    /// More than 8 data bytes.
    TooLong(usize),
    /// Extended (29-bit) identifiers are not used by CANopen.
    ExtendedId,
    /// Remote frames carry no data and are not part of the protocol.
    RemoteFrame,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdOutOfRange(cob) => write!(f, "COB-ID 0x{:X} exceeds 11 bits", cob),
            Self::TooLong(len) => write!(f, "{} data bytes exceed the CAN maximum of 8", len),
            Self::ExtendedId => write!(f, "extended (29-bit) identifiers are not supported"),
            Self::RemoteFrame => write!(f, "remote frames are not supported"),
        }
    }
}

impl std::error::Error for FrameError {}

/// A classic CAN data frame: 11-bit COB-ID, length and up to 8 payload bytes.
///
/// Bytes beyond `len` are zero and never observable through [`Frame::data`].
/// RTR is not supported as it is pretty much not used on CANopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    cob: u16,
    len: u8,
    data: [u8; 8],
}

impl Frame {
    /// Build a frame, validating the identifier range and payload length.
    pub fn new(cob: u16, data: &[u8]) -> Result<Self, FrameError> {
        if cob > COB_MAX {
            return Err(FrameError::IdOutOfRange(cob));
        }
        if data.len() > 8 {
            return Err(FrameError::TooLong(data.len()));
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            cob,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Internal constructor for protocol helpers whose inputs are known valid.
    pub(crate) fn raw(cob: u16, data: &[u8]) -> Self {
        debug_assert!(cob <= COB_MAX && data.len() <= 8);
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Self {
            cob,
            len: data.len() as u8,
            data: buf,
        }
    }

    pub fn cob(&self) -> u16 {
        self.cob
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes, truncated to the frame's length.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn classify(&self) -> FrameClass {
        FrameClass::of(self.cob)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03x} {:x}", self.cob, self.len)?;
        for byte in self.data() {
            write!(f, " {:02x}", byte)?;
        }
        Ok(())
    }
}

impl TryFrom<&CanFrame> for Frame {
    type Error = FrameError;

    fn try_from(frame: &CanFrame) -> Result<Self, FrameError> {
        if frame.is_remote_frame() {
            return Err(FrameError::RemoteFrame);
        }
        match frame.id() {
            Id::Standard(id) => Frame::new(id.as_raw(), frame.data()),
            Id::Extended(_) => Err(FrameError::ExtendedId),
        }
    }
}

impl TryFrom<&Frame> for CanFrame {
    type Error = FrameError;

    fn try_from(frame: &Frame) -> Result<Self, FrameError> {
        let id = StandardId::new(frame.cob()).ok_or(FrameError::IdOutOfRange(frame.cob()))?;
        CanFrame::new(id, frame.data()).ok_or(FrameError::TooLong(frame.data().len()))
    }
}

/// CANopen message class derived from the COB-ID range.
///
/// The ranges follow the pre-defined connection set; the first matching
/// rule wins, so SYNC (0x080) and TIME (0x100) take precedence over the
/// surrounding EMCY range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// NMT master command, COB-ID 0x000.
    NmtCommand,
    /// SYNC, COB-ID 0x080.
    Sync,
    /// TIME stamp, COB-ID 0x100.
    Time,
    /// Emergency, 0x081..=0x0FF.
    Emcy,
    /// Process data, 0x180..=0x57F.
    Pdo,
    /// SDO server-to-client reply, 0x580 + node.
    SdoResponse { node: u8 },
    /// SDO client-to-server request, 0x600 + node. Seen on the bus when
    /// observing other masters or our own echoed traffic.
    SdoRequest { node: u8 },
    /// Heartbeat / boot-up report, 0x700 + node (node 1..=127).
    Heartbeat { node: u8 },
    /// Layer Setting Services, COB-ID 0x7E5.
    Lss,
    /// Anything outside the pre-defined connection set.
    Other,
}

impl FrameClass {
    pub fn of(cob: u16) -> Self {
        match cob {
            0x000 => Self::NmtCommand,
            0x080 => Self::Sync,
            0x100 => Self::Time,
            0x001..=0x0FF => Self::Emcy,
            0x180..=0x57F => Self::Pdo,
            0x580..=0x5FF => Self::SdoResponse {
                node: (cob - 0x580) as u8,
            },
            0x600..=0x67F => Self::SdoRequest {
                node: (cob - 0x600) as u8,
            },
            0x701..=0x77F => Self::Heartbeat {
                node: (cob & 0x7F) as u8,
            },
            0x7E5 => Self::Lss,
            _ => Self::Other,
        }
    }
}

/// CAN bus bit rates supported by the driver layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Bitrate {
    B10k,
    B20k,
    B50k,
    B100k,
    B125k,
    B250k,
    B500k,
    B800k,
    B1M,
}

impl Bitrate {
    pub fn bits_per_second(&self) -> u32 {
        match self {
            Self::B10k => 10_000,
            Self::B20k => 20_000,
            Self::B50k => 50_000,
            Self::B100k => 100_000,
            Self::B125k => 125_000,
            Self::B250k => 250_000,
            Self::B500k => 500_000,
            Self::B800k => 800_000,
            Self::B1M => 1_000_000,
        }
    }
}

impl Default for Bitrate {
    fn default() -> Self {
        Self::B125k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_id() {
        assert_eq!(Frame::new(0x800, &[]), Err(FrameError::IdOutOfRange(0x800)));
    }

    #[test]
    fn rejects_oversized_payload() {
        assert_eq!(Frame::new(0x181, &[0u8; 9]), Err(FrameError::TooLong(9)));
    }

    #[test]
    fn data_is_truncated_to_length() {
        let frame = Frame::new(0x181, &[1, 2, 3]).unwrap();
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.data(), &[1, 2, 3]);
    }

    #[test]
    fn display_dumps_cob_len_and_bytes() {
        let frame = Frame::new(0x183, &[0x01, 0xAB]).unwrap();
        assert_eq!(frame.to_string(), "183 2 01 ab");
    }

    #[test]
    fn classification_table() {
        // Representative identifiers for every class.
        assert_eq!(FrameClass::of(0x000), FrameClass::NmtCommand);
        assert_eq!(FrameClass::of(0x080), FrameClass::Sync);
        assert_eq!(FrameClass::of(0x081), FrameClass::Emcy);
        assert_eq!(FrameClass::of(0x100), FrameClass::Time);
        assert_eq!(FrameClass::of(0x181), FrameClass::Pdo);
        assert_eq!(FrameClass::of(0x5A1), FrameClass::SdoResponse { node: 0x21 });
        assert_eq!(FrameClass::of(0x601), FrameClass::SdoRequest { node: 0x01 });
        assert_eq!(FrameClass::of(0x705), FrameClass::Heartbeat { node: 5 });
        assert_eq!(FrameClass::of(0x7E5), FrameClass::Lss);
        assert_eq!(FrameClass::of(0x7FF), FrameClass::Other);
    }

    #[test]
    fn heartbeat_range_excludes_node_zero_and_lss() {
        assert_eq!(FrameClass::of(0x700), FrameClass::Other);
        assert_eq!(FrameClass::of(0x77F), FrameClass::Heartbeat { node: 0x7F });
        assert_eq!(FrameClass::of(0x780), FrameClass::Other);
        assert_eq!(FrameClass::of(0x7E4), FrameClass::Other);
    }

    #[test]
    fn socketcan_round_trip() {
        let frame = Frame::new(0x205, &[0xDE, 0xAD]).unwrap();
        let can = CanFrame::try_from(&frame).unwrap();
        let back = Frame::try_from(&can).unwrap();
        assert_eq!(frame, back);
    }
}
