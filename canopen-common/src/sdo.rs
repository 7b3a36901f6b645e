// sdo.rs
//
// Frame-level codecs for the SDO protocol: request builders used by the
// client engine, reply builders used by simulated servers, and parsers
// for both directions. All multi-byte fields are little-endian on the
// wire.

use std::error::Error;
use std::fmt;

use crate::frame::Frame;

/// Base COB-ID for client-to-server requests; add the node id.
pub const SDO_REQUEST_BASE: u16 = 0x600;
/// Base COB-ID for server-to-client replies; add the node id.
pub const SDO_RESPONSE_BASE: u16 = 0x580;

/// Most data a single expedited transfer can carry.
pub const EXPEDITED_MAX: usize = 4;
/// Most data a single segment can carry.
pub const SEGMENT_MAX: usize = 7;

// Command specifiers, bits 7..5 of the command byte.
const CCS_DOWNLOAD_SEGMENT: u8 = 0 << 5;
const CCS_INITIATE_DOWNLOAD: u8 = 1 << 5;
const CCS_INITIATE_UPLOAD: u8 = 2 << 5;
const CCS_UPLOAD_SEGMENT: u8 = 3 << 5;
const SCS_UPLOAD_SEGMENT: u8 = 0 << 5;
const SCS_DOWNLOAD_SEGMENT: u8 = 1 << 5;
const SCS_INITIATE_UPLOAD: u8 = 2 << 5;
const SCS_INITIATE_DOWNLOAD: u8 = 3 << 5;
const CS_ABORT: u8 = 4 << 5;

const TOGGLE_BIT: u8 = 1 << 4;
const EXPEDITED_BIT: u8 = 1 << 1;
const SIZE_BIT: u8 = 1 << 0;
const LAST_SEGMENT_BIT: u8 = 1 << 0;

/// Well-known SDO abort codes.
pub mod abort_code {
    pub const TOGGLE_NOT_ALTERNATED: u32 = 0x0503_0000;
    pub const PROTOCOL_TIMED_OUT: u32 = 0x0504_0000;
    pub const COMMAND_SPECIFIER_INVALID: u32 = 0x0504_0001;
    pub const WRITE_ONLY: u32 = 0x0601_0001;
    pub const READ_ONLY: u32 = 0x0601_0002;
    pub const OBJECT_DOES_NOT_EXIST: u32 = 0x0602_0000;
    pub const WRONG_LENGTH: u32 = 0x0607_0010;
    pub const SUBINDEX_DOES_NOT_EXIST: u32 = 0x0609_0011;
    pub const GENERAL_ERROR: u32 = 0x0800_0000;
}

/// Errors terminating an SDO transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoError {
    /// No matching reply within the retry budget.
    Timeout,
    /// The remote node aborted the transfer.
    Abort { code: u32 },
    /// The reply could not be interpreted; the transaction was aborted locally.
    Protocol(String),
    /// The transaction was flushed or the engine shut down before completion.
    Cancelled,
    /// The engine is not running.
    Closed,
}

impl fmt::Display for SdoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "SDO request timeout"),
            Self::Abort { code } => {
                write!(f, "SDO abort 0x{:08X}: {}", code, abort_code_description(*code))
            }
            Self::Protocol(msg) => write!(f, "SDO protocol error: {}", msg),
            Self::Cancelled => write!(f, "SDO request cancelled"),
            Self::Closed => write!(f, "engine is not open"),
        }
    }
}

impl Error for SdoError {}

/// Human-readable description of an SDO abort code.
pub fn abort_code_description(code: u32) -> String {
    match code {
        0x05030000 => "Toggle bit not alternated".to_string(),
        0x05040000 => "SDO protocol timed out".to_string(),
        0x05040001 => "Client/server command specifier not valid or unknown".to_string(),
        0x05040005 => "Out of memory".to_string(),
        0x06010000 => "Unsupported access to an object".to_string(),
        0x06010001 => "Attempt to read a write only object".to_string(),
        0x06010002 => "Attempt to write a read only object".to_string(),
        0x06020000 => "Object does not exist in the object dictionary".to_string(),
        0x06040041 => "Object cannot be mapped to the PDO".to_string(),
        0x06040042 => "The number and length of the objects to be mapped would exceed PDO length".to_string(),
        0x06040043 => "General parameter incompatibility reason".to_string(),
        0x06040047 => "General internal incompatibility in the device".to_string(),
        0x06060000 => "Access failed due to a hardware error".to_string(),
        0x06070010 => "Data type does not match, length of service parameter does not match".to_string(),
        0x06070012 => "Data type does not match, length of service parameter too high".to_string(),
        0x06070013 => "Data type does not match, length of service parameter too low".to_string(),
        0x06090011 => "Sub-index does not exist".to_string(),
        0x06090030 => "Value range of parameter exceeded (only for write access)".to_string(),
        0x06090031 => "Value of parameter written too high".to_string(),
        0x06090032 => "Value of parameter written too low".to_string(),
        0x06090036 => "Maximum value is less than minimum value".to_string(),
        0x08000000 => "General error".to_string(),
        0x08000020 => "Data cannot be transferred or stored to the application".to_string(),
        0x08000021 => "Data cannot be transferred or stored to the application because of local control".to_string(),
        0x08000022 => "Data cannot be transferred or stored to the application because of the present device state".to_string(),
        _ => format!("Unknown abort code: 0x{:08X}", code),
    }
}

fn multiplexed(cob: u16, command: u8, index: u16, subindex: u8, tail: &[u8]) -> Frame {
    let mut data = [0u8; 8];
    data[0] = command;
    data[1] = (index & 0xFF) as u8;
    data[2] = (index >> 8) as u8;
    data[3] = subindex;
    data[4..4 + tail.len()].copy_from_slice(tail);
    Frame::raw(cob, &data)
}

// --- client request builders ---

/// Initiate an upload (read) of an object dictionary entry.
pub fn upload_request(node: u8, index: u16, subindex: u8) -> Frame {
    multiplexed(SDO_REQUEST_BASE + node as u16, CCS_INITIATE_UPLOAD, index, subindex, &[])
}

/// Request the next upload segment.
pub fn upload_segment_request(node: u8, toggle: bool) -> Frame {
    let command = CCS_UPLOAD_SEGMENT | if toggle { TOGGLE_BIT } else { 0 };
    Frame::raw(SDO_REQUEST_BASE + node as u16, &[command, 0, 0, 0, 0, 0, 0, 0])
}

/// Expedited download (write) of 1..=4 bytes.
pub fn expedited_download_request(node: u8, index: u16, subindex: u8, data: &[u8]) -> Frame {
    debug_assert!((1..=EXPEDITED_MAX).contains(&data.len()));
    let n = (EXPEDITED_MAX - data.len()) as u8;
    let command = CCS_INITIATE_DOWNLOAD | (n << 2) | EXPEDITED_BIT | SIZE_BIT;
    multiplexed(SDO_REQUEST_BASE + node as u16, command, index, subindex, data)
}

/// Initiate a segmented download of `size` bytes.
pub fn segmented_download_request(node: u8, index: u16, subindex: u8, size: u32) -> Frame {
    let command = CCS_INITIATE_DOWNLOAD | SIZE_BIT;
    multiplexed(SDO_REQUEST_BASE + node as u16, command, index, subindex, &size.to_le_bytes())
}

/// One download segment of 1..=7 bytes.
pub fn download_segment(node: u8, toggle: bool, data: &[u8], last: bool) -> Frame {
    debug_assert!((1..=SEGMENT_MAX).contains(&data.len()));
    let n = (SEGMENT_MAX - data.len()) as u8;
    let command = CCS_DOWNLOAD_SEGMENT
        | if toggle { TOGGLE_BIT } else { 0 }
        | (n << 1)
        | if last { LAST_SEGMENT_BIT } else { 0 };
    let mut buf = [0u8; 8];
    buf[0] = command;
    buf[1..1 + data.len()].copy_from_slice(data);
    Frame::raw(SDO_REQUEST_BASE + node as u16, &buf)
}

/// Abort frame for either direction; `cob` selects the channel.
pub fn abort_frame(cob: u16, index: u16, subindex: u8, code: u32) -> Frame {
    multiplexed(cob, CS_ABORT, index, subindex, &code.to_le_bytes())
}

// --- server reply builders (used by simulated nodes) ---

/// Expedited upload reply carrying 1..=4 bytes.
pub fn expedited_upload_response(node: u8, index: u16, subindex: u8, data: &[u8]) -> Frame {
    debug_assert!((1..=EXPEDITED_MAX).contains(&data.len()));
    let n = (EXPEDITED_MAX - data.len()) as u8;
    let command = SCS_INITIATE_UPLOAD | (n << 2) | EXPEDITED_BIT | SIZE_BIT;
    multiplexed(SDO_RESPONSE_BASE + node as u16, command, index, subindex, data)
}

/// Segmented upload initiation reply announcing the total size.
pub fn segmented_upload_response(node: u8, index: u16, subindex: u8, size: u32) -> Frame {
    let command = SCS_INITIATE_UPLOAD | SIZE_BIT;
    multiplexed(SDO_RESPONSE_BASE + node as u16, command, index, subindex, &size.to_le_bytes())
}

/// One upload segment reply of 1..=7 bytes.
pub fn upload_segment_response(node: u8, toggle: bool, data: &[u8], last: bool) -> Frame {
    debug_assert!((1..=SEGMENT_MAX).contains(&data.len()));
    let n = (SEGMENT_MAX - data.len()) as u8;
    let command = SCS_UPLOAD_SEGMENT
        | if toggle { TOGGLE_BIT } else { 0 }
        | (n << 1)
        | if last { LAST_SEGMENT_BIT } else { 0 };
    let mut buf = [0u8; 8];
    buf[0] = command;
    buf[1..1 + data.len()].copy_from_slice(data);
    Frame::raw(SDO_RESPONSE_BASE + node as u16, &buf)
}

/// Acknowledge a download initiation (expedited or segmented).
pub fn download_response(node: u8, index: u16, subindex: u8) -> Frame {
    multiplexed(SDO_RESPONSE_BASE + node as u16, SCS_INITIATE_DOWNLOAD, index, subindex, &[])
}

/// Acknowledge one download segment.
pub fn download_segment_response(node: u8, toggle: bool) -> Frame {
    let command = SCS_DOWNLOAD_SEGMENT | if toggle { TOGGLE_BIT } else { 0 };
    Frame::raw(SDO_RESPONSE_BASE + node as u16, &[command, 0, 0, 0, 0, 0, 0, 0])
}

// --- parsers ---

/// A server-to-client reply, as seen by the client engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoServerReply {
    ExpeditedUpload {
        index: u16,
        subindex: u8,
        data: Vec<u8>,
    },
    SegmentedUploadInit {
        index: u16,
        subindex: u8,
        size: Option<u32>,
    },
    UploadSegment {
        toggle: bool,
        last: bool,
        data: Vec<u8>,
    },
    DownloadAck {
        index: u16,
        subindex: u8,
    },
    DownloadSegmentAck {
        toggle: bool,
    },
    Abort {
        index: u16,
        subindex: u8,
        code: u32,
    },
}

/// Decode a reply frame from the 0x580 + node channel.
///
/// The protocol pads every SDO frame to 8 bytes; anything shorter is
/// malformed.
pub fn parse_server_reply(frame: &Frame) -> Result<SdoServerReply, SdoError> {
    let data = frame.data();
    if data.len() != 8 {
        return Err(SdoError::Protocol(format!(
            "SDO reply with length {} instead of 8",
            data.len()
        )));
    }

    let command = data[0];
    let index = u16::from_le_bytes([data[1], data[2]]);
    let subindex = data[3];

    match command & 0xE0 {
        CS_ABORT => Ok(SdoServerReply::Abort {
            index,
            subindex,
            code: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        }),
        SCS_INITIATE_UPLOAD => {
            if command & EXPEDITED_BIT != 0 {
                // n is only meaningful when the size bit is set.
                let n = if command & SIZE_BIT != 0 {
                    ((command >> 2) & 0x3) as usize
                } else {
                    0
                };
                Ok(SdoServerReply::ExpeditedUpload {
                    index,
                    subindex,
                    data: data[4..8 - n].to_vec(),
                })
            } else {
                let size = if command & SIZE_BIT != 0 {
                    Some(u32::from_le_bytes([data[4], data[5], data[6], data[7]]))
                } else {
                    None
                };
                Ok(SdoServerReply::SegmentedUploadInit { index, subindex, size })
            }
        }
        SCS_UPLOAD_SEGMENT => {
            let n = ((command >> 1) & 0x7) as usize;
            Ok(SdoServerReply::UploadSegment {
                toggle: command & TOGGLE_BIT != 0,
                last: command & LAST_SEGMENT_BIT != 0,
                data: data[1..8 - n].to_vec(),
            })
        }
        SCS_INITIATE_DOWNLOAD => Ok(SdoServerReply::DownloadAck { index, subindex }),
        SCS_DOWNLOAD_SEGMENT => Ok(SdoServerReply::DownloadSegmentAck {
            toggle: command & TOGGLE_BIT != 0,
        }),
        _ => Err(SdoError::Protocol(format!(
            "unknown server command specifier 0x{:02X}",
            command
        ))),
    }
}

/// A client-to-server request, as seen by a server implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoClientRequest {
    Upload {
        index: u16,
        subindex: u8,
    },
    UploadSegment {
        toggle: bool,
    },
    ExpeditedDownload {
        index: u16,
        subindex: u8,
        data: Vec<u8>,
    },
    SegmentedDownloadInit {
        index: u16,
        subindex: u8,
        size: Option<u32>,
    },
    DownloadSegment {
        toggle: bool,
        last: bool,
        data: Vec<u8>,
    },
    Abort {
        index: u16,
        subindex: u8,
        code: u32,
    },
}

/// Decode a request frame from the 0x600 + node channel.
pub fn parse_client_request(frame: &Frame) -> Result<SdoClientRequest, SdoError> {
    let data = frame.data();
    if data.len() != 8 {
        return Err(SdoError::Protocol(format!(
            "SDO request with length {} instead of 8",
            data.len()
        )));
    }

    let command = data[0];
    let index = u16::from_le_bytes([data[1], data[2]]);
    let subindex = data[3];

    match command & 0xE0 {
        CCS_INITIATE_UPLOAD => Ok(SdoClientRequest::Upload { index, subindex }),
        CCS_UPLOAD_SEGMENT => Ok(SdoClientRequest::UploadSegment {
            toggle: command & TOGGLE_BIT != 0,
        }),
        CCS_INITIATE_DOWNLOAD => {
            if command & EXPEDITED_BIT != 0 {
                let n = if command & SIZE_BIT != 0 {
                    ((command >> 2) & 0x3) as usize
                } else {
                    0
                };
                Ok(SdoClientRequest::ExpeditedDownload {
                    index,
                    subindex,
                    data: data[4..8 - n].to_vec(),
                })
            } else {
                let size = if command & SIZE_BIT != 0 {
                    Some(u32::from_le_bytes([data[4], data[5], data[6], data[7]]))
                } else {
                    None
                };
                Ok(SdoClientRequest::SegmentedDownloadInit { index, subindex, size })
            }
        }
        CCS_DOWNLOAD_SEGMENT => {
            let n = ((command >> 1) & 0x7) as usize;
            Ok(SdoClientRequest::DownloadSegment {
                toggle: command & TOGGLE_BIT != 0,
                last: command & LAST_SEGMENT_BIT != 0,
                data: data[1..8 - n].to_vec(),
            })
        }
        CS_ABORT => Ok(SdoClientRequest::Abort {
            index,
            subindex,
            code: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        }),
        _ => Err(SdoError::Protocol(format!(
            "unknown client command specifier 0x{:02X}",
            command
        ))),
    }
}

/// Values that serialize to a little-endian SDO write payload.
///
/// Collapses the numeric write overload family into one generic entry
/// point: `sdo_write_value(node, index, subindex, 42u32)`.
pub trait SdoPayload {
    fn to_le_payload(&self) -> Vec<u8>;
}

macro_rules! impl_sdo_payload {
    ($($t:ty),*) => {
        $(impl SdoPayload for $t {
            fn to_le_payload(&self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
        })*
    };
}

impl_sdo_payload!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_request_layout() {
        let frame = upload_request(0x21, 0x2000, 0x01);
        assert_eq!(frame.cob(), 0x621);
        assert_eq!(frame.data(), &[0x40, 0x00, 0x20, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn expedited_download_command_encodes_length() {
        let frame = expedited_download_request(5, 0x1017, 0x00, &[0xE8, 0x03]);
        assert_eq!(frame.cob(), 0x605);
        // 0x23 base plus two unused bytes
        assert_eq!(frame.data()[0], 0x2B);
        assert_eq!(&frame.data()[4..6], &[0xE8, 0x03]);
    }

    #[test]
    fn download_segment_toggle_and_last() {
        let frame = download_segment(5, true, &[1, 2, 3], true);
        // toggle | (7-3)<<1 | last
        assert_eq!(frame.data()[0], 0x19);
        assert_eq!(&frame.data()[1..4], &[1, 2, 3]);

        let frame = download_segment(5, false, &[1, 2, 3, 4, 5, 6, 7], false);
        assert_eq!(frame.data()[0], 0x00);
    }

    #[test]
    fn parse_expedited_upload() {
        let frame = expedited_upload_response(4, 0x1000, 0x00, &[0x91, 0x01, 0x00, 0x00]);
        assert_eq!(
            parse_server_reply(&frame).unwrap(),
            SdoServerReply::ExpeditedUpload {
                index: 0x1000,
                subindex: 0x00,
                data: vec![0x91, 0x01, 0x00, 0x00],
            }
        );
    }

    #[test]
    fn parse_expedited_upload_short_value() {
        let frame = expedited_upload_response(4, 0x1001, 0x00, &[0x7F]);
        match parse_server_reply(&frame).unwrap() {
            SdoServerReply::ExpeditedUpload { data, .. } => assert_eq!(data, vec![0x7F]),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn parse_segmented_upload_init_carries_size() {
        let frame = segmented_upload_response(4, 0x1008, 0x00, 15);
        assert_eq!(
            parse_server_reply(&frame).unwrap(),
            SdoServerReply::SegmentedUploadInit {
                index: 0x1008,
                subindex: 0x00,
                size: Some(15),
            }
        );
    }

    #[test]
    fn parse_upload_segment_trims_padding() {
        let frame = upload_segment_response(4, true, &[b'a', b'b'], true);
        assert_eq!(
            parse_server_reply(&frame).unwrap(),
            SdoServerReply::UploadSegment {
                toggle: true,
                last: true,
                data: vec![b'a', b'b'],
            }
        );
    }

    #[test]
    fn parse_abort() {
        let frame =
            abort_frame(SDO_RESPONSE_BASE + 4, 0x2000, 0x05, abort_code::OBJECT_DOES_NOT_EXIST);
        assert_eq!(
            parse_server_reply(&frame).unwrap(),
            SdoServerReply::Abort {
                index: 0x2000,
                subindex: 0x05,
                code: 0x0602_0000,
            }
        );
    }

    #[test]
    fn parse_rejects_short_frame() {
        let frame = Frame::new(0x584, &[0x43, 0x00, 0x10]).unwrap();
        assert!(matches!(parse_server_reply(&frame), Err(SdoError::Protocol(_))));
    }

    #[test]
    fn client_request_round_trip() {
        let frame = upload_request(4, 0x1000, 0x00);
        assert_eq!(
            parse_client_request(&frame).unwrap(),
            SdoClientRequest::Upload { index: 0x1000, subindex: 0x00 }
        );

        let frame = expedited_download_request(4, 0x2003, 0x01, &[0x31, 0x00]);
        assert_eq!(
            parse_client_request(&frame).unwrap(),
            SdoClientRequest::ExpeditedDownload {
                index: 0x2003,
                subindex: 0x01,
                data: vec![0x31, 0x00],
            }
        );

        let frame = segmented_download_request(4, 0x2006, 0x00, 12);
        assert_eq!(
            parse_client_request(&frame).unwrap(),
            SdoClientRequest::SegmentedDownloadInit {
                index: 0x2006,
                subindex: 0x00,
                size: Some(12),
            }
        );

        let frame = download_segment(4, false, &[9, 8, 7, 6, 5], false);
        assert_eq!(
            parse_client_request(&frame).unwrap(),
            SdoClientRequest::DownloadSegment {
                toggle: false,
                last: false,
                data: vec![9, 8, 7, 6, 5],
            }
        );
    }

    #[test]
    fn numeric_payloads_are_little_endian() {
        assert_eq!(0x1234u16.to_le_payload(), vec![0x34, 0x12]);
        assert_eq!(0x0100_0000u32.to_le_payload(), vec![0, 0, 0, 1]);
        assert_eq!((-1i8).to_le_payload(), vec![0xFF]);
        assert_eq!(1.0f32.to_le_payload(), vec![0, 0, 0x80, 0x3F]);
    }
}
