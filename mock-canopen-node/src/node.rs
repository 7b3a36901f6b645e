//! Transport-agnostic protocol core of the mock node.
//!
//! [`MockNode::handle_frame`] maps one inbound frame to zero or more
//! response frames, so the same node runs over SocketCAN in the binary
//! and over the in-memory loopback bus in the engine's test suite.

use std::time::{Duration, Instant};

use canopen_common::nmt::{self, NmtCommand};
use canopen_common::sdo::{
    self, abort_code, SdoClientRequest, EXPEDITED_MAX, SDO_RESPONSE_BASE, SEGMENT_MAX,
};
use canopen_common::{Frame, FrameClass, NmtStatus};

struct UploadState {
    data: Vec<u8>,
    offset: usize,
    toggle: bool,
}

struct DownloadState {
    index: u16,
    subindex: u8,
    collected: Vec<u8>,
    toggle: bool,
}

pub struct MockNode {
    node_id: u8,
    od: crate::ObjectDictionary,
    state: NmtStatus,
    heartbeat_period: Duration,
    last_heartbeat: Option<Instant>,
    upload: Option<UploadState>,
    download: Option<DownloadState>,
}

impl MockNode {
    pub fn new(node_id: u8, od: crate::ObjectDictionary) -> Self {
        Self {
            node_id,
            od,
            state: NmtStatus::PreOperational,
            heartbeat_period: Duration::from_millis(100),
            last_heartbeat: None,
            upload: None,
            download: None,
        }
    }

    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn state(&self) -> NmtStatus {
        self.state
    }

    /// The boot-up announcement a real device sends once on power-up.
    pub fn bootup_frame(&self) -> Frame {
        nmt::heartbeat_frame(self.node_id, NmtStatus::Boot)
    }

    /// Next heartbeat, if one is due at `now`.
    pub fn heartbeat_due(&mut self, now: Instant) -> Option<Frame> {
        let due = match self.last_heartbeat {
            Some(last) => now.duration_since(last) >= self.heartbeat_period,
            None => true,
        };
        if due {
            self.last_heartbeat = Some(now);
            Some(nmt::heartbeat_frame(self.node_id, self.state))
        } else {
            None
        }
    }

    /// Process one inbound frame and produce the frames we answer with.
    pub fn handle_frame(&mut self, frame: &Frame) -> Vec<Frame> {
        match frame.classify() {
            FrameClass::NmtCommand => self.handle_nmt(frame),
            FrameClass::SdoRequest { node } if node == self.node_id => self.handle_sdo(frame),
            _ => Vec::new(),
        }
    }

    fn handle_nmt(&mut self, frame: &Frame) -> Vec<Frame> {
        let Some((command, target)) = nmt::parse_command(frame) else {
            return Vec::new();
        };
        if target != 0 && target != self.node_id {
            return Vec::new();
        }
        match command {
            NmtCommand::Start => {
                self.state = NmtStatus::Operational;
                Vec::new()
            }
            NmtCommand::Stop => {
                self.state = NmtStatus::Stopped;
                Vec::new()
            }
            NmtCommand::EnterPreOperational => {
                self.state = NmtStatus::PreOperational;
                Vec::new()
            }
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => {
                // A reset device announces itself again and comes back
                // pre-operational.
                self.state = NmtStatus::PreOperational;
                self.upload = None;
                self.download = None;
                self.last_heartbeat = None;
                vec![self.bootup_frame()]
            }
        }
    }

    fn handle_sdo(&mut self, frame: &Frame) -> Vec<Frame> {
        let request = match sdo::parse_client_request(frame) {
            Ok(request) => request,
            Err(_) => {
                return vec![self.abort(0, 0, abort_code::COMMAND_SPECIFIER_INVALID)];
            }
        };

        match request {
            SdoClientRequest::Upload { index, subindex } => self.start_upload(index, subindex),
            SdoClientRequest::UploadSegment { toggle } => self.continue_upload(toggle),
            SdoClientRequest::ExpeditedDownload { index, subindex, data } => {
                self.apply_write(index, subindex, data)
            }
            SdoClientRequest::SegmentedDownloadInit { index, subindex, .. } => {
                self.download = Some(DownloadState {
                    index,
                    subindex,
                    collected: Vec::new(),
                    toggle: false,
                });
                vec![sdo::download_response(self.node_id, index, subindex)]
            }
            SdoClientRequest::DownloadSegment { toggle, last, data } => {
                self.continue_download(toggle, last, data)
            }
            SdoClientRequest::Abort { .. } => {
                self.upload = None;
                self.download = None;
                Vec::new()
            }
        }
    }

    fn start_upload(&mut self, index: u16, subindex: u8) -> Vec<Frame> {
        match self.od.get(index, subindex) {
            Some(data) if data.is_empty() => {
                vec![self.abort(index, subindex, abort_code::GENERAL_ERROR)]
            }
            Some(data) if data.len() <= EXPEDITED_MAX => {
                vec![sdo::expedited_upload_response(self.node_id, index, subindex, &data)]
            }
            Some(data) => {
                let size = data.len() as u32;
                self.upload = Some(UploadState { data, offset: 0, toggle: false });
                vec![sdo::segmented_upload_response(self.node_id, index, subindex, size)]
            }
            None => vec![self.abort(index, subindex, abort_code::OBJECT_DOES_NOT_EXIST)],
        }
    }

    fn continue_upload(&mut self, toggle: bool) -> Vec<Frame> {
        let Some(upload) = self.upload.as_mut() else {
            return vec![self.abort(0, 0, abort_code::COMMAND_SPECIFIER_INVALID)];
        };
        if toggle != upload.toggle {
            self.upload = None;
            return vec![self.abort(0, 0, abort_code::TOGGLE_NOT_ALTERNATED)];
        }

        let n = (upload.data.len() - upload.offset).min(SEGMENT_MAX);
        let chunk = upload.data[upload.offset..upload.offset + n].to_vec();
        upload.offset += n;
        let last = upload.offset >= upload.data.len();
        let response = sdo::upload_segment_response(self.node_id, toggle, &chunk, last);

        if last {
            self.upload = None;
        } else {
            upload.toggle = !upload.toggle;
        }
        vec![response]
    }

    fn continue_download(&mut self, toggle: bool, last: bool, data: Vec<u8>) -> Vec<Frame> {
        let Some(download) = self.download.as_mut() else {
            return vec![self.abort(0, 0, abort_code::COMMAND_SPECIFIER_INVALID)];
        };
        if toggle != download.toggle {
            self.download = None;
            return vec![self.abort(0, 0, abort_code::TOGGLE_NOT_ALTERNATED)];
        }

        download.collected.extend_from_slice(&data);
        download.toggle = !download.toggle;
        let ack = sdo::download_segment_response(self.node_id, toggle);

        if last {
            let Some(download) = self.download.take() else {
                return vec![ack];
            };
            let mut responses = self.apply_write(download.index, download.subindex, download.collected);
            // The write outcome replaces the final segment ack on failure.
            if responses.first().map(|f| f.data()[0]) == Some(0x80) {
                return responses;
            }
            responses.clear();
            responses.push(ack);
            return responses;
        }
        vec![ack]
    }

    fn apply_write(&mut self, index: u16, subindex: u8, data: Vec<u8>) -> Vec<Frame> {
        match self.od.write(index, subindex, data) {
            Ok(()) => vec![sdo::download_response(self.node_id, index, subindex)],
            Err(true) => vec![self.abort(index, subindex, abort_code::READ_ONLY)],
            Err(false) => vec![self.abort(index, subindex, abort_code::OBJECT_DOES_NOT_EXIST)],
        }
    }

    fn abort(&self, index: u16, subindex: u8, code: u32) -> Frame {
        sdo::abort_frame(SDO_RESPONSE_BASE + self.node_id as u16, index, subindex, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopen_common::sdo::SdoServerReply;

    fn node() -> MockNode {
        let mut od = crate::ObjectDictionary::new();
        od.add_test_objects();
        MockNode::new(4, od)
    }

    #[test]
    fn answers_expedited_upload() {
        let mut node = node();
        let responses = node.handle_frame(&sdo::upload_request(4, 0x1000, 0x00));
        assert_eq!(responses.len(), 1);
        assert_eq!(
            sdo::parse_server_reply(&responses[0]).unwrap(),
            SdoServerReply::ExpeditedUpload {
                index: 0x1000,
                subindex: 0x00,
                data: 0x191u32.to_le_bytes().to_vec(),
            }
        );
    }

    #[test]
    fn long_value_goes_segmented() {
        let mut node = node();
        let responses = node.handle_frame(&sdo::upload_request(4, 0x1008, 0x00));
        assert!(matches!(
            sdo::parse_server_reply(&responses[0]).unwrap(),
            SdoServerReply::SegmentedUploadInit { size: Some(15), .. }
        ));

        let mut collected = Vec::new();
        let mut toggle = false;
        loop {
            let responses = node.handle_frame(&sdo::upload_segment_request(4, toggle));
            match sdo::parse_server_reply(&responses[0]).unwrap() {
                SdoServerReply::UploadSegment { data, last, .. } => {
                    collected.extend_from_slice(&data);
                    if last {
                        break;
                    }
                }
                other => panic!("unexpected reply {:?}", other),
            }
            toggle = !toggle;
        }
        assert_eq!(collected, b"MockCANopenNode");
    }

    #[test]
    fn ignores_requests_for_other_nodes() {
        let mut node = node();
        assert!(node.handle_frame(&sdo::upload_request(9, 0x1000, 0x00)).is_empty());
    }

    #[test]
    fn missing_object_aborts() {
        let mut node = node();
        let responses = node.handle_frame(&sdo::upload_request(4, 0x5555, 0x00));
        assert!(matches!(
            sdo::parse_server_reply(&responses[0]).unwrap(),
            SdoServerReply::Abort { code: 0x0602_0000, .. }
        ));
    }

    #[test]
    fn writable_entry_accepts_download() {
        let mut node = node();
        let responses =
            node.handle_frame(&sdo::expedited_download_request(4, 0x2003, 0x01, &[0xAA, 0x55]));
        assert!(matches!(
            sdo::parse_server_reply(&responses[0]).unwrap(),
            SdoServerReply::DownloadAck { .. }
        ));
        assert_eq!(node.od.get(0x2003, 0x01), Some(vec![0xAA, 0x55]));
    }

    #[test]
    fn static_entry_rejects_download() {
        let mut node = node();
        let responses =
            node.handle_frame(&sdo::expedited_download_request(4, 0x1000, 0x00, &[0x00]));
        assert!(matches!(
            sdo::parse_server_reply(&responses[0]).unwrap(),
            SdoServerReply::Abort { code: 0x0601_0002, .. }
        ));
    }

    #[test]
    fn segmented_download_collects_all_bytes() {
        let mut node = node();
        let payload = b"segmented label";

        node.handle_frame(&sdo::segmented_download_request(4, 0x2006, 0x00, payload.len() as u32));
        node.handle_frame(&sdo::download_segment(4, false, &payload[..7], false));
        node.handle_frame(&sdo::download_segment(4, true, &payload[7..14], false));
        node.handle_frame(&sdo::download_segment(4, false, &payload[14..], true));

        assert_eq!(node.od.get(0x2006, 0x00), Some(payload.to_vec()));
    }

    #[test]
    fn nmt_commands_move_the_state_machine() {
        let mut node = node();
        assert_eq!(node.state(), NmtStatus::PreOperational);

        node.handle_frame(&nmt::command_frame(NmtCommand::Start, 0));
        assert_eq!(node.state(), NmtStatus::Operational);

        node.handle_frame(&nmt::command_frame(NmtCommand::Stop, 4));
        assert_eq!(node.state(), NmtStatus::Stopped);

        // Addressed to someone else: ignored.
        node.handle_frame(&nmt::command_frame(NmtCommand::Start, 9));
        assert_eq!(node.state(), NmtStatus::Stopped);

        let responses = node.handle_frame(&nmt::command_frame(NmtCommand::ResetNode, 0));
        assert_eq!(responses, vec![node.bootup_frame()]);
        assert_eq!(node.state(), NmtStatus::PreOperational);
    }

    #[test]
    fn heartbeat_fires_on_schedule() {
        let mut node = node().with_heartbeat_period(Duration::from_millis(100));
        let start = Instant::now();

        let first = node.heartbeat_due(start).unwrap();
        assert_eq!(first.cob(), 0x704);
        assert!(node.heartbeat_due(start + Duration::from_millis(50)).is_none());
        assert!(node.heartbeat_due(start + Duration::from_millis(150)).is_some());
    }
}
