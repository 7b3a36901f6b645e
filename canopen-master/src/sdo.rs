//! SDO client engine: pending queues, the active-transaction table and
//! the transfer state machine.
//!
//! Replies arrive on `0x580 + node`, which cannot distinguish two
//! outstanding transfers to the same node, so the engine keeps at most
//! one transaction in flight per node and queues the rest. Transactions
//! to different nodes run concurrently.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use canopen_common::sdo::{
    self, abort_code, SdoError, SdoServerReply, EXPEDITED_MAX, SDO_REQUEST_BASE, SEGMENT_MAX,
};
use canopen_common::Frame;

/// Completion channel handed back to the caller. Sending is the
/// "callback fires exactly once" moment; the sender is consumed by it.
pub(crate) type SdoCompletion = oneshot::Sender<Result<Vec<u8>, SdoError>>;

enum Direction {
    Read,
    Write { payload: Vec<u8> },
}

#[derive(PartialEq, Eq)]
enum Phase {
    Init,
    UploadSegments,
    DownloadSegments,
}

/// What to do after feeding a reply into a transaction.
enum Advance {
    /// Transfer continues; transmit this frame.
    Send(Frame),
    /// Transfer finished.
    Complete(Result<Vec<u8>, SdoError>),
    /// Protocol violation: transmit the abort frame, then finish.
    Fail(Frame, SdoError),
}

pub(crate) struct SdoTransaction {
    node: u8,
    index: u16,
    subindex: u8,
    direction: Direction,
    phase: Phase,
    toggle: bool,
    collected: Vec<u8>,
    offset: usize,
    last_request: Frame,
    last_sent_at: Instant,
    retries: u8,
    done: Option<SdoCompletion>,
}

impl SdoTransaction {
    pub fn read(node: u8, index: u16, subindex: u8, done: SdoCompletion) -> Self {
        let first = sdo::upload_request(node, index, subindex);
        Self::new(node, index, subindex, Direction::Read, first, done)
    }

    pub fn write(node: u8, index: u16, subindex: u8, payload: Vec<u8>, done: SdoCompletion) -> Self {
        let first = if payload.len() <= EXPEDITED_MAX {
            sdo::expedited_download_request(node, index, subindex, &payload)
        } else {
            sdo::segmented_download_request(node, index, subindex, payload.len() as u32)
        };
        Self::new(node, index, subindex, Direction::Write { payload }, first, done)
    }

    fn new(
        node: u8,
        index: u16,
        subindex: u8,
        direction: Direction,
        first: Frame,
        done: SdoCompletion,
    ) -> Self {
        Self {
            node,
            index,
            subindex,
            direction,
            phase: Phase::Init,
            toggle: false,
            collected: Vec::new(),
            offset: 0,
            last_request: first,
            last_sent_at: Instant::now(),
            retries: 0,
            done: Some(done),
        }
    }

    fn complete(mut self, result: Result<Vec<u8>, SdoError>) {
        if let Some(done) = self.done.take() {
            // The receiver may already be gone.
            let _ = done.send(result);
        }
    }

    fn fail(&self, code: u32, what: &str) -> Advance {
        Advance::Fail(
            sdo::abort_frame(SDO_REQUEST_BASE + self.node as u16, self.index, self.subindex, code),
            SdoError::Protocol(what.to_string()),
        )
    }

    fn next_download_segment(&mut self) -> Frame {
        let Direction::Write { payload } = &self.direction else {
            unreachable!("download segments only exist for writes");
        };
        let n = (payload.len() - self.offset).min(SEGMENT_MAX);
        let last = self.offset + n >= payload.len();
        let frame =
            sdo::download_segment(self.node, self.toggle, &payload[self.offset..self.offset + n], last);
        self.offset += n;
        frame
    }

    fn advance(&mut self, reply: SdoServerReply) -> Advance {
        match reply {
            SdoServerReply::Abort { code, .. } => Advance::Complete(Err(SdoError::Abort { code })),

            SdoServerReply::ExpeditedUpload { index, subindex, data } => {
                if !matches!(self.direction, Direction::Read)
                    || (index, subindex) != (self.index, self.subindex)
                {
                    return self.fail(abort_code::GENERAL_ERROR, "reply does not match the pending read");
                }
                Advance::Complete(Ok(data))
            }

            SdoServerReply::SegmentedUploadInit { index, subindex, .. } => {
                if !matches!(self.direction, Direction::Read)
                    || self.phase != Phase::Init
                    || (index, subindex) != (self.index, self.subindex)
                {
                    return self.fail(abort_code::GENERAL_ERROR, "unexpected segmented upload reply");
                }
                self.phase = Phase::UploadSegments;
                self.toggle = false;
                Advance::Send(sdo::upload_segment_request(self.node, self.toggle))
            }

            SdoServerReply::UploadSegment { toggle, last, data } => {
                if self.phase != Phase::UploadSegments {
                    return self.fail(abort_code::GENERAL_ERROR, "upload segment outside a segmented read");
                }
                if toggle != self.toggle {
                    return self.fail(abort_code::TOGGLE_NOT_ALTERNATED, "toggle bit not alternated");
                }
                self.collected.extend_from_slice(&data);
                if last {
                    Advance::Complete(Ok(std::mem::take(&mut self.collected)))
                } else {
                    self.toggle = !self.toggle;
                    Advance::Send(sdo::upload_segment_request(self.node, self.toggle))
                }
            }

            SdoServerReply::DownloadAck { index, subindex } => {
                let payload_len = match &self.direction {
                    Direction::Write { payload } => payload.len(),
                    Direction::Read => {
                        return self.fail(abort_code::GENERAL_ERROR, "download ack for a read");
                    }
                };
                if self.phase != Phase::Init || (index, subindex) != (self.index, self.subindex) {
                    return self.fail(abort_code::GENERAL_ERROR, "unexpected download ack");
                }
                if payload_len <= EXPEDITED_MAX {
                    Advance::Complete(Ok(Vec::new()))
                } else {
                    self.phase = Phase::DownloadSegments;
                    self.toggle = false;
                    Advance::Send(self.next_download_segment())
                }
            }

            SdoServerReply::DownloadSegmentAck { toggle } => {
                let payload_len = match &self.direction {
                    Direction::Write { payload } => payload.len(),
                    Direction::Read => {
                        return self.fail(abort_code::GENERAL_ERROR, "segment ack for a read");
                    }
                };
                if self.phase != Phase::DownloadSegments {
                    return self.fail(abort_code::GENERAL_ERROR, "segment ack outside a segmented write");
                }
                if toggle != self.toggle {
                    return self.fail(abort_code::TOGGLE_NOT_ALTERNATED, "toggle bit not alternated");
                }
                if self.offset >= payload_len {
                    Advance::Complete(Ok(Vec::new()))
                } else {
                    self.toggle = !self.toggle;
                    Advance::Send(self.next_download_segment())
                }
            }
        }
    }
}

pub(crate) struct SdoEngine {
    pending: HashMap<u8, VecDeque<SdoTransaction>>,
    active: HashMap<u8, SdoTransaction>,
    timeout: Duration,
    max_retries: u8,
}

impl SdoEngine {
    pub fn new(timeout: Duration, max_retries: u8) -> Self {
        Self {
            pending: HashMap::new(),
            active: HashMap::new(),
            timeout,
            max_retries,
        }
    }

    /// Queue a transaction; it starts once its node has no transfer in
    /// flight. Never blocks.
    pub fn enqueue(&mut self, txn: SdoTransaction) {
        self.pending.entry(txn.node).or_default().push_back(txn);
    }

    /// Queued plus in-flight transaction count.
    pub fn queue_depth(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum::<usize>() + self.active.len()
    }

    /// Start the next queued transaction for every idle node.
    pub fn start_ready(&mut self, send: &mut dyn FnMut(&Frame), now: Instant) {
        let ready: Vec<u8> = self
            .pending
            .iter()
            .filter(|(node, queue)| !queue.is_empty() && !self.active.contains_key(*node))
            .map(|(node, _)| *node)
            .collect();

        for node in ready {
            let Some(queue) = self.pending.get_mut(&node) else { continue };
            let Some(mut txn) = queue.pop_front() else { continue };
            if queue.is_empty() {
                self.pending.remove(&node);
            }
            txn.last_sent_at = now;
            log::debug!(
                "SDO {} node {} 0x{:04X}:{:02X} started",
                match txn.direction {
                    Direction::Read => "read",
                    Direction::Write { .. } => "write",
                },
                node,
                txn.index,
                txn.subindex
            );
            send(&txn.last_request);
            self.active.insert(node, txn);
        }
    }

    /// Feed a reply frame from `0x580 + node` into the matching
    /// transaction. The active slot is released before any completion is
    /// delivered, so a completion handler enqueueing a follow-up request
    /// sees a consistent table.
    pub fn on_response(&mut self, node: u8, frame: &Frame, send: &mut dyn FnMut(&Frame), now: Instant) {
        let Some(mut txn) = self.active.remove(&node) else {
            log::debug!("unsolicited SDO reply from node {}", node);
            return;
        };

        let reply = match sdo::parse_server_reply(frame) {
            Ok(reply) => reply,
            Err(err) => {
                log::warn!("malformed SDO reply from node {}: {}", node, err);
                send(&sdo::abort_frame(
                    SDO_REQUEST_BASE + node as u16,
                    txn.index,
                    txn.subindex,
                    abort_code::COMMAND_SPECIFIER_INVALID,
                ));
                txn.complete(Err(err));
                return;
            }
        };

        match txn.advance(reply) {
            Advance::Send(frame) => {
                txn.last_request = frame;
                txn.last_sent_at = now;
                txn.retries = 0;
                send(&txn.last_request);
                self.active.insert(node, txn);
            }
            Advance::Complete(result) => txn.complete(result),
            Advance::Fail(abort, err) => {
                log::warn!("aborting SDO transfer with node {}: {}", node, err);
                send(&abort);
                txn.complete(Err(err));
            }
        }
    }

    /// Retry/timeout sweep, run once per dispatch-loop iteration.
    pub fn tick(&mut self, send: &mut dyn FnMut(&Frame), now: Instant) {
        let expired: Vec<u8> = self
            .active
            .iter()
            .filter(|(_, txn)| now.duration_since(txn.last_sent_at) >= self.timeout)
            .map(|(node, _)| *node)
            .collect();

        for node in expired {
            let Some(mut txn) = self.active.remove(&node) else { continue };
            if txn.retries < self.max_retries {
                txn.retries += 1;
                txn.last_sent_at = now;
                log::warn!(
                    "SDO request to node {} unanswered, retry {}/{}",
                    node,
                    txn.retries,
                    self.max_retries
                );
                let request = txn.last_request;
                send(&request);
                self.active.insert(node, txn);
            } else {
                log::warn!("SDO request to node {} timed out", node);
                txn.complete(Err(SdoError::Timeout));
            }
        }
    }

    /// Drop all queued transactions; each completes with `Cancelled`.
    /// In-flight transfers are left to finish so the wire state stays
    /// consistent.
    pub fn flush(&mut self) {
        for (_, queue) in self.pending.drain() {
            for txn in queue {
                txn.complete(Err(SdoError::Cancelled));
            }
        }
    }

    /// Cancel everything, queued and in flight. Used at engine shutdown
    /// so no caller is left waiting forever.
    pub fn cancel_all(&mut self) {
        self.flush();
        for (_, txn) in self.active.drain() {
            txn.complete(Err(SdoError::Cancelled));
        }
    }
}
