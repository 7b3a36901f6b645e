//! The dispatch loop: single consumer of the inbound queue, sole owner
//! of all protocol state.
//!
//! Each iteration drains whatever frames are ready, routes them by
//! COB-ID class, flushes the batched PDO event, then runs the SDO
//! retry/start logic. Caller API calls arrive over a command channel so
//! no state is ever touched from another thread.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use canopen_common::{Frame, FrameClass, NmtStatus};

use crate::nmt::{BootCallback, NmtTracker};
use crate::pdo::{PdoHandler, PdoRegistry};
use crate::sdo::{SdoCompletion, SdoEngine, SdoTransaction};
use crate::transport::{CanTransport, TransportError};

/// Event streams a caller can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Every inbound frame, regardless of class.
    Raw,
    /// NMT master commands (COB-ID 0x000).
    NmtCommand,
    /// Heartbeat / boot-up reports.
    NmtErrorControl,
    /// SDO traffic in both directions.
    Sdo,
    /// One event per dispatch pass carrying that pass's PDO frames.
    PdoBatch,
    Emcy,
    Sync,
    Time,
    Lss,
    /// Bus opened/closed.
    ConnectionChanged,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    Frame(Frame),
    PdoBatch(Vec<Frame>),
    ConnectionChanged(bool),
}

/// Point-in-time view of one node's NMT record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NmtSnapshot {
    pub current: NmtStatus,
    pub previous: NmtStatus,
    pub known: bool,
    pub compulsory: bool,
}

pub(crate) enum Command {
    SdoRead {
        node: u8,
        index: u16,
        subindex: u8,
        done: SdoCompletion,
    },
    SdoWrite {
        node: u8,
        index: u16,
        subindex: u8,
        payload: Vec<u8>,
        done: SdoCompletion,
    },
    RegisterPdo {
        cob: u16,
        handler: PdoHandler,
    },
    UnregisterPdo {
        cob: u16,
    },
    Subscribe {
        kind: EventKind,
        tx: mpsc::UnboundedSender<BusEvent>,
    },
    SetBootCallback {
        node: u8,
        cb: BootCallback,
    },
    SetCompulsory {
        node: u8,
        compulsory: bool,
    },
    NmtQuery {
        node: u8,
        reply: oneshot::Sender<NmtSnapshot>,
    },
    CheckLiveness {
        node: u8,
        max_age: Duration,
        reply: oneshot::Sender<bool>,
    },
    QueueDepth {
        reply: oneshot::Sender<usize>,
    },
    FlushSdoQueue,
    Stop,
}

/// Outbound path shared by the facade and the dispatch task. Sends go
/// straight to the transport; with echo enabled a copy of every sent
/// frame is fed back through the inbound queue so observers see our own
/// traffic interleaved with the bus.
#[derive(Clone)]
pub(crate) struct Outbound {
    transport: Arc<Mutex<Box<dyn CanTransport>>>,
    echo: bool,
    inbound_tx: mpsc::UnboundedSender<Frame>,
}

impl Outbound {
    pub fn new(
        transport: Arc<Mutex<Box<dyn CanTransport>>>,
        echo: bool,
        inbound_tx: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self { transport, echo, inbound_tx }
    }

    pub fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.transport.lock().unwrap().send(frame)?;
        if self.echo {
            let _ = self.inbound_tx.send(*frame);
        }
        Ok(())
    }

    /// Send from engine-internal paths where there is no caller to hand
    /// the error to.
    pub fn send_logged(&self, frame: &Frame) {
        if let Err(err) = self.send(frame) {
            log::error!("transmit failed: {}", err);
        }
    }
}

pub(crate) struct EngineCore {
    nmt: NmtTracker,
    sdo: SdoEngine,
    pdo: PdoRegistry,
    subscribers: Vec<(EventKind, mpsc::UnboundedSender<BusEvent>)>,
    pdo_batch: Vec<Frame>,
    outbound: Outbound,
}

impl EngineCore {
    pub fn new(outbound: Outbound, sdo_timeout: Duration, sdo_retries: u8) -> Self {
        Self {
            nmt: NmtTracker::new(),
            sdo: SdoEngine::new(sdo_timeout, sdo_retries),
            pdo: PdoRegistry::new(),
            subscribers: Vec::new(),
            pdo_batch: Vec::new(),
            outbound,
        }
    }

    fn emit(&mut self, kind: EventKind, event: &BusEvent) {
        // Dead receivers drop out of the list on the way through.
        self.subscribers
            .retain(|(k, tx)| *k != kind || tx.send(event.clone()).is_ok());
    }

    /// Classify and route one inbound frame.
    pub fn handle_frame(&mut self, frame: Frame, now: Instant) {
        self.emit(EventKind::Raw, &BusEvent::Frame(frame));

        match frame.classify() {
            FrameClass::NmtCommand => self.emit(EventKind::NmtCommand, &BusEvent::Frame(frame)),
            FrameClass::Sync => self.emit(EventKind::Sync, &BusEvent::Frame(frame)),
            FrameClass::Time => self.emit(EventKind::Time, &BusEvent::Frame(frame)),
            FrameClass::Emcy => self.emit(EventKind::Emcy, &BusEvent::Frame(frame)),
            FrameClass::Lss => self.emit(EventKind::Lss, &BusEvent::Frame(frame)),
            FrameClass::Pdo => {
                self.pdo.dispatch(frame.cob(), frame.data());
                self.pdo_batch.push(frame);
            }
            FrameClass::SdoResponse { node } => {
                let outbound = self.outbound.clone();
                self.sdo
                    .on_response(node, &frame, &mut |f| outbound.send_logged(f), now);
                self.emit(EventKind::Sdo, &BusEvent::Frame(frame));
            }
            FrameClass::SdoRequest { .. } => {
                // Our own echoed requests, or another master on the bus.
                self.emit(EventKind::Sdo, &BusEvent::Frame(frame));
            }
            FrameClass::Heartbeat { node } => {
                if let Some(&status) = frame.data().first() {
                    self.nmt.report(node, NmtStatus::from_raw(status), now);
                } else {
                    log::debug!("heartbeat from node {} with empty payload", node);
                }
                self.emit(EventKind::NmtErrorControl, &BusEvent::Frame(frame));
            }
            FrameClass::Other => {}
        }
    }

    /// Emit the PDO batch collected during this dispatch pass, if any.
    pub fn flush_pdo_batch(&mut self) {
        if !self.pdo_batch.is_empty() {
            let batch = std::mem::take(&mut self.pdo_batch);
            self.emit(EventKind::PdoBatch, &BusEvent::PdoBatch(batch));
        }
    }

    /// SDO housekeeping: timeout sweep, then start queued transactions
    /// whose node is idle.
    pub fn tick(&mut self, now: Instant) {
        let outbound = self.outbound.clone();
        self.sdo.tick(&mut |f| outbound.send_logged(f), now);
        self.sdo.start_ready(&mut |f| outbound.send_logged(f), now);
    }

    /// Returns false when the loop should stop.
    pub fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::SdoRead { node, index, subindex, done } => {
                self.sdo.enqueue(SdoTransaction::read(node, index, subindex, done));
            }
            Command::SdoWrite { node, index, subindex, payload, done } => {
                self.sdo
                    .enqueue(SdoTransaction::write(node, index, subindex, payload, done));
            }
            Command::RegisterPdo { cob, handler } => self.pdo.bind(cob, handler),
            Command::UnregisterPdo { cob } => self.pdo.unbind(cob),
            Command::Subscribe { kind, tx } => self.subscribers.push((kind, tx)),
            Command::SetBootCallback { node, cb } => self.nmt.set_boot_callback(node, cb),
            Command::SetCompulsory { node, compulsory } => {
                self.nmt.set_compulsory(node, compulsory)
            }
            Command::NmtQuery { node, reply } => {
                let _ = reply.send(NmtSnapshot {
                    current: self.nmt.current_status(node),
                    previous: self.nmt.previous_status(node),
                    known: self.nmt.is_known(node),
                    compulsory: self.nmt.is_compulsory(node),
                });
            }
            Command::CheckLiveness { node, max_age, reply } => {
                let _ = reply.send(self.nmt.check_liveness(node, max_age, Instant::now()));
            }
            Command::QueueDepth { reply } => {
                let _ = reply.send(self.sdo.queue_depth());
            }
            Command::FlushSdoQueue => self.sdo.flush(),
            Command::Stop => return false,
        }
        true
    }

    /// Final cleanup before the loop exits: pending and in-flight SDO
    /// transactions complete with `Cancelled` rather than vanishing.
    pub fn shutdown(&mut self) {
        self.sdo.cancel_all();
        self.emit(EventKind::ConnectionChanged, &BusEvent::ConnectionChanged(false));
    }
}

/// The dispatch loop itself. Runs until `Command::Stop` arrives or the
/// command channel closes.
pub(crate) async fn engine_task(
    mut core: EngineCore,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    mut frame_rx: mpsc::UnboundedReceiver<Frame>,
) {
    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(command) => {
                        if !core.handle_command(command) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = frame_rx.recv() => {
                if let Some(frame) = frame {
                    let now = Instant::now();
                    core.handle_frame(frame, now);
                    // Drain the rest of this pass before batching.
                    while let Ok(frame) = frame_rx.try_recv() {
                        core.handle_frame(frame, now);
                    }
                    core.flush_pdo_batch();
                }
            }
            // Wake periodically so SDO timeouts fire on an idle bus.
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }

        core.tick(Instant::now());
    }

    core.shutdown();
}
