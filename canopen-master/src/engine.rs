//! The engine facade: owns the transport, the reader thread and the
//! dispatch task, and exposes the caller-facing API.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use canopen_common::nmt::{self, NmtCommand};
use canopen_common::sdo::SdoPayload;
use canopen_common::{Frame, FrameError, NmtStatus, SdoError};

use crate::config::EngineConfig;
use crate::dispatch::{engine_task, BusEvent, Command, EngineCore, EventKind, Outbound};
use crate::transport::{CanTransport, SocketCanTransport, TransportError};

/// Facade-level errors.
#[derive(Debug)]
pub enum CanOpenError {
    Transport(TransportError),
    Frame(FrameError),
    /// The engine has been closed.
    NotOpen,
    /// The dispatch task is gone; no further requests can be served.
    EngineGone,
}

impl fmt::Display for CanOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport error: {}", err),
            Self::Frame(err) => write!(f, "invalid frame: {}", err),
            Self::NotOpen => write!(f, "engine is not open"),
            Self::EngineGone => write!(f, "engine dispatch task is gone"),
        }
    }
}

impl Error for CanOpenError {}

impl From<TransportError> for CanOpenError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<FrameError> for CanOpenError {
    fn from(err: FrameError) -> Self {
        Self::Frame(err)
    }
}

/// A running CANopen master engine.
///
/// Opening spawns two workers: a reader thread polling the transport
/// into the inbound queue, and the dispatch task owning all protocol
/// state. All methods are safe to call from any thread; requests that
/// need protocol state round-trip through the dispatch task.
pub struct Engine {
    command_tx: mpsc::UnboundedSender<Command>,
    outbound: Outbound,
    transport: Arc<Mutex<Box<dyn CanTransport>>>,
    running: Arc<AtomicBool>,
    reader: Option<std::thread::JoinHandle<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Open a SocketCAN interface and start the engine.
    pub async fn open(config: EngineConfig) -> Result<Self, CanOpenError> {
        let transport = SocketCanTransport::open(&config.interface, config.bitrate)?;
        Self::open_with(Box::new(transport), config).await
    }

    /// Start the engine over an already-opened transport. This is how
    /// tests run the engine against the in-memory loopback bus.
    pub async fn open_with(
        transport: Box<dyn CanTransport>,
        config: EngineConfig,
    ) -> Result<Self, CanOpenError> {
        let transport = Arc::new(Mutex::new(transport));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let outbound = Outbound::new(transport.clone(), config.echo, inbound_tx.clone());

        let reader = std::thread::Builder::new()
            .name("can-reader".into())
            .spawn({
                let transport = transport.clone();
                let running = running.clone();
                move || reader_loop(transport, running, inbound_tx)
            })
            .map_err(|e| TransportError::Open(e.to_string()))?;

        let core = EngineCore::new(outbound.clone(), config.sdo_timeout(), config.sdo_retries);
        let task = tokio::spawn(engine_task(core, command_rx, inbound_rx));

        log::info!("engine started on {}", config.interface);

        Ok(Self {
            command_tx,
            outbound,
            transport,
            running,
            reader: Some(reader),
            task: Some(task),
        })
    }

    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the dispatch loop and release the transport. Queued and
    /// in-flight SDO transactions complete with [`SdoError::Cancelled`].
    /// Idempotent.
    pub async fn close(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.command_tx.send(Command::Stop);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.transport.lock().unwrap().close();
        log::info!("engine closed");
    }

    /// Transmit a frame. With echo enabled (the default) a copy is also
    /// delivered through the inbound queue, so subscribers observe our
    /// own traffic uniformly with the bus.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), CanOpenError> {
        if !self.is_open() {
            return Err(CanOpenError::NotOpen);
        }
        self.outbound.send(frame).map_err(CanOpenError::from)
    }

    fn command(&self, command: Command) -> Result<(), CanOpenError> {
        if !self.is_open() {
            return Err(CanOpenError::NotOpen);
        }
        self.command_tx
            .send(command)
            .map_err(|_| CanOpenError::EngineGone)
    }

    // --- SDO client ---

    /// Read an object dictionary entry from a remote node. Resolves when
    /// the transfer completes, is aborted, or times out.
    pub async fn sdo_read(&self, node: u8, index: u16, subindex: u8) -> Result<Vec<u8>, SdoError> {
        let (done, rx) = oneshot::channel();
        self.command(Command::SdoRead { node, index, subindex, done })
            .map_err(|_| SdoError::Closed)?;
        rx.await.map_err(|_| SdoError::Closed)?
    }

    /// Write raw bytes to an object dictionary entry. Payloads up to
    /// four bytes go expedited, longer ones as a segmented download.
    pub async fn sdo_write(
        &self,
        node: u8,
        index: u16,
        subindex: u8,
        payload: &[u8],
    ) -> Result<(), SdoError> {
        if payload.is_empty() {
            return Err(SdoError::Protocol("empty write payload".to_string()));
        }
        let (done, rx) = oneshot::channel();
        self.command(Command::SdoWrite {
            node,
            index,
            subindex,
            payload: payload.to_vec(),
            done,
        })
        .map_err(|_| SdoError::Closed)?;
        rx.await.map_err(|_| SdoError::Closed)?.map(|_| ())
    }

    /// Write a numeric value, serialized little-endian at its natural
    /// width: `sdo_write_value(5, 0x1017, 0, 1000u16)`.
    pub async fn sdo_write_value<T: SdoPayload>(
        &self,
        node: u8,
        index: u16,
        subindex: u8,
        value: T,
    ) -> Result<(), SdoError> {
        self.sdo_write(node, index, subindex, &value.to_le_payload()).await
    }

    /// Number of SDO transactions queued or in flight.
    pub async fn sdo_queue_depth(&self) -> Result<usize, CanOpenError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::QueueDepth { reply })?;
        rx.await.map_err(|_| CanOpenError::EngineGone)
    }

    /// Cancel all queued SDO transactions. The in-flight transaction per
    /// node, if any, runs to completion.
    pub fn flush_sdo_queue(&self) -> Result<(), CanOpenError> {
        self.command(Command::FlushSdoQueue)
    }

    // --- PDO ---

    /// Register a decode callback for a PDO COB-ID. The last
    /// registration for an id wins. The callback runs on the dispatch
    /// task with the frame's payload.
    pub fn register_pdo<F>(&self, cob: u16, handler: F) -> Result<(), CanOpenError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.command(Command::RegisterPdo { cob, handler: Box::new(handler) })
    }

    pub fn unregister_pdo(&self, cob: u16) -> Result<(), CanOpenError> {
        self.command(Command::UnregisterPdo { cob })
    }

    /// Transmit a PDO with the given payload.
    pub fn write_pdo(&self, cob: u16, payload: &[u8]) -> Result<(), CanOpenError> {
        let frame = Frame::new(cob, payload)?;
        self.send_frame(&frame)
    }

    // --- NMT ---

    /// Start remote node (0 = all nodes).
    pub fn nmt_start(&self, node: u8) -> Result<(), CanOpenError> {
        self.send_frame(&nmt::command_frame(NmtCommand::Start, node))
    }

    /// Stop remote node (0 = all nodes).
    pub fn nmt_stop(&self, node: u8) -> Result<(), CanOpenError> {
        self.send_frame(&nmt::command_frame(NmtCommand::Stop, node))
    }

    /// Put remote node into pre-operational (0 = all nodes).
    pub fn nmt_preop(&self, node: u8) -> Result<(), CanOpenError> {
        self.send_frame(&nmt::command_frame(NmtCommand::EnterPreOperational, node))
    }

    /// Reset remote node (0 = all nodes).
    pub fn nmt_reset_node(&self, node: u8) -> Result<(), CanOpenError> {
        self.send_frame(&nmt::command_frame(NmtCommand::ResetNode, node))
    }

    /// Reset remote node communication (0 = all nodes).
    pub fn nmt_reset_comms(&self, node: u8) -> Result<(), CanOpenError> {
        self.send_frame(&nmt::command_frame(NmtCommand::ResetCommunication, node))
    }

    /// Register a callback fired when `node` announces boot-up.
    pub fn nmt_set_boot_callback<F>(&self, node: u8, cb: F) -> Result<(), CanOpenError>
    where
        F: FnMut(NmtStatus) + Send + 'static,
    {
        self.command(Command::SetBootCallback { node, cb: Box::new(cb) })
    }

    /// Mark a node as compulsory for bus health evaluation.
    pub fn nmt_set_compulsory(&self, node: u8, compulsory: bool) -> Result<(), CanOpenError> {
        self.command(Command::SetCompulsory { node, compulsory })
    }

    /// True once any heartbeat or boot-up has been seen from `node`.
    pub async fn nmt_is_known(&self, node: u8) -> Result<bool, CanOpenError> {
        Ok(self.nmt_query(node).await?.known)
    }

    /// Last reported NMT state of `node`.
    pub async fn nmt_status(&self, node: u8) -> Result<NmtStatus, CanOpenError> {
        Ok(self.nmt_query(node).await?.current)
    }

    /// The state `node` reported immediately before its current one.
    pub async fn nmt_previous_status(&self, node: u8) -> Result<NmtStatus, CanOpenError> {
        Ok(self.nmt_query(node).await?.previous)
    }

    pub async fn nmt_is_compulsory(&self, node: u8) -> Result<bool, CanOpenError> {
        Ok(self.nmt_query(node).await?.compulsory)
    }

    /// True iff `node` reported within the last `max_age`.
    pub async fn nmt_check_liveness(
        &self,
        node: u8,
        max_age: Duration,
    ) -> Result<bool, CanOpenError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::CheckLiveness { node, max_age, reply })?;
        rx.await.map_err(|_| CanOpenError::EngineGone)
    }

    async fn nmt_query(&self, node: u8) -> Result<crate::dispatch::NmtSnapshot, CanOpenError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::NmtQuery { node, reply })?;
        rx.await.map_err(|_| CanOpenError::EngineGone)
    }

    // --- events ---

    /// Subscribe to an event stream. Events are produced on the dispatch
    /// task and buffered; drop the receiver to unsubscribe.
    pub fn subscribe(
        &self,
        kind: EventKind,
    ) -> Result<mpsc::UnboundedReceiver<BusEvent>, CanOpenError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.command(Command::Subscribe { kind, tx })?;
        Ok(rx)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Best effort: stop the workers if close() was never awaited.
        self.running.store(false, Ordering::SeqCst);
        let _ = self.command_tx.send(Command::Stop);
    }
}

fn reader_loop(
    transport: Arc<Mutex<Box<dyn CanTransport>>>,
    running: Arc<AtomicBool>,
    inbound_tx: mpsc::UnboundedSender<Frame>,
) {
    while running.load(Ordering::SeqCst) {
        let received = { transport.lock().unwrap().try_recv() };
        match received {
            Ok(Some(frame)) => {
                if inbound_tx.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {
                // Bus idle; back off briefly instead of spinning.
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => {
                log::error!("CAN receive error: {}", err);
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }
}
