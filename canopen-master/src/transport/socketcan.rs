//! SocketCAN transport for physical and virtual (vcan) interfaces.

use std::io::ErrorKind;

use socketcan::{CanFrame, CanSocket, Socket};

use canopen_common::{Bitrate, Frame};

use super::{CanTransport, TransportError};

pub struct SocketCanTransport {
    socket: CanSocket,
    interface: String,
    bitrate: Bitrate,
}

impl SocketCanTransport {
    /// Open a SocketCAN interface by name (e.g. `can0`, `vcan0`).
    ///
    /// The bitrate is recorded for diagnostics only: SocketCAN fixes the
    /// bit timing when the interface is configured with `ip link`, not
    /// per socket.
    pub fn open(interface: &str, bitrate: Bitrate) -> Result<Self, TransportError> {
        let socket = CanSocket::open(interface)
            .map_err(|e| TransportError::Open(format!("{}: {}", interface, e)))?;

        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::Open(e.to_string()))?;

        log::info!(
            "opened CAN interface {} ({} bit/s configured)",
            interface,
            bitrate.bits_per_second()
        );

        Ok(Self {
            socket,
            interface: interface.to_string(),
            bitrate,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn bitrate(&self) -> Bitrate {
        self.bitrate
    }

    /// List CAN-capable network interfaces known to the kernel.
    pub fn enumerate() -> Vec<String> {
        let mut interfaces = Vec::new();
        if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with("can") || name.starts_with("vcan") || name.starts_with("slcan")
                {
                    interfaces.push(name);
                }
            }
        }
        interfaces.sort();
        interfaces
    }
}

impl CanTransport for SocketCanTransport {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let can = CanFrame::try_from(frame).map_err(|e| TransportError::Send(e.to_string()))?;
        self.socket
            .write_frame(&can)
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn try_recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.socket.read_frame() {
            Ok(can) => match Frame::try_from(&can) {
                Ok(frame) => Ok(Some(frame)),
                // Extended/remote frames are not part of CANopen; skip them.
                Err(_) => Ok(None),
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(TransportError::Receive(e.to_string())),
        }
    }

    fn close(&mut self) {
        log::info!("closing CAN interface {}", self.interface);
    }
}
