//! In-memory broadcast bus used by the test suite.
//!
//! Every endpoint attached to a [`LoopbackBus`] receives every frame the
//! other endpoints send, mimicking a vcan interface without requiring
//! kernel support. Delivery order matches send order.

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

use canopen_common::Frame;

use super::{CanTransport, TransportError};

struct Endpoint {
    id: usize,
    tx: Sender<Frame>,
}

#[derive(Clone, Default)]
pub struct LoopbackBus {
    endpoints: Arc<Mutex<Vec<Endpoint>>>,
    next_id: Arc<Mutex<usize>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint to the bus.
    pub fn attach(&self) -> LoopbackTransport {
        let (tx, rx) = channel();
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            *next
        };
        self.endpoints.lock().unwrap().push(Endpoint { id, tx });
        LoopbackTransport {
            id,
            rx,
            endpoints: self.endpoints.clone(),
            open: true,
        }
    }
}

pub struct LoopbackTransport {
    id: usize,
    rx: Receiver<Frame>,
    endpoints: Arc<Mutex<Vec<Endpoint>>>,
    open: bool,
}

impl CanTransport for LoopbackTransport {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let endpoints = self.endpoints.lock().unwrap();
        for endpoint in endpoints.iter() {
            if endpoint.id != self.id {
                // A detached receiver just misses the frame, like a
                // device dropping off a real bus.
                let _ = endpoint.tx.send(*frame);
            }
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.endpoints.lock().unwrap().retain(|e| e.id != self.id);
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_broadcast_to_other_endpoints_only() {
        let bus = LoopbackBus::new();
        let mut a = bus.attach();
        let mut b = bus.attach();
        let mut c = bus.attach();

        let frame = Frame::new(0x181, &[1, 2]).unwrap();
        a.send(&frame).unwrap();

        assert_eq!(a.try_recv().unwrap(), None);
        assert_eq!(b.try_recv().unwrap(), Some(frame));
        assert_eq!(c.try_recv().unwrap(), Some(frame));
    }

    #[test]
    fn closed_endpoint_stops_receiving() {
        let bus = LoopbackBus::new();
        let mut a = bus.attach();
        let mut b = bus.attach();

        b.close();
        a.send(&Frame::new(0x181, &[]).unwrap()).unwrap();
        assert_eq!(b.try_recv(), Err(TransportError::Closed));
    }

    #[test]
    fn preserves_send_order() {
        let bus = LoopbackBus::new();
        let mut a = bus.attach();
        let mut b = bus.attach();

        for i in 0..5u8 {
            a.send(&Frame::new(0x200, &[i]).unwrap()).unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(b.try_recv().unwrap().unwrap().data(), &[i]);
        }
    }
}
