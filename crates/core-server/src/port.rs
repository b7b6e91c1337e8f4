//! Message ports.
//!
//! A port is a bounded FIFO channel carrying framed messages. Every looper
//! owns the receiving end of exactly one port; anyone holding the port ID
//! can send. Sends take a timeout: the server uses zero for everything
//! except keyboard forwarding, so a wedged client can never block the
//! compositor.

use crate::protocol::Envelope;
use ahash::AHashMap;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type PortId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// The port ID does not name a live port.
    InvalidPort,
    /// The queue stayed full past the timeout.
    TimedOut,
    /// The receiving side is gone.
    Closed,
}

/// Process-wide port table. Cloning shares the underlying registry.
#[derive(Clone, Default)]
pub struct PortRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    senders: AHashMap<PortId, Sender<Envelope>>,
    next_id: PortId,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a port and hand back its receiving end.
    pub fn create_port(&self, capacity: usize) -> (PortId, Receiver<Envelope>) {
        let (tx, rx) = bounded(capacity);
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.senders.insert(id, tx);
        (id, rx)
    }

    pub fn close_port(&self, port: PortId) {
        self.inner.lock().unwrap().senders.remove(&port);
    }

    /// Send with a bounded wait. A zero timeout never blocks.
    pub fn send(&self, port: PortId, message: Envelope, timeout: Duration) -> Result<(), PortError> {
        let sender = {
            let inner = self.inner.lock().unwrap();
            inner.senders.get(&port).cloned()
        };
        let Some(sender) = sender else {
            return Err(PortError::InvalidPort);
        };
        if timeout.is_zero() {
            match sender.try_send(message) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(PortError::TimedOut),
                Err(TrySendError::Disconnected(_)) => Err(PortError::Closed),
            }
        } else {
            sender
                .send_timeout(message, timeout)
                .map_err(|err| match err {
                    crossbeam_channel::SendTimeoutError::Timeout(_) => PortError::TimedOut,
                    crossbeam_channel::SendTimeoutError::Disconnected(_) => PortError::Closed,
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageCode;

    fn envelope(code: MessageCode) -> Envelope {
        Envelope {
            target_handler: 0,
            code: code as i32,
            payload: Vec::new(),
        }
    }

    #[test]
    fn messages_arrive_in_fifo_order() {
        let registry = PortRegistry::new();
        let (port, rx) = registry.create_port(8);
        registry
            .send(port, envelope(MessageCode::Sync), Duration::ZERO)
            .unwrap();
        registry
            .send(port, envelope(MessageCode::PaintView), Duration::ZERO)
            .unwrap();
        assert_eq!(rx.recv().unwrap().code, MessageCode::Sync as i32);
        assert_eq!(rx.recv().unwrap().code, MessageCode::PaintView as i32);
    }

    #[test]
    fn zero_timeout_send_fails_on_full_queue() {
        let registry = PortRegistry::new();
        let (port, _rx) = registry.create_port(1);
        registry
            .send(port, envelope(MessageCode::Sync), Duration::ZERO)
            .unwrap();
        assert_eq!(
            registry.send(port, envelope(MessageCode::Sync), Duration::ZERO),
            Err(PortError::TimedOut)
        );
    }

    #[test]
    fn closed_port_is_reported() {
        let registry = PortRegistry::new();
        let (port, rx) = registry.create_port(1);
        drop(rx);
        assert_eq!(
            registry.send(port, envelope(MessageCode::Sync), Duration::ZERO),
            Err(PortError::Closed)
        );
        registry.close_port(port);
        assert_eq!(
            registry.send(port, envelope(MessageCode::Sync), Duration::ZERO),
            Err(PortError::InvalidPort)
        );
    }
}
