//! The transport contract the rest of this crate is built on, plus an
//! in-process reference implementation used by the test suite.
//!
//! A real deployment plugs in its own [`Channel`] (TCP, MPI, whatever the
//! cluster's transport is); this crate only requires that it deliver in
//! FIFO order per `(sender, recipient)` pair, never drop a message, and
//! stamp every send/receive with a [`LamportTime`] per the usual rule.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::clock::{LamportClock, LamportTime, ProcessId};
use crate::packet::{MessageType, Packet};

/// Everything the core protocol needs from a transport.
pub trait Channel: Send + Sync {
    /// This process's id within the group.
    fn process_id(&self) -> ProcessId;

    /// The fixed number of peers in the group, including this one.
    fn number_of_processes(&self) -> usize;

    /// The current value of the local Lamport clock, without advancing it.
    fn current_lamport_time(&self) -> LamportTime;

    /// Send one packet to one recipient. Returns the packet actually put on
    /// the wire, with its assigned [`LamportTime`].
    fn send(&self, message_type: MessageType, payload: &[u8], recipient: ProcessId) -> crate::error::Result<Packet>;

    /// Send the same message, under a single [`LamportTime`], to exactly
    /// the given recipients. Returns the packet as sent (every recipient
    /// sees an identical copy, with the same timestamp).
    fn send_many(&self, message_type: MessageType, payload: &[u8], recipients: &[ProcessId]) -> crate::error::Result<Packet>;

    /// Send the same message, under a single [`LamportTime`], to every peer
    /// except self. Returns the packet as broadcast (all recipients see an
    /// identical copy, notably with the same timestamp -- callers that
    /// record "our own request's timestamp" rely on this).
    fn send_others(&self, message_type: MessageType, payload: &[u8]) -> crate::error::Result<Packet>;

    /// Block until the next inbound packet arrives. Advances the local
    /// clock per the receive rule before returning.
    fn receive(&self) -> crate::error::Result<Packet>;
}

/// An in-process [`Channel`] backed by one `mpsc` pair per ordered peer
/// pair. Used by the test suite to exercise the protocol without a real
/// network.
pub struct InMemoryChannel {
    process_id: ProcessId,
    n: usize,
    clock: LamportClock,
    senders: Vec<Sender<Packet>>,
    receiver: Mutex<Receiver<Packet>>,
}

impl InMemoryChannel {
    /// Build one connected [`InMemoryChannel`] per process in a group of
    /// size `n`.
    pub fn new_group(n: usize) -> Vec<Self> {
        let mut senders_by_recipient: Vec<Sender<Packet>> = Vec::with_capacity(n);
        let mut receivers: Vec<Receiver<Packet>> = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = mpsc::channel();
            senders_by_recipient.push(tx);
            receivers.push(rx);
        }
        receivers
            .into_iter()
            .enumerate()
            .map(|(id, rx)| Self {
                process_id: id as ProcessId,
                n,
                clock: LamportClock::new(),
                senders: senders_by_recipient.clone(),
                receiver: Mutex::new(rx),
            })
            .collect()
    }
}

impl Channel for InMemoryChannel {
    fn process_id(&self) -> ProcessId {
        self.process_id
    }

    fn number_of_processes(&self) -> usize {
        self.n
    }

    fn current_lamport_time(&self) -> LamportTime {
        self.clock.current()
    }

    fn send(&self, message_type: MessageType, payload: &[u8], recipient: ProcessId) -> crate::error::Result<Packet> {
        let lamport_time = self.clock.tick();
        let packet = Packet::new(lamport_time, self.process_id, message_type, payload.to_vec());
        self.senders[recipient as usize]
            .send(packet.clone())
            .map_err(|e| crate::error::Error::Channel(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))?;
        Ok(packet)
    }

    fn send_many(&self, message_type: MessageType, payload: &[u8], recipients: &[ProcessId]) -> crate::error::Result<Packet> {
        let lamport_time = self.clock.tick();
        let packet = Packet::new(lamport_time, self.process_id, message_type, payload.to_vec());
        for &recipient in recipients {
            self.senders[recipient as usize]
                .send(packet.clone())
                .map_err(|e| crate::error::Error::Channel(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))?;
        }
        Ok(packet)
    }

    fn send_others(&self, message_type: MessageType, payload: &[u8]) -> crate::error::Result<Packet> {
        let lamport_time = self.clock.tick();
        let packet = Packet::new(lamport_time, self.process_id, message_type, payload.to_vec());
        for peer in 0..self.n {
            if peer as ProcessId != self.process_id {
                self.senders[peer]
                    .send(packet.clone())
                    .map_err(|e| crate::error::Error::Channel(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))?;
            }
        }
        Ok(packet)
    }

    fn receive(&self) -> crate::error::Result<Packet> {
        let packet = self
            .receiver
            .lock()
            .expect("receiver mutex poisoned")
            .recv()
            .map_err(|e| crate::error::Error::Channel(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))?;
        self.clock.observe(packet.lamport_time);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_many_reaches_only_the_named_recipients() {
        let mut channels = InMemoryChannel::new_group(3);
        let c2 = channels.remove(2);
        let c1 = channels.remove(1);
        let c0 = channels.remove(0);

        c0.send_many(MessageType::MutexRequest, b"m", &[2]).unwrap();
        let packet = c2.receive().unwrap();
        assert_eq!(packet.source, 0);
        assert_eq!(packet.payload, b"m");
        assert!(c1.receiver.try_lock().unwrap().try_recv().is_err());
    }
}
