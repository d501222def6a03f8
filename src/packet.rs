//! The wire packet and its binary framing.
//!
//! A frame is a fixed header followed by an optional payload:
//!
//! ```text
//! lamport_time: u64 | source: i32 | message_type: u8 | payload_len: u32 | payload
//! ```
//!
//! Encoded with the machine's native endianness -- this is a homogeneous
//! cluster design, not a cross-architecture wire format.

use std::io::{self, Read, Write};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::clock::{LamportTime, ProcessId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MutexRequest = 0,
    MutexAgreement = 1,
    CondWait = 2,
    CondWaitEnd = 3,
    CondWaitEndConfirm = 4,
    CondNotify = 5,
    Sync = 6,
}

impl MessageType {
    fn from_u8(b: u8) -> io::Result<Self> {
        Ok(match b {
            0 => Self::MutexRequest,
            1 => Self::MutexAgreement,
            2 => Self::CondWait,
            3 => Self::CondWaitEnd,
            4 => Self::CondWaitEndConfirm,
            5 => Self::CondNotify,
            6 => Self::Sync,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown message type byte {other}"),
                ))
            }
        })
    }
}

/// A single message in flight between two peers.
///
/// Two packets are considered equal by `(source, message_type, payload)`;
/// [`LamportTime`] is deliberately excluded so that dedup sets (e.g. a
/// mutex's deferred-request set) compare on identity of the request, not on
/// when it happened to be observed.
#[derive(Debug, Clone)]
pub struct Packet {
    pub lamport_time: LamportTime,
    pub source: ProcessId,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.message_type == other.message_type
            && self.payload == other.payload
    }
}
impl Eq for Packet {}

impl Packet {
    pub fn new(
        lamport_time: LamportTime,
        source: ProcessId,
        message_type: MessageType,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            lamport_time,
            source,
            message_type,
            payload: payload.into(),
        }
    }

    /// The total order used to break ties between concurrent requests:
    /// `(lamport_time, source)` lexicographically.
    pub fn happens_before(&self, other: &Self) -> bool {
        (self.lamport_time, self.source) < (other.lamport_time, other.source)
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u64::<NativeEndian>(self.lamport_time)?;
        w.write_i32::<NativeEndian>(self.source)?;
        w.write_u8(self.message_type as u8)?;
        w.write_u32::<NativeEndian>(self.payload.len() as u32)?;
        w.write_all(&self.payload)?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut r: R) -> io::Result<Self> {
        let lamport_time = r.read_u64::<NativeEndian>()?;
        let source = r.read_i32::<NativeEndian>()?;
        let message_type = MessageType::from_u8(r.read_u8()?)?;
        let len = r.read_u32::<NativeEndian>()? as usize;
        let mut payload = vec![0u8; len];
        if len > 0 {
            r.read_exact(&mut payload)?;
        }
        Ok(Self {
            lamport_time,
            source,
            message_type,
            payload,
        })
    }
}

/// Frame a `SYNC` payload: a single length-prefixed name followed by the
/// opaque serialized monitor state.
pub fn frame_sync_payload(name: &str, state: &[u8]) -> Vec<u8> {
    let name_bytes = name.as_bytes();
    debug_assert!(name_bytes.len() <= u8::MAX as usize);
    let mut buf = Vec::with_capacity(1 + name_bytes.len() + state.len());
    buf.push(name_bytes.len() as u8);
    buf.extend_from_slice(name_bytes);
    buf.extend_from_slice(state);
    buf
}

/// The inverse of [`frame_sync_payload`].
pub fn unframe_sync_payload(payload: &[u8]) -> io::Result<(&str, &[u8])> {
    let &len = payload
        .first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "empty SYNC payload"))?;
    let len = len as usize;
    let name_bytes = payload
        .get(1..1 + len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated SYNC name"))?;
    let name = std::str::from_utf8(name_bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let state = &payload[1 + len..];
    Ok((name, state))
}
