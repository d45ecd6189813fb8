//! Wire records and the integrity layer. One JSON-encoded message per
//! datagram.

use std::fmt;

use log::trace;
use serde::{Deserialize, Serialize};

/// Largest datagram either endpoint will read off the socket.
pub(crate) const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Kind {
    Connect = 0,
    Data = 1,
    Ack = 2,
}

impl From<Kind> for u8 {
    fn from(kind: Kind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for Kind {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Kind::Connect),
            1 => Ok(Kind::Data),
            2 => Ok(Kind::Ack),
            other => Err(format!("unknown message kind {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: Kind,
    pub conn_id: i32,
    pub seq_num: i32,
    /// Payload length in bytes. Authoritative: receivers truncate any excess
    /// payload bytes down to this before checking integrity.
    pub size: i32,
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn connect() -> Message {
        Message {
            kind: Kind::Connect,
            conn_id: 0,
            seq_num: 0,
            size: 0,
            checksum: 0,
            payload: Vec::new(),
        }
    }

    pub fn ack(conn_id: i32, seq_num: i32) -> Message {
        Message {
            kind: Kind::Ack,
            conn_id,
            seq_num,
            size: 0,
            checksum: 0,
            payload: Vec::new(),
        }
    }

    pub fn data(conn_id: i32, seq_num: i32, payload: Vec<u8>) -> Message {
        let size = payload.len() as i32;
        Message {
            kind: Kind::Data,
            conn_id,
            seq_num,
            size,
            checksum: checksum(conn_id, seq_num, size, &payload),
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }

    /// Integrity check. Connect and Ack are exempt. For Data the payload is
    /// truncated to the declared size first, then the checksum is recomputed
    /// over the truncated bytes; short payloads never pass.
    pub fn verify(&mut self) -> bool {
        if self.kind != Kind::Data {
            return true;
        }
        if self.size < 0 {
            return false;
        }
        let size = self.size as usize;
        if self.payload.len() > size {
            self.payload.truncate(size);
        }
        self.payload.len() >= size
            && checksum(self.conn_id, self.seq_num, self.size, &self.payload) == self.checksum
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Connect => write!(f, "[Connect {}]", self.conn_id),
            Kind::Ack => write!(f, "[Ack {} {}]", self.conn_id, self.seq_num),
            Kind::Data => write!(f, "[Data {} {} {}B]", self.conn_id, self.seq_num, self.size),
        }
    }
}

pub fn decode(bytes: &[u8]) -> Option<Message> {
    match serde_json::from_slice(bytes) {
        Ok(msg) => Some(msg),
        Err(err) => {
            trace!("undecodable datagram ({} bytes): {err}", bytes.len());
            None
        }
    }
}

/// 16-bit one's-complement sum over the header integers and the payload.
///
/// Every field contributes to a single 32-bit accumulator: integers as their
/// two 16-bit halves, the payload as big-endian 16-bit words with a trailing
/// odd byte occupying the high octet. Carries are folded back in until the
/// sum fits in 16 bits.
pub fn checksum(conn_id: i32, seq_num: i32, size: i32, payload: &[u8]) -> u16 {
    fn half_words(v: i32) -> u32 {
        let v = v as u32;
        (v >> 16) + (v & 0xffff)
    }

    let mut sum = half_words(conn_id) + half_words(seq_num) + half_words(size);
    let mut words = payload.chunks_exact(2);
    for pair in &mut words {
        sum += u32::from(pair[0]) << 8 | u32::from(pair[1]);
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    sum as u16
}
