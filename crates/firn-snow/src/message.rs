//! Consensus wire messages.
//!
//! Every message is an op byte followed by its fields in the shared wire
//! shapes: big-endian fixed-width integers, `len:u32 ‖ bytes` arrays and
//! `count:u32 ‖ elements` sequences.

use firn_codec::{PackError, Packer, UnpackError, Unpacker};
use firn_ids::{Id, ID_LEN};

/// Message discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Get = 0x01,
    Put = 0x02,
    GetAncestors = 0x03,
    Ancestors = 0x04,
    PullQuery = 0x05,
    PushQuery = 0x06,
    Chits = 0x07,
    AppRequest = 0x08,
    AppResponse = 0x09,
    AppRequestFailed = 0x0a,
    AppGossip = 0x0b,
}

impl Op {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Op::Get),
            0x02 => Some(Op::Put),
            0x03 => Some(Op::GetAncestors),
            0x04 => Some(Op::Ancestors),
            0x05 => Some(Op::PullQuery),
            0x06 => Some(Op::PushQuery),
            0x07 => Some(Op::Chits),
            0x08 => Some(Op::AppRequest),
            0x09 => Some(Op::AppResponse),
            0x0a => Some(Op::AppRequestFailed),
            0x0b => Some(Op::AppGossip),
            _ => None,
        }
    }
}

/// A consensus-layer message, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Fetch a vertex by id.
    Get {
        chain_id: Id,
        request_id: u32,
        vertex_id: Id,
    },
    /// A fetched vertex.
    Put {
        chain_id: Id,
        request_id: u32,
        vertex: Vec<u8>,
    },
    /// Fetch a vertex and its recent ancestry.
    GetAncestors {
        chain_id: Id,
        request_id: u32,
        vertex_id: Id,
    },
    /// A batch of ancestor vertices, child-first.
    Ancestors {
        chain_id: Id,
        request_id: u32,
        vertices: Vec<Vec<u8>>,
    },
    /// Ask a peer's preference for a vertex it should already have.
    PullQuery {
        chain_id: Id,
        request_id: u32,
        vertex_id: Id,
    },
    /// Ask a peer's preference, carrying the vertex to save a round trip.
    PushQuery {
        chain_id: Id,
        request_id: u32,
        vertex: Vec<u8>,
    },
    /// A poll response naming the peer's preferred vertices.
    Chits {
        chain_id: Id,
        request_id: u32,
        preferred: Vec<Id>,
    },
    /// VM-level request passthrough.
    AppRequest {
        chain_id: Id,
        request_id: u32,
        payload: Vec<u8>,
    },
    /// VM-level response passthrough.
    AppResponse {
        chain_id: Id,
        request_id: u32,
        payload: Vec<u8>,
    },
    /// The peer gave up on an AppRequest.
    AppRequestFailed { chain_id: Id, request_id: u32 },
    /// VM-level gossip passthrough.
    AppGossip { chain_id: Id, payload: Vec<u8> },
}

impl Message {
    #[must_use]
    pub fn op(&self) -> Op {
        match self {
            Message::Get { .. } => Op::Get,
            Message::Put { .. } => Op::Put,
            Message::GetAncestors { .. } => Op::GetAncestors,
            Message::Ancestors { .. } => Op::Ancestors,
            Message::PullQuery { .. } => Op::PullQuery,
            Message::PushQuery { .. } => Op::PushQuery,
            Message::Chits { .. } => Op::Chits,
            Message::AppRequest { .. } => Op::AppRequest,
            Message::AppResponse { .. } => Op::AppResponse,
            Message::AppRequestFailed { .. } => Op::AppRequestFailed,
            Message::AppGossip { .. } => Op::AppGossip,
        }
    }

    #[must_use]
    pub fn chain_id(&self) -> Id {
        match self {
            Message::Get { chain_id, .. }
            | Message::Put { chain_id, .. }
            | Message::GetAncestors { chain_id, .. }
            | Message::Ancestors { chain_id, .. }
            | Message::PullQuery { chain_id, .. }
            | Message::PushQuery { chain_id, .. }
            | Message::Chits { chain_id, .. }
            | Message::AppRequest { chain_id, .. }
            | Message::AppResponse { chain_id, .. }
            | Message::AppRequestFailed { chain_id, .. }
            | Message::AppGossip { chain_id, .. } => *chain_id,
        }
    }

    /// Serializes to the wire form.
    pub fn pack(&self) -> Result<Vec<u8>, PackError> {
        let mut p = Packer::new();
        p.pack_u8(self.op() as u8);
        p.pack_fixed(self.chain_id().as_bytes());
        match self {
            Message::Get {
                request_id,
                vertex_id,
                ..
            }
            | Message::GetAncestors {
                request_id,
                vertex_id,
                ..
            }
            | Message::PullQuery {
                request_id,
                vertex_id,
                ..
            } => {
                p.pack_u32(*request_id);
                p.pack_fixed(vertex_id.as_bytes());
            }
            Message::Put {
                request_id, vertex, ..
            }
            | Message::PushQuery {
                request_id, vertex, ..
            } => {
                p.pack_u32(*request_id);
                p.pack_bytes(vertex);
            }
            Message::Ancestors {
                request_id,
                vertices,
                ..
            } => {
                p.pack_u32(*request_id);
                p.pack_seq(vertices, |p, v| p.pack_bytes(v));
            }
            Message::Chits {
                request_id,
                preferred,
                ..
            } => {
                p.pack_u32(*request_id);
                p.pack_seq(preferred, |p, id| p.pack_fixed(id.as_bytes()));
            }
            Message::AppRequest {
                request_id, payload, ..
            }
            | Message::AppResponse {
                request_id, payload, ..
            } => {
                p.pack_u32(*request_id);
                p.pack_bytes(payload);
            }
            Message::AppRequestFailed { request_id, .. } => {
                p.pack_u32(*request_id);
            }
            Message::AppGossip { payload, .. } => {
                p.pack_bytes(payload);
            }
        }
        p.finish()
    }

    /// Parses the wire form, requiring every byte to be consumed.
    pub fn parse(bytes: &[u8]) -> Result<Self, UnpackError> {
        let mut u = Unpacker::new(bytes);
        let op_byte = u.unpack_u8()?;
        let op = Op::from_byte(op_byte).ok_or(UnpackError::BadTag(op_byte))?;
        let chain_id = unpack_id(&mut u)?;

        let message = match op {
            Op::Get => Message::Get {
                chain_id,
                request_id: u.unpack_u32()?,
                vertex_id: unpack_id(&mut u)?,
            },
            Op::GetAncestors => Message::GetAncestors {
                chain_id,
                request_id: u.unpack_u32()?,
                vertex_id: unpack_id(&mut u)?,
            },
            Op::PullQuery => Message::PullQuery {
                chain_id,
                request_id: u.unpack_u32()?,
                vertex_id: unpack_id(&mut u)?,
            },
            Op::Put => Message::Put {
                chain_id,
                request_id: u.unpack_u32()?,
                vertex: u.unpack_bytes()?,
            },
            Op::PushQuery => Message::PushQuery {
                chain_id,
                request_id: u.unpack_u32()?,
                vertex: u.unpack_bytes()?,
            },
            Op::Ancestors => Message::Ancestors {
                chain_id,
                request_id: u.unpack_u32()?,
                vertices: u.unpack_seq(|u| u.unpack_bytes())?,
            },
            Op::Chits => Message::Chits {
                chain_id,
                request_id: u.unpack_u32()?,
                preferred: u.unpack_seq(unpack_id)?,
            },
            Op::AppRequest => Message::AppRequest {
                chain_id,
                request_id: u.unpack_u32()?,
                payload: u.unpack_bytes()?,
            },
            Op::AppResponse => Message::AppResponse {
                chain_id,
                request_id: u.unpack_u32()?,
                payload: u.unpack_bytes()?,
            },
            Op::AppRequestFailed => Message::AppRequestFailed {
                chain_id,
                request_id: u.unpack_u32()?,
            },
            Op::AppGossip => Message::AppGossip {
                chain_id,
                payload: u.unpack_bytes()?,
            },
        };
        u.finish()?;
        Ok(message)
    }
}

fn unpack_id(u: &mut Unpacker<'_>) -> Result<Id, UnpackError> {
    let raw = u.unpack_fixed(ID_LEN)?;
    let mut arr = [0u8; ID_LEN];
    arr.copy_from_slice(raw);
    Ok(Id::from_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> Id {
        Id::EMPTY.prefixed(n)
    }

    #[test]
    fn query_roundtrips_are_byte_exact() {
        let messages = vec![
            Message::PullQuery {
                chain_id: id(1),
                request_id: 7,
                vertex_id: id(2),
            },
            Message::PushQuery {
                chain_id: id(1),
                request_id: 8,
                vertex: vec![1, 2, 3],
            },
            Message::Chits {
                chain_id: id(1),
                request_id: 8,
                preferred: vec![id(2), id(3)],
            },
            Message::Get {
                chain_id: id(1),
                request_id: 9,
                vertex_id: id(4),
            },
            Message::Put {
                chain_id: id(1),
                request_id: 9,
                vertex: vec![0xaa; 100],
            },
            Message::GetAncestors {
                chain_id: id(1),
                request_id: 10,
                vertex_id: id(5),
            },
            Message::Ancestors {
                chain_id: id(1),
                request_id: 10,
                vertices: vec![vec![1], vec![2, 3], Vec::new()],
            },
            Message::AppRequest {
                chain_id: id(1),
                request_id: 11,
                payload: b"req".to_vec(),
            },
            Message::AppResponse {
                chain_id: id(1),
                request_id: 11,
                payload: b"resp".to_vec(),
            },
            Message::AppRequestFailed {
                chain_id: id(1),
                request_id: 11,
            },
            Message::AppGossip {
                chain_id: id(1),
                payload: b"gossip".to_vec(),
            },
        ];

        for message in messages {
            let bytes = message.pack().unwrap();
            let parsed = Message::parse(&bytes).unwrap();
            assert_eq!(parsed, message);
            assert_eq!(parsed.pack().unwrap(), bytes);
        }
    }

    #[test]
    fn unknown_op_is_rejected() {
        let mut bytes = Message::Get {
            chain_id: id(1),
            request_id: 0,
            vertex_id: id(2),
        }
        .pack()
        .unwrap();
        bytes[0] = 0x7f;
        assert!(Message::parse(&bytes).is_err());
    }

    #[test]
    fn truncation_is_rejected() {
        let bytes = Message::Chits {
            chain_id: id(1),
            request_id: 8,
            preferred: vec![id(2)],
        }
        .pack()
        .unwrap();
        assert!(Message::parse(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = Message::AppRequestFailed {
            chain_id: id(1),
            request_id: 1,
        }
        .pack()
        .unwrap();
        bytes.push(0);
        assert!(Message::parse(&bytes).is_err());
    }
}
