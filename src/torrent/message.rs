//! Peer wire protocol messages (post-handshake).
//!
//! Every message is a 4-byte big-endian length prefix followed by that many
//! bytes; length `0` is a keep-alive. Otherwise the first payload byte is the
//! message id. See the BitTorrent peer protocol spec.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message payload too short for its id")]
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    /// A message id we don't recognize. The frame's length prefix already
    /// told the reader how many bytes to consume, so this is never fatal —
    /// callers simply ignore it.
    Unknown(u8),
}

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

impl Message {
    /// Serializes to the full framed form: 4-byte length prefix + payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::KeepAlive => return 0u32.to_be_bytes().to_vec(),
            Message::Choke => payload.push(ID_CHOKE),
            Message::Unchoke => payload.push(ID_UNCHOKE),
            Message::Interested => payload.push(ID_INTERESTED),
            Message::NotInterested => payload.push(ID_NOT_INTERESTED),
            Message::Have(index) => {
                payload.push(ID_HAVE);
                payload.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bits) => {
                payload.push(ID_BITFIELD);
                payload.extend_from_slice(bits);
            }
            Message::Request { index, begin, length } => {
                payload.push(ID_REQUEST);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, block } => {
                payload.push(ID_PIECE);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
            Message::Cancel { index, begin, length } => {
                payload.push(ID_CANCEL);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Port(port) => {
                payload.push(ID_PORT);
                payload.extend_from_slice(&port.to_be_bytes());
            }
            Message::Unknown(id) => payload.push(*id),
        }
        let mut framed = (payload.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&payload);
        framed
    }

    /// Parses a message *payload* (i.e. the bytes after the length prefix,
    /// which the caller has already read in full). An empty payload is a
    /// programmer error here; the keep-alive case (length 0) is handled by
    /// the caller before this is reached.
    pub fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let (&id, rest) = payload.split_first().ok_or(MessageError::Truncated)?;
        fn u32_at(bytes: &[u8], offset: usize) -> Result<u32, MessageError> {
            bytes
                .get(offset..offset + 4)
                .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
                .ok_or(MessageError::Truncated)
        }

        Ok(match id {
            ID_CHOKE => Message::Choke,
            ID_UNCHOKE => Message::Unchoke,
            ID_INTERESTED => Message::Interested,
            ID_NOT_INTERESTED => Message::NotInterested,
            ID_HAVE => Message::Have(u32_at(rest, 0)?),
            ID_BITFIELD => Message::Bitfield(rest.to_vec()),
            ID_REQUEST => Message::Request {
                index: u32_at(rest, 0)?,
                begin: u32_at(rest, 4)?,
                length: u32_at(rest, 8)?,
            },
            ID_PIECE => {
                if rest.len() < 8 {
                    return Err(MessageError::Truncated);
                }
                Message::Piece {
                    index: u32_at(rest, 0)?,
                    begin: u32_at(rest, 4)?,
                    block: rest[8..].to_vec(),
                }
            }
            ID_CANCEL => Message::Cancel {
                index: u32_at(rest, 0)?,
                begin: u32_at(rest, 4)?,
                length: u32_at(rest, 8)?,
            },
            ID_PORT => {
                let port = rest
                    .get(0..2)
                    .map(|b| u16::from_be_bytes(b.try_into().unwrap()))
                    .ok_or(MessageError::Truncated)?;
                Message::Port(port)
            }
            other => Message::Unknown(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fixed_size_messages() {
        let cases = vec![
            (Message::Choke, vec![0, 0, 0, 1, 0]),
            (Message::Unchoke, vec![0, 0, 0, 1, 1]),
            (Message::Interested, vec![0, 0, 0, 1, 2]),
            (Message::NotInterested, vec![0, 0, 0, 1, 3]),
            (Message::Have(42), vec![0, 0, 0, 5, 4, 0, 0, 0, 42]),
            (
                Message::Bitfield(vec![1, 2, 3]),
                vec![0, 0, 0, 4, 5, 1, 2, 3],
            ),
            (
                Message::Request {
                    index: 1,
                    begin: 2,
                    length: 16384,
                },
                vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 64, 0],
            ),
        ];
        for (message, expected) in cases {
            assert_eq!(message.to_bytes(), expected);
            assert_eq!(Message::from_payload(&expected[4..]).unwrap(), message);
        }
    }

    #[test]
    fn keep_alive_has_no_payload() {
        assert_eq!(Message::KeepAlive.to_bytes(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn piece_message_round_trips_with_block_bytes() {
        let msg = Message::Piece {
            index: 3,
            begin: 16384,
            block: vec![9u8; 100],
        };
        let bytes = msg.to_bytes();
        assert_eq!(Message::from_payload(&bytes[4..]).unwrap(), msg);
    }

    #[test]
    fn unknown_ids_do_not_error() {
        assert_eq!(Message::from_payload(&[200, 1, 2]).unwrap(), Message::Unknown(200));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        assert!(Message::from_payload(&[ID_HAVE, 0, 0]).is_err());
        assert!(Message::from_payload(&[]).is_err());
    }
}
