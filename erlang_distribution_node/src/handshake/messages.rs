//! Handshake wire messages, each carried in a `u16` length-prefixed frame.
//!
//! Version 5 messages end in a name that runs to the end of the frame, so
//! only their fixed header goes through deku.

use deku::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HandshakeError;

pub const TAG_NAME_V5: u8 = b'n';
pub const TAG_NAME_V6: u8 = b'N';
pub const TAG_STATUS: u8 = b's';
pub const TAG_REPLY: u8 = b'r';
pub const TAG_ACK: u8 = b'a';

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"n")]
struct SendNameV5 {
    version: u16,
    flags: u32,
}

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"N")]
struct SendNameV6 {
    flags: u64,
    creation: u32,
    name: PString,
}

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"n")]
struct ChallengeV5 {
    version: u16,
    flags: u32,
    challenge: u32,
}

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"N")]
struct ChallengeV6 {
    flags: u64,
    challenge: u32,
    creation: u32,
    name: PString,
}

#[derive(Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"r")]
pub struct ChallengeReply {
    pub challenge: u32,
    pub digest: [u8; 16],
}

#[derive(Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"a")]
pub struct ChallengeAck {
    pub digest: [u8; 16],
}

#[derive(Debug, Clone, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
struct PString {
    len: u16,
    #[deku(count = "len")]
    data: Vec<u8>,
}

impl PString {
    fn new(string: &str) -> Self {
        PString {
            len: string.len() as u16,
            data: string.as_bytes().to_vec(),
        }
    }

    fn into_string(self) -> Result<String, HandshakeError> {
        String::from_utf8(self.data).map_err(|_| HandshakeError::Malformed("node name is not utf-8".into()))
    }
}

fn utf8(bytes: &[u8]) -> Result<String, HandshakeError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| HandshakeError::Malformed("node name is not utf-8".into()))
}

/// Which generation of the handshake a message was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    /// `'n'` messages, 32 bit flags
    V5,
    /// `'N'` messages, 64 bit flags and a creation
    V6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name {
    pub form: Form,
    pub flags: u64,
    /// Zero in the v5 form.
    pub creation: u32,
    pub name: String,
}

impl Name {
    pub fn decode(data: &[u8]) -> Result<Self, HandshakeError> {
        match data.first() {
            Some(&TAG_NAME_V5) => {
                let ((rest, _), header) = SendNameV5::from_bytes((data, 0))?;
                Ok(Name {
                    form: Form::V5,
                    flags: header.flags as u64,
                    creation: 0,
                    name: utf8(rest)?,
                })
            }
            Some(&TAG_NAME_V6) => {
                let (_, msg) = SendNameV6::from_bytes((data, 0))?;
                Ok(Name {
                    form: Form::V6,
                    flags: msg.flags,
                    creation: msg.creation,
                    name: msg.name.into_string()?,
                })
            }
            other => Err(HandshakeError::UnexpectedMessage {
                state: "NameReceived",
                tag: other.copied(),
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HandshakeError> {
        match self.form {
            Form::V5 => {
                let mut out = SendNameV5 {
                    version: 5,
                    flags: self.flags as u32,
                }
                .to_bytes()?;
                out.extend_from_slice(self.name.as_bytes());
                Ok(out)
            }
            Form::V6 => Ok(SendNameV6 {
                flags: self.flags,
                creation: self.creation,
                name: PString::new(&self.name),
            }
            .to_bytes()?),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub form: Form,
    pub flags: u64,
    pub challenge: u32,
    /// Zero in the v5 form.
    pub creation: u32,
    pub name: String,
}

impl Challenge {
    pub fn decode(data: &[u8]) -> Result<Self, HandshakeError> {
        match data.first() {
            Some(&TAG_NAME_V5) => {
                let ((rest, _), header) = ChallengeV5::from_bytes((data, 0))?;
                Ok(Challenge {
                    form: Form::V5,
                    flags: header.flags as u64,
                    challenge: header.challenge,
                    creation: 0,
                    name: utf8(rest)?,
                })
            }
            Some(&TAG_NAME_V6) => {
                let (_, msg) = ChallengeV6::from_bytes((data, 0))?;
                Ok(Challenge {
                    form: Form::V6,
                    flags: msg.flags,
                    challenge: msg.challenge,
                    creation: msg.creation,
                    name: msg.name.into_string()?,
                })
            }
            other => Err(HandshakeError::UnexpectedMessage {
                state: "ChallengeReceived",
                tag: other.copied(),
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HandshakeError> {
        match self.form {
            Form::V5 => {
                let mut out = ChallengeV5 {
                    version: 5,
                    flags: self.flags as u32,
                    challenge: self.challenge,
                }
                .to_bytes()?;
                out.extend_from_slice(self.name.as_bytes());
                Ok(out)
            }
            Form::V6 => Ok(ChallengeV6 {
                flags: self.flags,
                challenge: self.challenge,
                creation: self.creation,
                name: PString::new(&self.name),
            }
            .to_bytes()?),
        }
    }
}

pub fn encode_status(status: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(status.len() + 1);
    out.push(TAG_STATUS);
    out.extend_from_slice(status.as_bytes());
    out
}

pub fn decode_status(data: &[u8]) -> Result<String, HandshakeError> {
    match data.split_first() {
        Some((&TAG_STATUS, text)) => Ok(String::from_utf8_lossy(text).into_owned()),
        other => Err(HandshakeError::UnexpectedMessage {
            state: "StatusReceived",
            tag: other.map(|(tag, _)| *tag),
        }),
    }
}

pub fn decode_reply(data: &[u8]) -> Result<ChallengeReply, HandshakeError> {
    if data.first() != Some(&TAG_REPLY) {
        return Err(HandshakeError::UnexpectedMessage {
            state: "ReplyReceived",
            tag: data.first().copied(),
        });
    }
    let (_, reply) = ChallengeReply::from_bytes((data, 0))?;
    Ok(reply)
}

pub fn decode_ack(data: &[u8]) -> Result<ChallengeAck, HandshakeError> {
    if data.first() != Some(&TAG_ACK) {
        return Err(HandshakeError::UnexpectedMessage {
            state: "AckReceived",
            tag: data.first().copied(),
        });
    }
    let (_, ack) = ChallengeAck::from_bytes((data, 0))?;
    Ok(ack)
}

pub async fn read_framed(mut socket: impl AsyncRead + Unpin) -> std::io::Result<Vec<u8>> {
    let len = socket.read_u16().await?;
    let mut data = vec![0; len as usize];
    socket.read_exact(&mut data).await?;
    Ok(data)
}

pub async fn write_framed(mut socket: impl AsyncWrite + Unpin, data: &[u8]) -> std::io::Result<()> {
    socket.write_u16(data.len() as u16).await?;
    socket.write_all(data).await?;
    socket.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_v5_layout() {
        let name = Name {
            form: Form::V5,
            flags: 0x0000_0001_0000_0004,
            creation: 77,
            name: "a@b".into(),
        };
        let bytes = name.encode().unwrap();
        assert_eq!(bytes, vec![b'n', 0, 5, 0, 0, 0, 4, b'a', b'@', b'b']);

        let back = Name::decode(&bytes).unwrap();
        assert_eq!(back.flags, 4);
        assert_eq!(back.creation, 0);
        assert_eq!(back.name, "a@b");
    }

    #[test]
    fn test_name_v6_layout() {
        let name = Name {
            form: Form::V6,
            flags: 1 << 34,
            creation: 0x01020304,
            name: "a@b".into(),
        };
        let bytes = name.encode().unwrap();
        assert_eq!(
            bytes,
            vec![b'N', 0, 0, 0, 4, 0, 0, 0, 0, 1, 2, 3, 4, 0, 3, b'a', b'@', b'b']
        );
        assert_eq!(Name::decode(&bytes).unwrap(), name);
    }

    #[test]
    fn test_challenge_forms() {
        let v5 = Challenge {
            form: Form::V5,
            flags: 4,
            challenge: 0xdeadbeef,
            creation: 0,
            name: "x@y".into(),
        };
        let bytes = v5.encode().unwrap();
        assert_eq!(&bytes[..11], &[b'n', 0, 5, 0, 0, 0, 4, 0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(Challenge::decode(&bytes).unwrap(), v5);

        let v6 = Challenge {
            form: Form::V6,
            creation: 9,
            ..v5
        };
        assert_eq!(Challenge::decode(&v6.encode().unwrap()).unwrap(), v6);
    }

    #[test]
    fn test_reply_and_ack() {
        let reply = ChallengeReply {
            challenge: 1,
            digest: [7; 16],
        };
        let bytes = reply.to_bytes().unwrap();
        assert_eq!(bytes.len(), 21);
        assert_eq!(decode_reply(&bytes).unwrap(), reply);

        let ack = ChallengeAck { digest: [3; 16] };
        assert_eq!(decode_ack(&ack.to_bytes().unwrap()).unwrap(), ack);
        assert!(matches!(
            decode_ack(&bytes),
            Err(HandshakeError::UnexpectedMessage { tag: Some(b'r'), .. })
        ));
    }

    #[test]
    fn test_status() {
        assert_eq!(decode_status(&encode_status("ok")).unwrap(), "ok");
        assert!(decode_status(b"xok").is_err());
        assert!(decode_status(b"").is_err());
    }

    #[test]
    fn test_truncated_message_is_malformed() {
        assert!(matches!(
            Name::decode(&[b'N', 0, 0]),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_framing() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_framed(&mut a, b"hello").await.unwrap();
        assert_eq!(read_framed(&mut b).await.unwrap(), b"hello");
    }
}
