use byteorder::{BigEndian, ByteOrder};
use std::io;
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One frame of a regular connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Zero length keep-alive, used for both ticks and tocks.
    Tick,
    Message(Bytes),
}

/// `u32` length-prefixed frames, bounded by `max_frame_len`.
#[derive(Debug, Clone)]
pub struct DistCodec {
    max_frame_len: usize,
}

impl DistCodec {
    pub fn new(max_frame_len: usize) -> Self {
        DistCodec { max_frame_len }
    }
}

impl Decoder for DistCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = BigEndian::read_u32(&src[..4]) as usize;
        if len > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit of {}", len, self.max_frame_len),
            ));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        if len == 0 {
            return Ok(Some(Frame::Tick));
        }
        Ok(Some(Frame::Message(src.split_to(len).freeze())))
    }
}

impl Encoder<Frame> for DistCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        match frame {
            Frame::Tick => dst.put_u32(0),
            Frame::Message(payload) => {
                if payload.len() > self.max_frame_len {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("message of {} bytes exceeds limit of {}", payload.len(), self.max_frame_len),
                    ));
                }
                dst.reserve(4 + payload.len());
                dst.put_u32(payload.len() as u32);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_whole_frame() {
        let mut codec = DistCodec::new(1024);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 3, 1, 2][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.put_u8(3);
        buf.put_u32(0);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Message(Bytes::from_static(&[1, 2, 3])))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Tick));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_is_an_error() {
        let mut codec = DistCodec::new(8);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 9][..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
        assert!(codec
            .encode(Frame::Message(Bytes::from(vec![0; 9])), &mut BytesMut::new())
            .is_err());
    }

    #[test]
    fn test_encode() {
        let mut codec = DistCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(Frame::Tick, &mut buf).unwrap();
        codec
            .encode(Frame::Message(Bytes::from_static(b"hi")), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0, 0, 0, 0, 2, b'h', b'i']);
    }
}
