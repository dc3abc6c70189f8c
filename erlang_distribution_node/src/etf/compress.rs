//! zlib helpers for `COMPRESSED` terms.

use std::io::{Read, Write};

use flate2::bufread::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::DecodeError;

/// Deflates `data` into a zlib stream.
pub(crate) fn deflate(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflates the zlib stream at the start of `input`, which must produce
/// exactly `expected` bytes. Returns the data and the number of input bytes
/// the stream occupied.
pub(crate) fn inflate(input: &[u8], expected: usize) -> Result<(Vec<u8>, usize), DecodeError> {
    let mut decoder = ZlibDecoder::new(input);
    let mut out = Vec::with_capacity(expected.min(1 << 20));
    (&mut decoder)
        .take(expected as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::invalid("compressed term", e.to_string()))?;
    if out.len() != expected {
        return Err(DecodeError::CompressedSize {
            expected,
            actual: out.len(),
        });
    }
    Ok((out, decoder.total_in() as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inflate_reports_consumed_input() {
        let data = vec![7u8; 300];
        let mut stream = deflate(&data, 6).unwrap();
        let stream_len = stream.len();
        stream.extend_from_slice(b"tail");

        let (out, used) = inflate(&stream, 300).unwrap();
        assert_eq!(out, data);
        assert_eq!(used, stream_len);
    }

    #[test]
    fn test_inflate_rejects_wrong_size() {
        let stream = deflate(b"abcdef", 1).unwrap();
        assert_eq!(
            inflate(&stream, 4),
            Err(DecodeError::CompressedSize {
                expected: 4,
                actual: 5
            })
        );
        assert!(matches!(
            inflate(&stream, 10),
            Err(DecodeError::CompressedSize { actual: 6, .. })
        ));
    }

    #[test]
    fn test_inflate_rejects_garbage() {
        assert!(matches!(
            inflate(&[1, 2, 3, 4], 3),
            Err(DecodeError::Invalid { .. })
        ));
    }
}
