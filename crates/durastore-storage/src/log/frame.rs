//! Length and checksum framing shared by transaction log entries and
//! checkpoint records.
//!
//! Layout: `[u32 total length][u32 crc32][u8 kind][body]`, little endian.
//! The crc covers the kind byte and the body. A zero length word marks the
//! end of written data in a pre-allocated or freshly rotated file.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Size of the frame header (length + crc + kind).
pub const FRAME_HEADER_SIZE: usize = 4 + 4 + 1;

/// Upper bound for a single frame. Anything larger is treated as garbage.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Outcome of reading one frame from a byte stream.
#[derive(Debug)]
pub enum Frame {
    /// A complete frame with a valid checksum.
    Record {
        /// Kind byte.
        kind: u8,
        /// Frame body.
        body: Vec<u8>,
        /// Total encoded length including the header.
        len: u64,
    },
    /// Clean end of written data.
    End,
    /// The stream ended in the middle of a frame.
    Truncated(String),
    /// The frame is structurally invalid or its checksum does not match.
    Malformed(String),
}

/// Encode one frame.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_frame(kind: u8, body: &[u8]) -> Vec<u8> {
    let total_len = FRAME_HEADER_SIZE + body.len();
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(body);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(total_len);
    // Writes into a Vec cannot fail.
    let _ = out.write_u32::<LittleEndian>(total_len as u32);
    let _ = out.write_u32::<LittleEndian>(crc);
    out.push(kind);
    out.extend_from_slice(body);
    out
}

/// Read one frame.
///
/// # Errors
///
/// Returns an error only for I/O failures other than hitting end of file.
/// Torn and corrupt frames are reported as [`Frame::Truncated`] and
/// [`Frame::Malformed`].
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    let n = read_full(reader, &mut len_buf)?;
    if n == 0 {
        return Ok(Frame::End);
    }
    if n < len_buf.len() {
        return Ok(Frame::Truncated(format!("only {n} bytes of frame length")));
    }

    let total_len = LittleEndian::read_u32(&len_buf) as usize;
    if total_len == 0 {
        return Ok(Frame::End);
    }
    if total_len < FRAME_HEADER_SIZE || total_len > MAX_FRAME_SIZE {
        return Ok(Frame::Malformed(format!("invalid frame length {total_len}")));
    }

    let mut rest = vec![0u8; total_len - 4];
    let n = read_full(reader, &mut rest)?;
    if n < rest.len() {
        return Ok(Frame::Truncated(format!(
            "expected {total_len} bytes, found {}",
            n + 4
        )));
    }

    let stored_crc = LittleEndian::read_u32(&rest[..4]);
    let computed_crc = crc32fast::hash(&rest[4..]);
    if stored_crc != computed_crc {
        return Ok(Frame::Malformed(format!(
            "crc mismatch: expected {stored_crc:#x}, computed {computed_crc:#x}"
        )));
    }

    let kind = rest[4];
    let body = rest.split_off(5);
    Ok(Frame::Record {
        kind,
        body,
        len: total_len as u64,
    })
}

/// Fill `buf` as far as the stream allows, returning the byte count.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_encoded_frame() {
        let bytes = encode_frame(7, b"payload");
        let mut cursor = Cursor::new(bytes.clone());
        match read_frame(&mut cursor).unwrap() {
            Frame::Record { kind, body, len } => {
                assert_eq!(kind, 7);
                assert_eq!(body, b"payload");
                assert_eq!(len, bytes.len() as u64);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(matches!(read_frame(&mut cursor).unwrap(), Frame::End));
    }

    #[test]
    fn test_zero_length_is_end() {
        let mut cursor = Cursor::new(vec![0u8; 32]);
        assert!(matches!(read_frame(&mut cursor).unwrap(), Frame::End));
    }

    #[test]
    fn test_torn_frame_is_truncated() {
        let mut bytes = encode_frame(1, b"some body bytes");
        bytes.truncate(bytes.len() - 3);
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_frame(&mut cursor).unwrap(),
            Frame::Truncated(_)
        ));

        let mut cursor = Cursor::new(vec![12u8, 0]);
        assert!(matches!(
            read_frame(&mut cursor).unwrap(),
            Frame::Truncated(_)
        ));
    }

    #[test]
    fn test_flipped_bit_is_malformed() {
        let mut bytes = encode_frame(1, b"some body bytes");
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        let mut cursor = Cursor::new(bytes);
        match read_frame(&mut cursor).unwrap() {
            Frame::Malformed(reason) => assert!(reason.contains("crc mismatch")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_short_length_is_malformed() {
        let mut cursor = Cursor::new(vec![3u8, 0, 0, 0, 1, 2, 3]);
        assert!(matches!(
            read_frame(&mut cursor).unwrap(),
            Frame::Malformed(_)
        ));
    }
}
