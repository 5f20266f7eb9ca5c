//! Decoding of the container runtime's multiplexed log stream.
//!
//! When a container runs without a TTY, its log endpoint returns stdout and
//! stderr interleaved on one byte stream. Each chunk is prefixed by a fixed
//! 8 byte header:
//!
//! ```text
//! +------+------+------+------+------+------+------+------+
//! | kind |   reserved (3)     |   payload length (u32 BE) |
//! +------+------+------+------+------+------+------+------+
//! ```
//!
//! followed by exactly `length` payload bytes. A buffer may end in the middle
//! of a header or a payload (the runtime was asked for a tail, or the
//! connection dropped); such trailing partial frames are dropped silently.

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// Which output stream a frame was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    /// Any kind byte the runtime may add in the future
    Unknown(u8),
}

impl From<u8> for StreamKind {
    fn from(byte: u8) -> Self {
        match byte {
            0 => StreamKind::Stdin,
            1 => StreamKind::Stdout,
            2 => StreamKind::Stderr,
            other => StreamKind::Unknown(other),
        }
    }
}

/// One complete frame, borrowing its payload from the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFrame<'a> {
    pub kind: StreamKind,
    pub payload: &'a [u8],
}

impl LogFrame<'_> {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Iterator over the complete frames of a buffer.
///
/// Yields `None` as soon as the remaining bytes cannot hold a full header or
/// the payload the header announces.
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Frames<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes consumed by the frames yielded so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = LogFrame<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buf[self.pos..];
        if rest.len() < FRAME_HEADER_LEN {
            return None;
        }

        let kind = StreamKind::from(rest[0]);
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;

        let body = &rest[FRAME_HEADER_LEN..];
        if body.len() < len {
            return None;
        }

        self.pos += FRAME_HEADER_LEN + len;
        Some(LogFrame {
            kind,
            payload: &body[..len],
        })
    }
}

/// Decode every complete frame in `buf`, in order.
pub fn decode_frames(buf: &[u8]) -> Vec<LogFrame<'_>> {
    Frames::new(buf).collect()
}

/// Concatenate the payloads of every complete frame and decode them as text.
///
/// Payload bytes are joined before UTF-8 decoding so a character split
/// across two frames survives. Invalid sequences are replaced, never fatal.
pub fn decode_text(buf: &[u8]) -> String {
    let mut out = Vec::with_capacity(buf.len());
    for frame in Frames::new(buf) {
        out.extend_from_slice(frame.payload);
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Encode a single frame. The inverse of [`Frames`], used to build fixtures.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.push(kind);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
