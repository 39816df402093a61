//! Wire format for relay frames.
//!
//! Every message is a 16-byte header followed by the context bytes and then
//! the body bytes:
//!
//! ```text
//! 0       1       2               4               8               12              16
//! ┌───────┬───────┬───────────────┬───────────────┬───────────────┬───────────────┐
//! │version│ flags │   reserved    │ ctx len (LE)  │ body len (LE) │ total len (BE)│
//! └───────┴───────┴───────────────┴───────────────┴───────────────┴───────────────┘
//! ```
//!
//! The trailing big-endian total is a cheap integrity check: a header read
//! from a desynchronized or corrupt stream almost never satisfies it.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Protocol version written into every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default cap on context + body length (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    /// Regular payload frame.
    pub const NONE: Flags = Flags(0);
    /// Control frame (handshake, stop).
    pub const CONTROL: Flags = Flags(0x01);
    /// Application-level error reported by the worker; body holds the message.
    pub const ERROR: Flags = Flags(0x02);

    const KNOWN: u8 = 0x03;

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    fn from_bits(bits: u8) -> Option<Self> {
        (bits & !Self::KNOWN == 0).then_some(Flags(bits))
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Self) -> Self::Output {
        Flags(self.0 | rhs.0)
    }
}

/// Errors raised while reading or writing frames.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("peer closed the relay")]
    Closed,

    #[error("unexpected EOF inside a frame")]
    Truncated,

    #[error("malformed frame header: {0}")]
    Malformed(String),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("unexpected frame: {0}")]
    Unexpected(String),

    #[error("relay I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub flags: Flags,
    pub context_len: usize,
    pub body_len: usize,
}

impl Header {
    /// Encode into the fixed-size wire representation.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], FrameError> {
        let ctx = u32::try_from(self.context_len).map_err(|_| FrameError::TooLarge {
            len: self.context_len,
            max: u32::MAX as usize,
        })?;
        let body = u32::try_from(self.body_len).map_err(|_| FrameError::TooLarge {
            len: self.body_len,
            max: u32::MAX as usize,
        })?;
        let total = ctx.checked_add(body).ok_or(FrameError::TooLarge {
            len: self.context_len + self.body_len,
            max: u32::MAX as usize,
        })?;

        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = self.flags.bits();
        buf[4..8].copy_from_slice(&ctx.to_le_bytes());
        buf[8..12].copy_from_slice(&body.to_le_bytes());
        buf[12..16].copy_from_slice(&total.to_be_bytes());
        Ok(buf)
    }

    /// Decode and validate a header against `max_frame`.
    ///
    /// Lengths are checked here so that a hostile peer cannot make the reader
    /// allocate or wait for more than `max_frame` bytes.
    pub fn decode(buf: &[u8; HEADER_SIZE], max_frame: usize) -> Result<Self, FrameError> {
        if buf[0] != PROTOCOL_VERSION {
            return Err(FrameError::Malformed(format!(
                "unsupported protocol version {}",
                buf[0]
            )));
        }
        let flags = Flags::from_bits(buf[1])
            .ok_or_else(|| FrameError::Malformed(format!("unknown flag bits {:#04x}", buf[1])))?;
        if buf[2] != 0 || buf[3] != 0 {
            return Err(FrameError::Malformed("reserved bytes are not zero".into()));
        }

        let ctx = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let body = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let total = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        if ctx.checked_add(body) != Some(total) {
            return Err(FrameError::Malformed(format!(
                "length check mismatch ({} + {} != {})",
                ctx, body, total
            )));
        }

        let len = total as usize;
        if len > max_frame {
            return Err(FrameError::TooLarge {
                len,
                max: max_frame,
            });
        }

        Ok(Self {
            flags,
            context_len: ctx as usize,
            body_len: body as usize,
        })
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: Flags,
    pub context: Vec<u8>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(flags: Flags, context: impl Into<Vec<u8>>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            flags,
            context: context.into(),
            body: body.into(),
        }
    }

    /// Control frame carrying a JSON command in its context.
    pub fn control(context: impl Into<Vec<u8>>) -> Self {
        Self::new(Flags::CONTROL, context, Vec::new())
    }

    pub fn is_control(&self) -> bool {
        self.flags.contains(Flags::CONTROL)
    }

    pub fn is_error(&self) -> bool {
        self.flags.contains(Flags::ERROR)
    }

    /// Number of payload bytes (context + body).
    pub fn payload_len(&self) -> usize {
        self.context.len() + self.body.len()
    }
}

/// Write one frame and flush the writer.
pub fn write_frame<W: Write>(
    writer: &mut W,
    flags: Flags,
    context: &[u8],
    body: &[u8],
    max_frame: usize,
) -> Result<(), FrameError> {
    let len = context.len() + body.len();
    if len > max_frame {
        return Err(FrameError::TooLarge {
            len,
            max: max_frame,
        });
    }
    let header = Header {
        flags,
        context_len: context.len(),
        body_len: body.len(),
    }
    .encode()?;

    writer.write_all(&header)?;
    writer.write_all(context)?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
///
/// Returns [`FrameError::Closed`] when the stream ends cleanly before a header
/// and [`FrameError::Truncated`] when it ends mid-frame.
pub fn read_frame<R: Read>(reader: &mut R, max_frame: usize) -> Result<Frame, FrameError> {
    let mut buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Err(FrameError::Closed),
            Ok(0) => return Err(FrameError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let header = Header::decode(&buf, max_frame)?;
    let context = read_exact_vec(reader, header.context_len)?;
    let body = read_exact_vec(reader, header.body_len)?;

    Ok(Frame {
        flags: header.flags,
        context,
        body,
    })
}

fn read_exact_vec<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, FrameError> {
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::Truncated,
        _ => FrameError::Io(e),
    })?;
    Ok(data)
}
