//! Length-prefixed frames.
//!
//! `[u32 big-endian length][payload]`. The receiver enforces a maximum
//! length before allocating, so a bogus prefix can't make it reserve
//! gigabytes.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tether_core::error::{Result, TetherError};

/// Largest payload either side will accept.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one frame and flush.
///
/// ## Errors
///
/// `MalformedFrame` if the payload is larger than [`MAX_FRAME_LEN`], `Io` if
/// the stream fails.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()>
{
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            TetherError::MalformedFrame(format!(
                "payload of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
                payload.len()
            ))
        })?;

    writer.write_u32::<BigEndian>(len)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame, rejecting any whose prefix announces more than `max_len`.
///
/// ## Errors
///
/// `MalformedFrame` if the stream ends early or the length is too large,
/// `Io` for any other read failure.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Vec<u8>>
{
    let len = reader.read_u32::<BigEndian>().map_err(|e| closed_early(e, "length prefix"))? as usize;
    if len > max_len {
        return Err(TetherError::MalformedFrame(format!(
            "frame of {len} bytes exceeds the {max_len} byte limit"
        )));
    }

    let mut payload = vec![0; len];
    fill(reader, &mut payload, "payload")?;
    Ok(payload)
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()>
{
    reader.read_exact(buf).map_err(|e| closed_early(e, what))
}

fn closed_early(error: io::Error, what: &str) -> TetherError
{
    if error.kind() == io::ErrorKind::UnexpectedEof {
        TetherError::MalformedFrame(format!("connection closed before the {what} was received"))
    } else {
        error.into()
    }
}
