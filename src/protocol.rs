//! Wire format between the scheduler and forked workers: length-prefixed
//! bincode frames over plain pipes, one writer per pipe.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::FromRawFd;

use crate::slot::SlotId;
use crate::view::ViewError;

/// Upper bound on one frame, a sanity cap against corrupt length prefixes.
pub(crate) const MAX_FRAME_BYTES: usize = 1 << 30;

/// The one bincode configuration used for every encode and decode, so slot
/// capacity checks and wire bytes can never disagree.
pub(crate) fn codec() -> impl Options {
    bincode::options().with_fixint_encoding().allow_trailing_bytes()
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub(crate) enum TaskMsg {
    Compute { index: u64, slot: Option<SlotId> },
    Stop,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub(crate) enum ResultMsg {
    /// Payload encoded into the assigned shared-memory slot.
    Slot { index: u64, slot: SlotId, len: u64 },
    /// Payload serialized in-band. `spare` carries an assigned slot that
    /// went unused so the reader can return it to the pool.
    Inline { index: u64, spare: Option<SlotId>, bytes: Vec<u8> },
    /// The element itself failed; the error takes its place in the output.
    Failed { index: u64, spare: Option<SlotId>, error: ViewError },
    /// Orderly goodbye, sent exactly once before the worker exits.
    Exiting,
}

pub(crate) fn write_frame<M: Serialize>(w: &mut impl Write, msg: &M) -> io::Result<()> {
    let bytes = codec()
        .serialize(msg)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(&bytes)?;
    w.flush()
}

/// Reads one frame. `Ok(None)` means the stream ended cleanly on a frame
/// boundary; end-of-stream inside a frame is an error.
pub(crate) fn read_frame<M: DeserializeOwned>(r: &mut impl Read) -> io::Result<Option<M>> {
    let mut header = [0u8; 4];
    let mut first = [0u8; 1];
    loop {
        match r.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    header[0] = first[0];
    r.read_exact(&mut header[1..])?;
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame length out of range"));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    codec()
        .deserialize(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// A unidirectional pipe as a pair of owned files, `(read, write)`.
pub(crate) fn pipe() -> io::Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: pipe(2) with a valid two-element buffer.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and belong to nothing else.
    unsafe { Ok((File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1]))) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_round_trip() {
        let mut buf = Vec::new();
        let msg = TaskMsg::Compute { index: 42, slot: Some(SlotId(3)) };
        write_frame(&mut buf, &msg).unwrap();
        write_frame(&mut buf, &TaskMsg::Stop).unwrap();

        let mut r = Cursor::new(buf);
        assert_eq!(read_frame::<TaskMsg>(&mut r).unwrap(), Some(msg));
        assert_eq!(read_frame::<TaskMsg>(&mut r).unwrap(), Some(TaskMsg::Stop));
        assert_eq!(read_frame::<TaskMsg>(&mut r).unwrap(), None);
    }

    #[test]
    fn result_frames_carry_errors_and_payloads() {
        let mut buf = Vec::new();
        let failed = ResultMsg::Failed {
            index: 7,
            spare: Some(SlotId(1)),
            error: ViewError::Element { index: 7, reason: "nope".into() },
        };
        let inline = ResultMsg::Inline { index: 8, spare: None, bytes: vec![1, 2, 3] };
        write_frame(&mut buf, &failed).unwrap();
        write_frame(&mut buf, &inline).unwrap();

        let mut r = Cursor::new(buf);
        assert_eq!(read_frame::<ResultMsg>(&mut r).unwrap(), Some(failed));
        assert_eq!(read_frame::<ResultMsg>(&mut r).unwrap(), Some(inline));
    }

    #[test]
    fn truncated_frames_are_errors_not_clean_ends() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &TaskMsg::Stop).unwrap();
        buf.truncate(buf.len() - 1);
        let mut r = Cursor::new(buf);
        assert!(read_frame::<TaskMsg>(&mut r).is_err());
    }

    #[test]
    fn absurd_length_prefixes_are_rejected() {
        let mut r = Cursor::new(u32::MAX.to_le_bytes().to_vec());
        assert!(read_frame::<TaskMsg>(&mut r).is_err());
    }

    #[test]
    fn frames_cross_a_real_pipe() {
        let (mut read, mut write) = pipe().unwrap();
        let msg = ResultMsg::Slot { index: 5, slot: SlotId(0), len: 16 };
        write_frame(&mut write, &msg).unwrap();
        drop(write);
        assert_eq!(read_frame::<ResultMsg>(&mut read).unwrap(), Some(msg));
        assert_eq!(read_frame::<ResultMsg>(&mut read).unwrap(), None);
    }
}
