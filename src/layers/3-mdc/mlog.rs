// SPDX-License-Identifier: MPL-2.0

use crate::{
    layers::{omf::MAX_REC_LEN, pd::PdDev},
    prelude::*,
};

const FRAME_HDR_LEN: u64 = 4;
/// Frame header marking the end of a compaction.
const CEND_MARK: u32 = u32::MAX;

/// One frame yielded by the sequential reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A record payload of the given length, copied into the reader's buffer.
    Rec(usize),
    /// The end-of-compaction control frame.
    Cend,
}

/// An append-only framed byte log over a zone range of one drive.
///
/// Each append writes a `u32` little-endian header followed by the payload.
/// A zero header is the end of the log (erased zones read back as zeroes),
/// and [`CEND_MARK`] is a control frame carrying no payload.
pub struct Mlog {
    dev: Arc<dyn PdDev>,
    base: u64,
    cap: u64,
    woff: u64,
    roff: u64,
    has_cend: bool,
}

impl Mlog {
    /// Opens the mlog over `cap` bytes starting at byte `base` of `dev`,
    /// scanning existing frames to find the append position.
    pub fn open(dev: Arc<dyn PdDev>, base: u64, cap: u64) -> Result<Self> {
        let mut log = Self {
            dev,
            base,
            cap,
            woff: 0,
            roff: 0,
            has_cend: false,
        };
        log.rescan()?;
        Ok(log)
    }

    /// Re-derives the append position and CEND presence from the media.
    pub fn rescan(&mut self) -> Result<()> {
        self.woff = 0;
        self.roff = 0;
        self.has_cend = false;

        loop {
            if self.woff + FRAME_HDR_LEN > self.cap {
                break;
            }
            let mut hdr = [0u8; FRAME_HDR_LEN as usize];
            self.dev.read_at(self.base + self.woff, &mut hdr)?;
            let hdr = u32::from_le_bytes(hdr);
            if hdr == 0 {
                break;
            }
            if hdr == CEND_MARK {
                self.has_cend = true;
                self.woff += FRAME_HDR_LEN;
                continue;
            }
            if hdr as usize > MAX_REC_LEN || self.woff + FRAME_HDR_LEN + hdr as u64 > self.cap {
                return_errno_with_msg!(Corrupt, "mlog frame header out of range");
            }
            self.woff += FRAME_HDR_LEN + hdr as u64;
        }
        Ok(())
    }

    fn append_frame(&mut self, hdr: u32, payload: &[u8], sync: bool) -> Result<()> {
        let flen = FRAME_HDR_LEN + payload.len() as u64;
        if self.woff + flen > self.cap {
            return_errno_with_msg!(TooBig, "mlog append beyond capacity");
        }

        // Payload first so a torn write cannot expose a frame with a valid
        // header and garbage bytes.
        if !payload.is_empty() {
            self.dev
                .write_at(self.base + self.woff + FRAME_HDR_LEN, payload)?;
        }
        self.dev
            .write_at(self.base + self.woff, &hdr.to_le_bytes())?;
        if sync {
            self.dev.flush()?;
        }
        self.woff += flen;
        Ok(())
    }

    /// Appends one record frame.
    pub fn append_rec(&mut self, payload: &[u8], sync: bool) -> Result<()> {
        debug_assert!(!payload.is_empty() && payload.len() <= MAX_REC_LEN);
        self.append_frame(payload.len() as u32, payload, sync)
    }

    /// Appends the end-of-compaction control frame.
    pub fn append_cend(&mut self, sync: bool) -> Result<()> {
        self.append_frame(CEND_MARK, &[], sync)?;
        self.has_cend = true;
        Ok(())
    }

    /// Resets the sequential reader to the head of the log.
    pub fn rewind(&mut self) {
        self.roff = 0;
    }

    /// Reads the next frame, copying record payloads into `buf`.
    ///
    /// Returns `None` at the end of the log.
    pub fn next_frame(&mut self, buf: &mut [u8]) -> Result<Option<Frame>> {
        if self.roff >= self.woff {
            return Ok(None);
        }
        let mut hdr = [0u8; FRAME_HDR_LEN as usize];
        self.dev.read_at(self.base + self.roff, &mut hdr)?;
        let hdr = u32::from_le_bytes(hdr);
        if hdr == 0 {
            return Ok(None);
        }
        if hdr == CEND_MARK {
            self.roff += FRAME_HDR_LEN;
            return Ok(Some(Frame::Cend));
        }

        let len = hdr as usize;
        if len > buf.len() || self.roff + FRAME_HDR_LEN + len as u64 > self.woff {
            return_errno_with_msg!(Corrupt, "mlog frame does not fit the record buffer");
        }
        self.dev
            .read_at(self.base + self.roff + FRAME_HDR_LEN, &mut buf[..len])?;
        self.roff += FRAME_HDR_LEN + len as u64;
        Ok(Some(Frame::Rec(len)))
    }

    /// Zero-fills the log and resets all cursors.
    pub fn erase(&mut self) -> Result<()> {
        const CHUNK: usize = 64 * 1024;

        let zeros = [0u8; CHUNK];
        let mut offset = 0;
        while offset < self.cap {
            let n = (self.cap - offset).min(CHUNK as u64) as usize;
            self.dev.write_at(self.base + offset, &zeros[..n])?;
            offset += n as u64;
        }
        self.dev.flush()?;
        self.woff = 0;
        self.roff = 0;
        self.has_cend = false;
        Ok(())
    }

    /// Ensure appended frames are persisted.
    pub fn flush(&self) -> Result<()> {
        self.dev.flush()
    }

    /// Bytes appended so far.
    pub fn len(&self) -> u64 {
        self.woff
    }

    pub fn is_empty(&self) -> bool {
        self.woff == 0
    }

    /// Byte capacity of the log.
    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Whether the log contains an end-of-compaction frame.
    pub fn has_cend(&self) -> bool {
        self.has_cend
    }
}

impl Debug for Mlog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mlog")
            .field("base", &self.base)
            .field("cap", &self.cap)
            .field("len", &self.woff)
            .field("has_cend", &self.has_cend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::pd::MemPd;

    fn new_log(cap: u64) -> Mlog {
        let dev = Arc::new(MemPd::new(cap));
        Mlog::open(dev, 0, cap).unwrap()
    }

    #[test]
    fn append_read_rescan() {
        let mut log = new_log(4096);
        log.append_rec(b"one", true).unwrap();
        log.append_rec(b"twotwo", false).unwrap();

        let mut buf = [0u8; MAX_REC_LEN];
        log.rewind();
        assert_eq!(log.next_frame(&mut buf).unwrap(), Some(Frame::Rec(3)));
        assert_eq!(&buf[..3], b"one");
        assert_eq!(log.next_frame(&mut buf).unwrap(), Some(Frame::Rec(6)));
        assert_eq!(&buf[..6], b"twotwo");
        assert_eq!(log.next_frame(&mut buf).unwrap(), None);

        let len = log.len();
        log.rescan().unwrap();
        assert_eq!(log.len(), len);
    }

    #[test]
    fn cend_marker_survives_rescan() {
        let mut log = new_log(4096);
        log.append_rec(b"rec", true).unwrap();
        log.append_cend(true).unwrap();
        log.append_rec(b"post", true).unwrap();
        assert!(log.has_cend());

        log.rescan().unwrap();
        assert!(log.has_cend());

        let mut buf = [0u8; MAX_REC_LEN];
        log.rewind();
        assert_eq!(log.next_frame(&mut buf).unwrap(), Some(Frame::Rec(3)));
        assert_eq!(log.next_frame(&mut buf).unwrap(), Some(Frame::Cend));
        assert_eq!(log.next_frame(&mut buf).unwrap(), Some(Frame::Rec(4)));
        assert_eq!(log.next_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn append_beyond_capacity_is_too_big() {
        let mut log = new_log(16);
        log.append_rec(b"12345678", true).unwrap(); // 4 + 8 bytes
        let err = log.append_rec(b"x", true).unwrap_err();
        assert_eq!(err.errno(), TooBig);

        log.erase().unwrap();
        assert!(log.is_empty());
        log.append_rec(b"x", true).unwrap();
    }
}
