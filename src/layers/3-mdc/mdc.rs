// SPDX-License-Identifier: MPL-2.0

use super::mlog::{Frame, Mlog};
use crate::prelude::*;

/// A paired-mlog metadata log with atomic compaction.
///
/// One mlog of the pair is *active* (the append target); the other is kept
/// erased until a compaction rewrites the net state into it. The mlog
/// generations are not stored in the zone payload: they live in the
/// layouts that own the pair (the superblock image for MDC0, `OErase`
/// records in MDC0 for every other MDC), and are handed in at open.
///
/// # Crash consistency
///
/// Role selection at open: the higher-generation mlog is active iff it
/// contains an end-of-compaction (CEND) frame; otherwise the compaction
/// that bumped its generation never finished and the lower-generation mlog
/// still carries the authoritative state. A fresh pair is created with
/// generations (1, 0) and a CEND frame pre-written to side 0 so selection
/// is uniform.
pub struct Mdc {
    side: [Mlog; 2],
    gens: [u64; 2],
    active: usize,
    /// Compaction write target, set between `cstart` and `cend`.
    target: Option<usize>,
}

impl Mdc {
    /// Formats a fresh MDC over two erased mlogs.
    pub fn create(mut side0: Mlog, mut side1: Mlog) -> Result<Self> {
        side0.erase()?;
        side1.erase()?;
        side0.append_cend(true)?;
        Ok(Self {
            side: [side0, side1],
            gens: [1, 0],
            active: 0,
            target: None,
        })
    }

    /// Opens an existing MDC from its two mlogs and their recorded
    /// generations.
    pub fn open(side0: Mlog, gen0: u64, side1: Mlog, gen1: u64) -> Result<Self> {
        if gen0 == gen1 {
            return_errno_with_msg!(Corrupt, "paired mlogs carry equal generations");
        }
        let mut mdc = Self {
            side: [side0, side1],
            gens: [gen0, gen1],
            active: 0,
            target: None,
        };
        mdc.select_active();
        Ok(mdc)
    }

    fn select_active(&mut self) {
        let (hi, lo) = if self.gens[0] > self.gens[1] {
            (0, 1)
        } else {
            (1, 0)
        };
        self.active = if self.side[hi].has_cend() { hi } else { lo };
    }

    /// Re-derives cursors and roles from the media after a failure.
    pub fn reopen(&mut self) -> Result<()> {
        self.target = None;
        self.side[0].rescan()?;
        self.side[1].rescan()?;
        self.select_active();
        Ok(())
    }

    fn write_side(&mut self) -> usize {
        self.target.unwrap_or(self.active)
    }

    /// Appends one record frame to the write target.
    pub fn append(&mut self, payload: &[u8], sync: bool) -> Result<()> {
        let side = self.write_side();
        self.side[side].append_rec(payload, sync)
    }

    /// Resets the sequential reader to the head of the active mlog.
    pub fn rewind(&mut self) {
        self.side[self.active].rewind();
    }

    /// Reads the next record into `buf`, returning its length, or 0 at the
    /// end of the log. Control frames are skipped.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.side[self.active].next_frame(buf)? {
                None => return Ok(0),
                Some(Frame::Cend) => continue,
                Some(Frame::Rec(len)) => return Ok(len),
            }
        }
    }

    /// Begins a compaction: erases the inactive mlog, bumps its generation
    /// and makes it the write target. Returns the new generation, which the
    /// caller must persist before appending state.
    pub fn cstart(&mut self) -> Result<u64> {
        let t = 1 - self.active;
        self.side[t].erase()?;
        self.gens[t] = self.gens[self.active] + 1;
        self.target = Some(t);
        Ok(self.gens[t])
    }

    /// Finalizes a compaction: writes the end-of-compaction frame, flushes,
    /// and atomically swaps roles.
    pub fn cend(&mut self) -> Result<()> {
        let Some(t) = self.target else {
            return_errno_with_msg!(Critical, "cend without a compaction in progress");
        };
        self.side[t].append_cend(true)?;
        self.active = t;
        self.target = None;
        Ok(())
    }

    /// Whether a compaction is in progress.
    pub fn compacting(&self) -> bool {
        self.target.is_some()
    }

    /// The compaction write target, if a compaction is in progress.
    pub fn target(&self) -> Option<usize> {
        self.target
    }

    /// Generation of the given side.
    pub fn gen(&self, side: usize) -> u64 {
        self.gens[side]
    }

    /// (bytes appended, byte capacity) of the active mlog.
    pub fn usage(&self) -> (u64, u64) {
        let a = &self.side[self.active];
        (a.len(), a.cap())
    }

    /// Ensure all appended records are persisted.
    pub fn flush(&self) -> Result<()> {
        self.side[0].flush()?;
        self.side[1].flush()
    }
}

impl Debug for Mdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mdc")
            .field("gens", &self.gens)
            .field("active", &self.active)
            .field("compacting", &self.compacting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{omf::MAX_REC_LEN, pd::MemPd};

    fn new_pair(cap: u64) -> (Arc<MemPd>, Mlog, Mlog) {
        let dev = Arc::new(MemPd::new(cap * 2));
        let a = Mlog::open(dev.clone(), 0, cap).unwrap();
        let b = Mlog::open(dev.clone(), cap, cap).unwrap();
        (dev, a, b)
    }

    fn read_all(mdc: &mut Mdc) -> Vec<Vec<u8>> {
        let mut buf = [0u8; MAX_REC_LEN];
        let mut out = Vec::new();
        mdc.rewind();
        loop {
            let len = mdc.read(&mut buf).unwrap();
            if len == 0 {
                break;
            }
            out.push(buf[..len].to_vec());
        }
        out
    }

    #[test]
    fn create_append_read() {
        let (_dev, a, b) = new_pair(4096);
        let mut mdc = Mdc::create(a, b).unwrap();
        mdc.append(b"r1", true).unwrap();
        mdc.append(b"r2", true).unwrap();

        assert_eq!(read_all(&mut mdc), vec![b"r1".to_vec(), b"r2".to_vec()]);
    }

    #[test]
    fn compaction_swaps_roles() {
        let (dev, a, b) = new_pair(4096);
        let mut mdc = Mdc::create(a, b).unwrap();
        mdc.append(b"old", true).unwrap();

        let gen = mdc.cstart().unwrap();
        assert_eq!(gen, 2);
        mdc.append(b"net", true).unwrap();
        mdc.cend().unwrap();
        mdc.append(b"post", true).unwrap();

        assert_eq!(read_all(&mut mdc), vec![b"net".to_vec(), b"post".to_vec()]);

        // Reopen from the media with the persisted generations.
        let a = Mlog::open(dev.clone(), 0, 4096).unwrap();
        let b = Mlog::open(dev.clone(), 4096, 4096).unwrap();
        let mut mdc = Mdc::open(a, 1, b, 2).unwrap();
        assert_eq!(read_all(&mut mdc), vec![b"net".to_vec(), b"post".to_vec()]);
    }

    #[test]
    fn torn_compaction_falls_back() {
        let (dev, a, b) = new_pair(4096);
        let mut mdc = Mdc::create(a, b).unwrap();
        mdc.append(b"keep", true).unwrap();

        // Crash after cstart and a partial rewrite: no CEND in the target.
        mdc.cstart().unwrap();
        mdc.append(b"torn", true).unwrap();
        drop(mdc);

        let a = Mlog::open(dev.clone(), 0, 4096).unwrap();
        let b = Mlog::open(dev.clone(), 4096, 4096).unwrap();
        // The bumped generation was persisted, but the CEND never landed.
        let mut mdc = Mdc::open(a, 1, b, 2).unwrap();
        assert_eq!(read_all(&mut mdc), vec![b"keep".to_vec()]);
    }
}
