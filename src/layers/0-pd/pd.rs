// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    os::{Mutex, Vec},
    prelude::*,
};

/// Size of one metadata page in bytes. Zone sizes are multiples of this.
pub const PAGE_SIZE: u64 = 4096;

/// A fixed-size drive that supports random reads and writes at byte
/// granularity.
///
/// # Thread safety
///
/// `PdDev` is a data structure of interior mutability. It is ok to perform
/// I/O on a `PdDev` concurrently in multiple threads.
pub trait PdDev: Send + Sync {
    /// Read `buf.len()` bytes at the specified byte offset.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` at the specified byte offset.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Ensure that written bytes are persisted to the device.
    fn flush(&self) -> Result<()>;

    /// Returns the device size in bytes.
    fn nbytes(&self) -> u64;
}

/// Media class of a drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mclass {
    /// Long-term bulk storage.
    Capacity = 0,
    /// Fast staging storage.
    Staging = 1,
}

impl Mclass {
    /// The number of media classes.
    pub const COUNT: usize = 2;

    /// All classes, in fallback order (requested class first, then upward).
    pub fn walk_from(self) -> impl Iterator<Item = Mclass> {
        (self as u8..Self::COUNT as u8).map(|i| match i {
            0 => Mclass::Capacity,
            _ => Mclass::Staging,
        })
    }

    pub fn from_index(i: usize) -> Option<Mclass> {
        match i {
            0 => Some(Mclass::Capacity),
            1 => Some(Mclass::Staging),
            _ => None,
        }
    }
}

/// Kind of device backing a drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PdDevType {
    File,
    Block,
}

/// Discovered (and persisted) properties of a drive.
///
/// These must match between the MCCONFIG record and the device offered at
/// activation, or the drive is rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdProps {
    pub uuid: Uuid,
    pub mclass: Mclass,
    /// Zone size in pages.
    pub zonepg: u32,
    pub sectorsz: u32,
    pub devtype: PdDevType,
    pub features: u64,
}

impl PdProps {
    /// Zone size in bytes.
    pub fn zone_bytes(&self) -> u64 {
        self.zonepg as u64 * PAGE_SIZE
    }
}

/// Runtime state of a drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PdState {
    /// Present and usable.
    Active,
    /// Recorded in MDC0 but not offered at activation.
    Unavail,
    /// Being removed from the mpool.
    Defunct,
}

/// A drive aggregated into the mpool: device handle plus properties.
///
/// The device handle is absent for unavailable drives.
pub struct Pd {
    dev: Option<Arc<dyn PdDev>>,
    props: PdProps,
    state: PdState,
}

impl Pd {
    /// Creates an active drive over an open device.
    pub fn new(dev: Arc<dyn PdDev>, props: PdProps) -> Self {
        Self {
            dev: Some(dev),
            props,
            state: PdState::Active,
        }
    }

    /// Creates a placeholder for a drive recorded in MDC0 but missing at
    /// activation.
    pub fn unavail(props: PdProps) -> Self {
        Self {
            dev: None,
            props,
            state: PdState::Unavail,
        }
    }

    pub fn props(&self) -> &PdProps {
        &self.props
    }

    pub fn uuid(&self) -> Uuid {
        self.props.uuid
    }

    pub fn state(&self) -> PdState {
        self.state
    }

    pub fn set_state(&mut self, state: PdState) {
        self.state = state;
    }

    pub fn is_available(&self) -> bool {
        self.dev.is_some() && self.state == PdState::Active
    }

    /// Returns the open device, or `Gone` for an unavailable drive.
    pub fn dev(&self) -> Result<&Arc<dyn PdDev>> {
        self.dev
            .as_ref()
            .ok_or(Error::with_msg(Gone, "drive is unavailable"))
    }

    pub fn zone_bytes(&self) -> u64 {
        self.props.zone_bytes()
    }

    /// Number of whole zones on the device (0 when unavailable).
    pub fn nzones(&self) -> u64 {
        match &self.dev {
            Some(dev) => dev.nbytes() / self.zone_bytes(),
            None => 0,
        }
    }

    /// Byte offset of the given zone.
    pub fn zone_offset(&self, zaddr: u64) -> u64 {
        zaddr * self.zone_bytes()
    }

    /// Zero-fills the given zone range.
    pub fn erase_zones(&self, zaddr: u64, zcnt: u32) -> Result<()> {
        const CHUNK: usize = 64 * 1024;

        let dev = self.dev()?;
        let mut offset = self.zone_offset(zaddr);
        let mut remaining = zcnt as u64 * self.zone_bytes();
        let zeros = [0u8; CHUNK];
        while remaining > 0 {
            let n = remaining.min(CHUNK as u64) as usize;
            dev.write_at(offset, &zeros[..n])?;
            offset += n as u64;
            remaining -= n as u64;
        }
        dev.flush()
    }
}

impl Debug for Pd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pd")
            .field("uuid", &self.props.uuid)
            .field("mclass", &self.props.mclass)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// An in-memory drive.
///
/// The storage is shared behind `Arc`, so clones address the same bytes:
/// dropping an mpool without deactivating it and re-activating over clones
/// of the same `MemPd`s models a crash and recovery.
#[derive(Clone)]
pub struct MemPd {
    store: Arc<Mutex<Vec<u8>>>,
}

impl MemPd {
    /// Create a `MemPd` of the given size in bytes.
    pub fn new(nbytes: u64) -> Self {
        Self {
            store: Arc::new(Mutex::new(vec![0u8; nbytes as usize])),
        }
    }
}

impl PdDev for MemPd {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let store = self.store.lock();
        let offset = offset as usize;
        if offset + buf.len() > store.len() {
            return_errno_with_msg!(InvalidArgs, "read offset is out of range");
        }
        buf.copy_from_slice(&store[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut store = self.store.lock();
        let offset = offset as usize;
        if offset + buf.len() > store.len() {
            return_errno_with_msg!(InvalidArgs, "write offset is out of range");
        }
        store[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn nbytes(&self) -> u64 {
        self.store.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_pd_io() {
        let pd = MemPd::new(PAGE_SIZE * 16);
        assert_eq!(pd.nbytes(), PAGE_SIZE * 16);

        pd.write_at(100, &[7u8; 8]).unwrap();
        let mut buf = [0u8; 8];
        pd.read_at(100, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 8]);

        assert!(pd.read_at(PAGE_SIZE * 16 - 4, &mut buf).is_err());
    }

    #[test]
    fn erase_zones_zeroes() {
        let props = PdProps {
            uuid: Uuid::new_v4(),
            mclass: Mclass::Capacity,
            zonepg: 2,
            sectorsz: 512,
            devtype: PdDevType::File,
            features: 0,
        };
        let dev = MemPd::new(props.zone_bytes() * 8);
        dev.write_at(props.zone_bytes(), &[0xA5; 64]).unwrap();

        let pd = Pd::new(Arc::new(dev.clone()), props);
        pd.erase_zones(1, 1).unwrap();

        let mut buf = [0u8; 64];
        dev.read_at(pd.zone_offset(1), &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }
}
