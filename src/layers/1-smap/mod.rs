// SPDX-License-Identifier: MPL-2.0

//! The per-drive space map ("smap").
//!
//! A `Smap` tracks zone allocation within one drive. The metadata core asks
//! it for contiguous, aligned zone runs when building object layouts, hands
//! zones back when objects are erased, and replays surviving layouts into it
//! at activation.
//!
//! A configurable percentage of each drive is held back as spare space;
//! normal allocations may not dip into the reserve.
use crate::{
    os::{Mutex, Vec},
    prelude::*,
    util::BitMap,
};

/// Which space an allocation may draw from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpcType {
    /// Regular allocations; must leave the spare reserve untouched.
    Usable,
    /// May consume the spare reserve.
    Spare,
}

/// Aggregate space counters of one drive, in zones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SmapUsage {
    pub total: u64,
    pub free: u64,
    pub spare: u64,
}

struct Inner {
    /// One bit per zone; a one bit is a free zone.
    free_map: BitMap,
    nfree: u64,
    spzone_pct: u8,
}

/// Zone allocator for a single drive.
pub struct Smap {
    inner: Mutex<Inner>,
    nzones: u64,
}

impl Smap {
    /// Creates a space map over `nzones` zones with `rsvd` leading zones
    /// pre-allocated (superblock area and the like).
    pub fn new(nzones: u64, rsvd: u64) -> Self {
        let mut free_map = BitMap::repeat(true, nzones as usize);
        for z in 0..rsvd.min(nzones) {
            free_map.clear_bit(z as usize);
        }
        let nfree = nzones - rsvd.min(nzones);
        Self {
            inner: Mutex::new(Inner {
                free_map,
                nfree,
                spzone_pct: 0,
            }),
            nzones,
        }
    }

    /// Sets the spare-zone percentage (0-100) reserved on this drive.
    pub fn set_spzone_pct(&self, pct: u8) {
        debug_assert!(pct <= 100);
        self.inner.lock().spzone_pct = pct.min(100);
    }

    fn spare_zones(&self, inner: &Inner) -> u64 {
        self.nzones * inner.spzone_pct as u64 / 100
    }

    /// Allocates `zcnt` contiguous zones whose start is `align`-aligned.
    ///
    /// `align` must be a power of two. Fails with `NoSpace` when no such run
    /// exists or, for [`SpcType::Usable`], when the run would eat into the
    /// spare reserve.
    pub fn alloc(&self, zcnt: u32, spctype: SpcType, align: u32) -> Result<u64> {
        if zcnt == 0 {
            return_errno_with_msg!(InvalidArgs, "zero-zone allocation");
        }
        let mut inner = self.inner.lock();

        let reserve = match spctype {
            SpcType::Usable => self.spare_zones(&inner),
            SpcType::Spare => 0,
        };
        if inner.nfree < zcnt as u64 + reserve {
            return_errno_with_msg!(NoSpace, "zone allocation would eat the spare reserve");
        }

        let Some(zaddr) = inner.free_map.first_run(zcnt as usize, align.max(1) as usize) else {
            return_errno_with_msg!(NoSpace, "no contiguous zone run");
        };
        for z in zaddr..zaddr + zcnt as usize {
            inner.free_map.clear_bit(z);
        }
        inner.nfree -= zcnt as u64;
        Ok(zaddr as u64)
    }

    /// Returns the given zone run to the free pool.
    pub fn free(&self, zaddr: u64, zcnt: u32) {
        let mut inner = self.inner.lock();
        for z in zaddr..zaddr + zcnt as u64 {
            if !inner.free_map.test_bit(z as usize) {
                inner.free_map.set_bit(z as usize);
                inner.nfree += 1;
            }
        }
    }

    /// Marks the given zone run allocated during replay.
    ///
    /// Fails with `Exists` if any zone of the run is already allocated,
    /// which means two surviving layouts overlap.
    pub fn insert(&self, zaddr: u64, zcnt: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if zaddr + zcnt as u64 > self.nzones {
            return_errno_with_msg!(InvalidArgs, "zone run out of range");
        }
        for z in zaddr..zaddr + zcnt as u64 {
            if !inner.free_map.test_bit(z as usize) {
                return_errno_with_msg!(Exists, "zone already allocated");
            }
        }
        for z in zaddr..zaddr + zcnt as u64 {
            inner.free_map.clear_bit(z as usize);
        }
        inner.nfree -= zcnt as u64;
        Ok(())
    }

    /// Free zones currently available to [`SpcType::Usable`] allocations.
    pub fn usable_free(&self) -> u64 {
        let inner = self.inner.lock();
        inner.nfree.saturating_sub(self.spare_zones(&inner))
    }

    pub fn usage(&self) -> SmapUsage {
        let inner = self.inner.lock();
        SmapUsage {
            total: self.nzones,
            free: inner.nfree,
            spare: self.spare_zones(&inner),
        }
    }
}

impl Debug for Smap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let usage = self.usage();
        f.debug_struct("Smap")
            .field("total", &usage.total)
            .field("free", &usage.free)
            .field("spare", &usage.spare)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_insert() {
        let smap = Smap::new(64, 1);
        assert_eq!(smap.usage().free, 63);

        // Zone 0 is reserved, so an aligned run lands at 4.
        let z = smap.alloc(4, SpcType::Usable, 4).unwrap();
        assert_eq!(z, 4);
        assert_eq!(smap.usage().free, 59);

        smap.free(z, 4);
        assert_eq!(smap.usage().free, 63);

        smap.insert(8, 2).unwrap();
        assert_eq!(smap.insert(9, 1).unwrap_err().errno(), Exists);
    }

    #[test]
    fn spare_reserve_is_respected() {
        let smap = Smap::new(100, 0);
        smap.set_spzone_pct(50);

        assert_eq!(smap.usable_free(), 50);
        assert!(smap.alloc(50, SpcType::Usable, 1).is_ok());
        assert_eq!(
            smap.alloc(1, SpcType::Usable, 1).unwrap_err().errno(),
            NoSpace
        );
        // Spare allocations may use the reserve.
        assert!(smap.alloc(10, SpcType::Spare, 1).is_ok());
    }

    #[test]
    fn contiguous_runs_only() {
        let smap = Smap::new(16, 0);
        smap.insert(8, 1).unwrap();

        // 9 free zones remain on one side of the hole at most.
        assert_eq!(smap.alloc(10, SpcType::Usable, 1).unwrap_err().errno(), NoSpace);
        assert_eq!(smap.alloc(8, SpcType::Usable, 1).unwrap(), 0);
        assert_eq!(smap.alloc(7, SpcType::Usable, 1).unwrap(), 9);
    }
}
