// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU64, Ordering};

use super::{layout::Layout, objid::ObjId};
use crate::{
    layers::{mdc::Mdc, omf::MdcCver, omf::MAX_REC_LEN},
    os::{Mutex, RwLock, Vec},
    prelude::*,
};

/// Per-slot uniquifier state, guarded by the slot's `uqlock`.
pub(crate) struct UniqState {
    /// High-water uniq ever handed out from this slot.
    pub luniq: u64,
    /// Last objid whose checkpoint bit was persisted.
    pub lckpt: ObjId,
}

/// The MDC log handle and its scratch state, guarded by the slot's
/// `compactlock`: holding it serializes compaction against every mutator
/// of this MDC.
pub(crate) struct MdcInfo {
    pub mdc: Option<Mdc>,
    /// Scratch buffer for packing records, sized to the record bound.
    pub recbuf: Vec<u8>,
    /// Content version read from (or last written to) this MDC.
    pub mdccver: Option<MdcCver>,
    /// Set when an append or compaction failed; the next compaction
    /// reopens the log before writing.
    pub err_state: bool,
}

impl MdcInfo {
    fn new() -> Self {
        Self {
            mdc: None,
            recbuf: vec![0u8; MAX_REC_LEN],
            mdccver: None,
            err_state: false,
        }
    }
}

/// Running object counts and bytes of one slot, guarded by `stats_lock`.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SlotStats {
    pub mb_cnt: u64,
    pub mb_alen: u64,
    pub ml_cnt: u64,
    pub ml_alen: u64,
    pub uncob_cnt: u64,
    pub uncob_alen: u64,
}

/// Pre-compaction counters.
///
/// Mutated under the slot's `compactlock`; atomic so the pre-compactor can
/// take its first look without the lock.
#[derive(Default)]
pub(crate) struct PcoCnt {
    pub cr: AtomicU64,
    pub up: AtomicU64,
    pub del: AtomicU64,
    pub er: AtomicU64,
    /// Committed objects currently indexed.
    pub cobj: AtomicU64,
    /// Mirror of the active mlog fill, refreshed after appends.
    pub len: AtomicU64,
    pub cap: AtomicU64,
}

impl PcoCnt {
    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record count since the last compaction.
    pub fn recs(&self) -> u64 {
        self.cr.load(Ordering::Relaxed)
            + self.up.load(Ordering::Relaxed)
            + self.del.load(Ordering::Relaxed)
            + self.er.load(Ordering::Relaxed)
    }

    /// Reset after a successful compaction that re-emitted `compacted`
    /// object records.
    pub fn reset(&self, compacted: u64) {
        self.cr.store(compacted, Ordering::Relaxed);
        self.up.store(0, Ordering::Relaxed);
        self.del.store(0, Ordering::Relaxed);
        self.er.store(0, Ordering::Relaxed);
        self.cobj.store(compacted, Ordering::Relaxed);
    }
}

/// In-memory state of one MDC slot.
///
/// The locks nest top-down: `compactlock`, then `uqlock`, then `colock`,
/// then `uncolock`, then `reflock`, with the stats lock innermost. MDC0's
/// locks nest below any MDCi's, so compacting MDCi may still write records
/// into MDC0.
pub(crate) struct MdcSlot {
    pub slot: u8,
    pub compactlock: Mutex<MdcInfo>,
    pub uqlock: Mutex<UniqState>,
    /// Committed objects, objid-ascending.
    pub colock: RwLock<BTreeMap<ObjId, Arc<Layout>>>,
    /// Uncommitted objects, objid-ascending.
    pub uncolock: Mutex<BTreeMap<ObjId, Arc<Layout>>>,
    pub reflock: Mutex<()>,
    pub stats: Mutex<SlotStats>,
    pub pco: PcoCnt,
}

impl MdcSlot {
    pub fn new(slot: u8) -> Self {
        Self {
            slot,
            compactlock: Mutex::new(MdcInfo::new()),
            uqlock: Mutex::new(UniqState {
                luniq: 0,
                lckpt: ObjId::from_raw(0),
            }),
            colock: RwLock::new(BTreeMap::new()),
            uncolock: Mutex::new(BTreeMap::new()),
            reflock: Mutex::new(()),
            stats: Mutex::new(SlotStats::default()),
            pco: PcoCnt::default(),
        }
    }

    /// Refreshes the fill mirror from the open MDC.
    pub fn refresh_usage(&self, info: &MdcInfo) {
        if let Some(mdc) = &info.mdc {
            let (len, cap) = mdc.usage();
            self.pco.len.store(len, Ordering::Relaxed);
            self.pco.cap.store(cap, Ordering::Relaxed);
        }
    }

    /// Applies an object-count delta to the stats.
    pub fn stats_add(&self, layout: &Layout, committed: bool, sign: i64) {
        let mut stats = self.stats.lock();
        let stats = &mut *stats;
        let cnt;
        let alen;
        if committed {
            match layout.otype() {
                super::objid::ObjType::Mblock => {
                    cnt = &mut stats.mb_cnt;
                    alen = &mut stats.mb_alen;
                }
                super::objid::ObjType::Mlog => {
                    cnt = &mut stats.ml_cnt;
                    alen = &mut stats.ml_alen;
                }
            }
        } else {
            cnt = &mut stats.uncob_cnt;
            alen = &mut stats.uncob_alen;
        }
        if sign >= 0 {
            *cnt += 1;
            *alen += layout.alen();
        } else {
            *cnt = cnt.saturating_sub(1);
            *alen = alen.saturating_sub(layout.alen());
        }
    }
}
