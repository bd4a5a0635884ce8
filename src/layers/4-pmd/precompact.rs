// SPDX-License-Identifier: MPL-2.0

//! The pre-compactor and MDC allocation scheduler.
//!
//! A periodic task walks the user MDCs round-robin and compacts one when
//! its active mlog is both full enough and garbage-laden enough, allocates
//! a fresh MDC set when the pool of MDCs as a whole is filling up, and
//! rebuilds the credit-weighted slot-selection table from per-MDC free
//! space. Compacting ahead of demand bounds the worst-case commit latency:
//! a commit that lands on a full mlog has to compact synchronously.
use core::sync::atomic::Ordering;
use std::time::Duration;

use super::{
    layout::Layout,
    mpool::{Mpool, PmdCore},
    objid::{ObjId, MDC_SLOTS},
};
use crate::{
    layers::{
        mdc::{Mdc, Mlog},
        omf::{self, MdcCver, MdcRec},
        pd::Mclass,
        smap::SpcType,
    },
    os::{self, Condvar, JoinHandle, Mutex, Vec},
    prelude::*,
};

/// Number of entries of the slot-selection table (a power of two).
pub const MDC_TBL_SZ: usize = 1024;

/// MDCs are allocated in sets of this size, and credits are granted to at
/// most this many MDCs at a time.
pub const MDC_SET_SZ: usize = 4;

struct StopFlag {
    flag: Mutex<bool>,
    cv: Condvar,
}

/// Handle of the running pre-compaction task.
pub(crate) struct PreCompactTask {
    handle: JoinHandle<()>,
    stop: Arc<StopFlag>,
}

impl Mpool {
    /// Starts the periodic pre-compaction task.
    pub fn precompact_start(&self) {
        let mut guard = self.precompact.lock();
        if guard.is_some() {
            return;
        }

        let stop = Arc::new(StopFlag {
            flag: Mutex::new(false),
            cv: Condvar::new(),
        });
        let period = Duration::from_secs(self.core.cfg.pcoperiod.clamp(1, 3600));
        let core = self.core.clone();
        let stop2 = stop.clone();
        let handle = os::spawn(move || loop {
            let mut stopped = stop2.flag.lock();
            let (guard, _) = stop2.cv.wait_timeout(stopped, period);
            stopped = guard;
            if *stopped {
                break;
            }
            drop(stopped);
            core.precompact_tick();
        });
        *guard = Some(PreCompactTask { handle, stop });
        debug!("pre-compactor started, period {:?}", period);
    }

    /// Stops the pre-compaction task and waits for it to exit.
    pub fn precompact_stop(&self) {
        let task = self.precompact.lock().take();
        if let Some(task) = task {
            *task.stop.flag.lock() = true;
            task.stop.cv.notify_all();
            let _ = task.handle.join();
            debug!("pre-compactor stopped");
        }
    }

    /// Allocates a new MDC set immediately.
    pub fn mdc_alloc(&self) -> Result<usize> {
        self.core.mdc_alloc_set()
    }

    /// Aggregate (bytes appended, byte capacity) across the user MDCs.
    pub fn mdc_cap(&self) -> (u64, u64) {
        let mut len = 0;
        let mut cap = 0;
        for slot in 1..self.core.slotvcnt() {
            let pco = &self.core.slots[slot].pco;
            len += pco.len.load(Ordering::Relaxed);
            cap += pco.cap.load(Ordering::Relaxed);
        }
        (len, cap)
    }
}

impl PmdCore {
    /// One tick of the pre-compaction task.
    pub(crate) fn precompact_tick(&self) {
        let slotvcnt = self.slotvcnt();
        if slotvcnt > 1 {
            let n = self.nmtoc.fetch_add(1, Ordering::Relaxed);
            let slot = n % (slotvcnt - 1) + 1;
            self.compacting_slot.store(slot, Ordering::Relaxed);

            if self.need_compact(slot) {
                let mut info = self.slots[slot].compactlock.lock();
                // Re-evaluate with the lock held; a commit may have
                // compacted this MDC while we were deciding.
                self.slots[slot].refresh_usage(&info);
                if self.need_compact(slot) {
                    if let Err(e) = self.compact_locked(slot, &mut info) {
                        warn!("pre-compaction of mdc{} failed: {}", slot, e);
                    }
                }
            }
        }

        if self.mdc_needed() {
            if let Err(e) = self.mdc_alloc_set() {
                warn!("MDC set allocation failed: {}", e);
            }
        }

        self.update_credit();
    }

    /// Whether one MDC is worth compacting: its active mlog is filling up
    /// and a useful share of its records are garbage.
    fn need_compact(&self, slot: usize) -> bool {
        let pco = &self.slots[slot].pco;
        let cap = pco.cap.load(Ordering::Relaxed);
        let len = pco.len.load(Ordering::Relaxed);
        if cap == 0 || len * 100 / cap <= self.cfg.pcopctfull as u64 {
            return false;
        }
        let recs = pco.recs();
        if recs == 0 {
            return false;
        }
        let cobj = pco.cobj.load(Ordering::Relaxed);
        let garbage = recs.saturating_sub(cobj) * 100 / recs;
        garbage > self.cfg.pcopctgarbage as u64
    }

    /// Whether a new MDC set should be allocated: slot capacity remains,
    /// the MDCs as a whole are filling up, and compaction would not win the
    /// space back anyway.
    fn mdc_needed(&self) -> bool {
        let slotvcnt = self.slotvcnt();
        if slotvcnt < 2 || slotvcnt >= MDC_SLOTS {
            return false;
        }

        let mut len = 0u64;
        let mut cap = 0u64;
        let mut recs = 0u64;
        let mut cobj = 0u64;
        for slot in 1..slotvcnt {
            let pco = &self.slots[slot].pco;
            len += pco.len.load(Ordering::Relaxed);
            cap += pco.cap.load(Ordering::Relaxed);
            recs += pco.recs();
            cobj += pco.cobj.load(Ordering::Relaxed);
        }
        if cap == 0 || len * 100 / cap <= self.cfg.crtmdcpctfull as u64 {
            return false;
        }
        let garbage = if recs == 0 {
            0
        } else {
            recs.saturating_sub(cobj) * 100 / recs
        };
        garbage < self.cfg.crtmdcpctgrbg as u64
    }

    /// Allocates enough MDCs to reach the next multiple of [`MDC_SET_SZ`],
    /// backfilling a partial set left by a prior failure.
    pub(crate) fn mdc_alloc_set(&self) -> Result<usize> {
        // One MDC allocation at a time; slot numbers are handed out here.
        let _g = self.mdc_alloc_lock.lock();
        let slotvcnt = self.slotvcnt();
        let nuser = slotvcnt.saturating_sub(1);
        let mut ncreate = MDC_SET_SZ - (nuser % MDC_SET_SZ);
        ncreate = ncreate.min(MDC_SLOTS - slotvcnt);
        if ncreate == 0 {
            return_errno_with_msg!(NoSpace, "MDC slots are exhausted");
        }

        for _ in 0..ncreate {
            self.mdc_alloc_one()?;
        }
        self.update_credit();
        Ok(ncreate)
    }

    /// Provisions one MDC: a pair of mlogs allocated, erased and committed
    /// into MDC0, the paired log opened and stamped with a VERSION record,
    /// and finally the slot published.
    fn mdc_alloc_one(&self) -> Result<()> {
        let slot = self.slotvcnt();
        if slot >= MDC_SLOTS {
            return_errno_with_msg!(NoSpace, "MDC slots are exhausted");
        }

        let pdv = self.pdv.read();
        let cand: Vec<usize> = pdv
            .iter()
            .enumerate()
            .filter(|(_, pp)| {
                pp.pd.is_available() && pp.pd.props().mclass == Mclass::Capacity
            })
            .map(|(i, _)| i)
            .collect();
        if cand.is_empty() {
            return_errno_with_msg!(NoSpace, "no capacity-class drive available");
        }

        // Alternate the drives backing consecutive pairs so active mlogs
        // spread evenly.
        let r = self.pd_rotor.fetch_add(1, Ordering::Relaxed);
        let pdi = [cand[r % cand.len()], cand[(r + 1) % cand.len()]];

        let mut placed: Vec<(usize, u64, u32, u64)> = Vec::with_capacity(2);
        for (side, &i) in pdi.iter().enumerate() {
            let pp = &pdv[i];
            let zone_bytes = pp.pd.zone_bytes();
            let zcnt = self.cfg.mdcncap.div_ceil(zone_bytes).max(1) as u32;
            match pp.smap.alloc(zcnt, SpcType::Usable, 1) {
                Ok(zaddr) => placed.push((i, zaddr, zcnt, zone_bytes)),
                Err(e) => {
                    if side == 1 {
                        let (i0, z0, c0, _) = placed[0];
                        pdv[i0].smap.free(z0, c0);
                    }
                    return Err(e);
                }
            }
        }

        let open_side = |&(i, zaddr, zcnt, zb): &(usize, u64, u32, u64)| -> Result<Mlog> {
            Mlog::open(pdv[i].pd.dev()?.clone(), zaddr * zb, zcnt as u64 * zb)
        };
        let mdc = (|| Mdc::create(open_side(&placed[0])?, open_side(&placed[1])?))();
        let mdc = match mdc {
            Ok(mdc) => mdc,
            Err(e) => {
                for (i, zaddr, zcnt, _) in &placed {
                    pdv[*i].smap.free(*zaddr, *zcnt);
                }
                return Err(e);
            }
        };

        // Appending to MDC0 may compact it, which re-reads the drive list.
        let uuids = [pdv[pdi[0]].pd.uuid(), pdv[pdi[1]].pd.uuid()];
        drop(pdv);

        // Commit both backing mlogs into MDC0, one at a time, indexing each
        // as soon as its record is durable. A failure between the two
        // leaves the torn pair for activation to truncate.
        for (side, &(i, zaddr, zcnt, zone_bytes)) in placed.iter().enumerate() {
            let logid = ObjId::logid_make(2 * slot as u64 + side as u64, 0);
            let gen = mdc.gen(side);
            let layout = Layout::new(
                logid,
                uuids[side],
                i,
                zaddr,
                zcnt,
                zone_bytes,
                gen,
                true,
                1,
            );
            if let Err(e) = self.mdc_addrec(0, &MdcRec::OCreate(layout.desc())) {
                let pdv = self.pdv.read();
                let lost = if side == 0 {
                    &placed[..]
                } else {
                    &placed[1..]
                };
                for (i, zaddr, zcnt, _) in lost {
                    pdv[*i].smap.free(*zaddr, *zcnt);
                }
                return Err(e);
            }
            self.slots[0].colock.write().insert(logid, layout.clone());
            self.slots[0].stats_add(&layout, true, 1);
        }

        {
            let mut info = self.slots[slot].compactlock.lock();
            let mut mdc = mdc;
            let len = omf::pack(&MdcRec::Version(MdcCver::LATEST), &mut info.recbuf)?;
            mdc.append(&info.recbuf[..len], true)?;
            info.mdc = Some(mdc);
            info.mdccver = Some(MdcCver::LATEST);
            info.err_state = false;
            self.slots[slot].refresh_usage(&info);
        }
        {
            let mut uq = self.slots[slot].uqlock.lock();
            uq.luniq = 0;
            uq.lckpt = ObjId::from_raw(0);
        }
        self.slots[slot].pco.reset(0);

        // Publish: bump MDC0's uniquifier over the new logids and make the
        // slot visible, atomically.
        {
            let mut uq0 = self.slots[0].uqlock.lock();
            let _vg = self.slotvlock.lock();
            uq0.luniq = uq0.luniq.max(2 * slot as u64 + 1);
            self.slotvcnt.store(slot + 1, Ordering::Release);
        }
        info!("mdc{} provisioned", slot);
        Ok(())
    }

    /// Rebuilds the slot-selection table from per-MDC free space.
    ///
    /// MDC0 never takes allocations; neither do the MDCs right behind the
    /// pre-compactor's current target, so new objects do not queue behind a
    /// sync-heavy compaction. The most-free MDCs (up to [`MDC_SET_SZ`])
    /// split the table in proportion to their free bytes, and the table is
    /// filled by interleaved placement so a slot's entries spread out.
    pub(crate) fn update_credit(&self) {
        let slotvcnt = self.slotvcnt();
        if slotvcnt < 2 {
            return;
        }
        let nuser = slotvcnt - 1;

        let mut skip = vec![false; slotvcnt];
        let compacting = self.compacting_slot.load(Ordering::Relaxed);
        if compacting != usize::MAX && (1..slotvcnt).contains(&compacting) {
            for k in 0..=(self.cfg.pconbnoalloc as usize) {
                skip[1 + (compacting - 1 + k) % nuser] = true;
            }
        }

        let mut members: Vec<(usize, u64)> = (1..slotvcnt)
            .filter(|s| !skip[*s])
            .filter_map(|s| {
                let pco = &self.slots[s].pco;
                let cap = pco.cap.load(Ordering::Relaxed);
                let len = pco.len.load(Ordering::Relaxed);
                if cap == 0 {
                    return None;
                }
                let free = cap - len.min(cap);
                // Starved MDCs are no use to the allocator.
                (free * 400 > cap).then_some((s, free))
            })
            .collect();
        if members.is_empty() {
            return;
        }

        members.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        members.truncate(MDC_SET_SZ);

        let frees: Vec<u64> = members.iter().map(|(_, f)| *f).collect();
        let mut rem = credit_split(&frees, MDC_TBL_SZ);

        let mut idx = 0;
        while idx < MDC_TBL_SZ {
            let mut stuck = true;
            for (i, (slot, _)) in members.iter().enumerate() {
                if rem[i] > 0 && idx < MDC_TBL_SZ {
                    self.mds_tbl[idx].store(*slot as u8, Ordering::Relaxed);
                    rem[i] -= 1;
                    idx += 1;
                    stuck = false;
                }
            }
            if stuck {
                break;
            }
        }
    }
}

/// Splits `total` credits across members in proportion to their free
/// bytes; the rounding shortfall is handed out round-robin so the credits
/// sum exactly to `total`.
pub(crate) fn credit_split(frees: &[u64], total: usize) -> Vec<usize> {
    let sum: u64 = frees.iter().sum();
    if sum == 0 || frees.is_empty() {
        return vec![0; frees.len()];
    }
    let mut credits: Vec<usize> = frees
        .iter()
        .map(|f| (total as u64 * f / sum) as usize)
        .collect();
    let spent: usize = credits.iter().sum();
    let len = credits.len();
    for k in 0..total - spent {
        credits[k % len] += 1;
    }
    credits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_split_normalizes() {
        let credits = credit_split(&[100, 100, 50], MDC_TBL_SZ);
        assert_eq!(credits, vec![410, 410, 204]);
        assert_eq!(credits.iter().sum::<usize>(), MDC_TBL_SZ);
    }

    #[test]
    fn credit_split_degenerate() {
        assert_eq!(credit_split(&[], MDC_TBL_SZ), Vec::<usize>::new());
        assert_eq!(credit_split(&[0, 0], MDC_TBL_SZ), vec![0, 0]);
        assert_eq!(credit_split(&[7], MDC_TBL_SZ), vec![MDC_TBL_SZ]);
    }

    #[test]
    fn interleave_spreads_slots() {
        // Mirror the placement loop over a plain buffer.
        let members = [(1usize, 100u64), (2, 100), (3, 50)];
        let frees: Vec<u64> = members.iter().map(|(_, f)| *f).collect();
        let mut rem = credit_split(&frees, MDC_TBL_SZ);
        let mut tbl = vec![0u8; MDC_TBL_SZ];
        let mut idx = 0;
        while idx < MDC_TBL_SZ {
            for (i, (slot, _)) in members.iter().enumerate() {
                if rem[i] > 0 && idx < MDC_TBL_SZ {
                    tbl[idx] = *slot as u8;
                    rem[i] -= 1;
                    idx += 1;
                }
            }
        }

        for (slot, credits) in [(1u8, 410usize), (2, 410), (3, 204)] {
            assert_eq!(tbl.iter().filter(|e| **e == slot).count(), credits);
        }
        // Interleaving keeps same-slot runs short.
        let max_run = MDC_TBL_SZ.div_ceil(204);
        let mut run = 1;
        for w in tbl.windows(2) {
            run = if w[0] == w[1] { run + 1 } else { 1 };
            assert!(run <= max_run, "slot {} repeats {} times", w[1], run);
        }
    }
}
