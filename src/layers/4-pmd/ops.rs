// SPDX-License-Identifier: MPL-2.0

//! Object operations: allocate, commit, abort, delete, erase, reference
//! counting and lookup, plus the asynchronous erase pipeline.
//!
//! Every mutation either persists its log record and then updates memory,
//! or reverts memory and returns the log error; a failure never leaves a
//! half-visible object.
use core::sync::atomic::Ordering;
use std::{collections::VecDeque, time::Duration};

use super::{
    layout::Layout,
    mpool::{Mpool, PmdCore, PoolPd},
    objid::{ObjId, ObjType},
};
use crate::{
    layers::{
        omf::MdcRec,
        pd::{sb, Mclass},
        smap::SpcType,
    },
    os::{self, Condvar, JoinHandle, Mutex, RwLock, Vec},
    prelude::*,
    util::roundup_pow2,
};

/// Bound on the alloc-path wait for asynchronous erases.
const ALLOC_RETRY_MAX: usize = 1024;
/// Largest zone alignment requested from the space map.
const SMAP_ALIGN_MAX: u32 = 4;
/// Workers servicing the erase queue.
const ERASE_WORKERS: usize = 2;

impl PmdCore {
    /// Picks the slot for a new allocation from the credit-weighted table.
    fn next_alloc_slot(&self) -> Result<usize> {
        let slotvcnt = self.slotvcnt();
        if slotvcnt < 2 {
            return_errno_with_msg!(NoSpace, "no user MDC exists");
        }
        let i = self.rotor.fetch_add(1, Ordering::Relaxed) & (super::MDC_TBL_SZ - 1);
        let entry = self.mds_tbl[i].load(Ordering::Relaxed) as usize;
        if entry >= 1 && entry < slotvcnt {
            Ok(entry)
        } else {
            Ok(1 + i % (slotvcnt - 1))
        }
    }

    /// Mints a fresh objid.
    ///
    /// An id on a checkpoint boundary is persisted (OIDCKPT) before it is
    /// returned, so a crash can never re-mint an id that was already handed
    /// out. The fast path stays on the uniq-lock; the boundary path takes
    /// the compact-lock first, per the lock hierarchy.
    pub(crate) fn alloc_idgen(&self, otype: ObjType) -> Result<ObjId> {
        let slot = self.next_alloc_slot()?;
        let sl = &self.slots[slot];

        {
            let mut uq = sl.uqlock.lock();
            let uniq = uq.luniq + 1;
            let id = ObjId::make(uniq, otype, slot as u8);
            if !id.is_ckpt() {
                uq.luniq = uniq;
                return Ok(id);
            }
        }

        // The boundary is crossed only here, under the compact-lock, so the
        // recomputed uniq cannot run past it concurrently.
        let mut info = sl.compactlock.lock();
        loop {
            let uniq = sl.uqlock.lock().luniq + 1;
            let id = ObjId::make(uniq, otype, slot as u8);
            if !id.is_ckpt() {
                let mut uq = sl.uqlock.lock();
                if uq.luniq + 1 == uniq {
                    uq.luniq = uniq;
                    return Ok(id);
                }
                continue;
            }

            self.mdc_addrec_locked(
                slot,
                &mut info,
                &MdcRec::OIdCkpt {
                    objid: id.as_raw(),
                },
            )?;
            let mut uq = sl.uqlock.lock();
            uq.luniq = uniq;
            uq.lckpt = id;
            return Ok(id);
        }
    }

    pub(crate) fn obj_alloc(
        &self,
        otype: ObjType,
        capacity: u64,
        mclass: Mclass,
    ) -> Result<Arc<Layout>> {
        if capacity == 0 {
            return_errno_with_msg!(InvalidArgs, "zero-capacity object");
        }
        let objid = self.alloc_idgen(otype)?;
        self.alloc_layout(objid, capacity, mclass)
    }

    pub(crate) fn obj_realloc(
        &self,
        objid: ObjId,
        capacity: u64,
        mclass: Mclass,
    ) -> Result<Arc<Layout>> {
        objid.otype()?;
        let slot = objid.slot() as usize;
        if slot == 0 || slot >= self.slotvcnt() {
            return_errno_with_msg!(InvalidArgs, "objid names no user MDC");
        }
        if capacity == 0 {
            return_errno_with_msg!(InvalidArgs, "zero-capacity object");
        }
        if objid.uniq() > self.slots[slot].uqlock.lock().luniq {
            return_errno_with_msg!(InvalidArgs, "objid uniq beyond the slot high-water");
        }
        self.alloc_layout(objid, capacity, mclass)
    }

    /// Places the object on a drive and indexes it uncommitted.
    ///
    /// Falls back across media classes from the requested one upward, and
    /// waits out asynchronous erases with a bounded retry, periodically
    /// flushing the erase queue along the way.
    fn alloc_layout(&self, objid: ObjId, capacity: u64, mclass: Mclass) -> Result<Arc<Layout>> {
        let slot = objid.slot() as usize;
        let pdv = self.pdv.read();

        let mut placed = None;
        'retry: for attempt in 0..ALLOC_RETRY_MAX {
            for cls in mclass.walk_from() {
                let cand: Vec<usize> = pdv
                    .iter()
                    .enumerate()
                    .filter(|(_, pp)| pp.pd.is_available() && pp.pd.props().mclass == cls)
                    .map(|(i, _)| i)
                    .collect();
                if cand.is_empty() {
                    continue;
                }
                let start = self.mclass_rotor[cls as usize].fetch_add(1, Ordering::Relaxed);
                for k in 0..cand.len() {
                    let pdi = cand[(start + k) % cand.len()];
                    let pp = &pdv[pdi];
                    let zone_bytes = pp.pd.zone_bytes();
                    let zcnt = capacity.div_ceil(zone_bytes).max(1) as u32;
                    let align = roundup_pow2(zcnt.min(SMAP_ALIGN_MAX));
                    if let Ok(zaddr) = pp.smap.alloc(zcnt, SpcType::Usable, align) {
                        placed = Some((pdi, zaddr, zcnt, zone_bytes));
                        break 'retry;
                    }
                }
            }

            // Space may come back when in-flight erases complete.
            if self.erase_q.is_idle() {
                break;
            }
            if (attempt + 1) % (ALLOC_RETRY_MAX / 8) == 0 {
                self.erase_q.flush();
            }
            os::sleep(Duration::from_micros(128 + (attempt as u64 & 127)));
        }

        let Some((pdi, zaddr, zcnt, zone_bytes)) = placed else {
            return_errno_with_msg!(NoSpace, "no usable zones in any acceptable class");
        };

        let layout = Layout::new(
            objid,
            pdv[pdi].pd.uuid(),
            pdi,
            zaddr,
            zcnt,
            zone_bytes,
            0,
            false,
            2,
        );
        {
            let mut unc = self.slots[slot].uncolock.lock();
            if unc.contains_key(&objid) {
                pdv[pdi].smap.free(zaddr, zcnt);
                return_errno_with_msg!(Exists, "objid is already allocated");
            }
            unc.insert(objid, layout.clone());
        }
        self.slots[slot].stats_add(&layout, false, 1);
        Ok(layout)
    }

    /// Persists OCREATE and moves the layout from the uncommitted to the
    /// committed index.
    pub(crate) fn obj_commit(&self, layout: &Arc<Layout>) -> Result<()> {
        let objid = layout.objid();
        let slot = objid.slot() as usize;
        if slot == 0 || slot >= self.slotvcnt() {
            return_errno_with_msg!(InvalidArgs, "objid names no user MDC");
        }

        let sl = &self.slots[slot];
        let mut info = sl.compactlock.lock();
        if layout.is_del() {
            return_errno_with_msg!(Gone, "object is being deleted");
        }
        if layout.is_committed() {
            return_errno_with_msg!(InvalidArgs, "object is already committed");
        }
        if !sl.uncolock.lock().contains_key(&objid) {
            return_errno_with_msg!(NotFound, "object is not allocated");
        }

        // Log first; the layout stays uncommitted (and retryable) if the
        // append fails.
        self.mdc_addrec_locked(slot, &mut info, &MdcRec::OCreate(layout.desc()))?;

        layout.set_committed(true);
        {
            let mut obj = sl.colock.write();
            let mut unc = sl.uncolock.lock();
            unc.remove(&objid);
            if obj.contains_key(&objid) {
                error!("commit found {} already in the committed index", objid);
                layout.set_committed(false);
                unc.insert(objid, layout.clone());
                return_errno_with_msg!(Exists, "objid is already committed");
            }
            obj.insert(objid, layout.clone());
        }
        sl.stats_add(layout, false, -1);
        sl.stats_add(layout, true, 1);
        sl.pco.bump(&sl.pco.cr);
        sl.pco.cobj.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Discards an uncommitted object and hands it to the erase pipeline.
    pub(crate) fn obj_abort(&self, layout: &Arc<Layout>) -> Result<()> {
        let objid = layout.objid();
        let slot = objid.slot() as usize;
        if slot == 0 || slot >= self.slotvcnt() {
            return_errno_with_msg!(InvalidArgs, "objid names no user MDC");
        }

        let sl = &self.slots[slot];
        {
            let mut unc = sl.uncolock.lock();
            let _r = sl.reflock.lock();
            if layout.is_committed() {
                return_errno_with_msg!(InvalidArgs, "object is committed, delete it instead");
            }
            if layout.is_del() {
                return_errno_with_msg!(Gone, "object is being deleted");
            }
            if layout.refcnt() > 2 {
                return_errno_with_msg!(Busy, "object has outstanding references");
            }
            layout.set_del(true);
            layout.set_removed(true);
            layout.ref_reset();
            unc.remove(&objid);
        }
        sl.stats_add(layout, false, -1);
        self.erase_q.enqueue(layout.clone());
        Ok(())
    }

    /// Persists ODELETE, drops the object from the committed index and
    /// hands it to the erase pipeline.
    pub(crate) fn obj_delete(&self, layout: &Arc<Layout>) -> Result<()> {
        let objid = layout.objid();
        let slot = objid.slot() as usize;
        if slot == 0 || slot >= self.slotvcnt() {
            return_errno_with_msg!(InvalidArgs, "objid names no user MDC");
        }

        let sl = &self.slots[slot];
        let mut info = sl.compactlock.lock();
        {
            let _r = sl.reflock.lock();
            if !layout.is_committed() {
                return_errno_with_msg!(InvalidArgs, "object is not committed");
            }
            if layout.is_del() || layout.is_removed() {
                return_errno_with_msg!(Gone, "object is already being deleted");
            }
            if layout.refcnt() > 2 {
                return_errno_with_msg!(Busy, "object has outstanding references");
            }
            layout.set_del(true);
            layout.set_removed(true);
        }

        if let Err(e) = self.mdc_addrec_locked(
            slot,
            &mut info,
            &MdcRec::ODelete {
                objid: objid.as_raw(),
            },
        ) {
            // Revert: the object stays visible.
            let _r = sl.reflock.lock();
            layout.set_del(false);
            layout.set_removed(false);
            return Err(e);
        }

        sl.colock.write().remove(&objid);
        sl.stats_add(layout, true, -1);
        sl.pco.bump(&sl.pco.del);
        sl.pco.cobj.fetch_sub(1, Ordering::Relaxed);
        self.erase_q.enqueue(layout.clone());
        Ok(())
    }

    /// Records a new generation for an erased mlog.
    ///
    /// An mlog backing MDC0 has its generation in the superblock image (the
    /// caller, MDC0's compactor, already holds MDC0's compact-lock); every
    /// other mlog is recorded by an OERASE in its owning MDC.
    pub(crate) fn obj_erase(&self, layout: &Arc<Layout>, new_gen: u64) -> Result<()> {
        if layout.otype() != ObjType::Mlog {
            return_errno_with_msg!(InvalidArgs, "only mlogs carry generations");
        }
        if !layout.is_committed() {
            return_errno_with_msg!(InvalidArgs, "object is not committed");
        }
        if new_gen <= layout.gen() {
            return_errno_with_msg!(InvalidArgs, "generation must increase");
        }

        let objid = layout.objid();
        if objid.is_mdc0_log() {
            let mut sb_img = self.sb.lock();
            let locs = sb_img
                .mdc0
                .as_mut()
                .ok_or(Error::with_msg(Critical, "superblock image lost MDC0"))?;
            locs[(objid.uniq() & 1) as usize].gen = new_gen;
            let pdv = self.pdv.read();
            let pp = &pdv[self.mdc0_pdi.load(Ordering::Acquire)];
            sb::write_update(pp.pd.dev()?.as_ref(), &sb_img)?;
            layout.set_gen(new_gen);
        } else {
            let slot = objid.slot() as usize;
            let mut info = self.slots[slot].compactlock.lock();
            self.mdc_addrec_locked(
                slot,
                &mut info,
                &MdcRec::OErase {
                    objid: objid.as_raw(),
                    gen: new_gen,
                },
            )?;
            layout.set_gen(new_gen);
            self.slots[slot].pco.bump(&self.slots[slot].pco.er);
        }
        Ok(())
    }

    /// Takes a reference on a visible object.
    pub(crate) fn obj_get(&self, layout: &Arc<Layout>) -> Result<()> {
        let sl = &self.slots[layout.objid().slot() as usize];
        let _r = sl.reflock.lock();
        if layout.is_del() {
            return_errno_with_msg!(Gone, "object is being deleted");
        }
        layout.ref_inc();
        Ok(())
    }

    /// Releases a reference taken by [`PmdCore::obj_get`].
    ///
    /// The final reference belongs to the erase worker and is never dropped
    /// here.
    pub(crate) fn obj_put(&self, layout: &Arc<Layout>) -> Result<()> {
        let sl = &self.slots[layout.objid().slot() as usize];
        let _r = sl.reflock.lock();
        if layout.is_del() {
            return_errno_with_msg!(Gone, "object is being deleted");
        }
        if layout.refcnt() <= 1 {
            return_errno_with_msg!(InvalidArgs, "put without a matching get");
        }
        layout.ref_dec();
        Ok(())
    }

    /// Finds an object by id in the committed then uncommitted index and
    /// takes a reference on it.
    pub(crate) fn obj_find_get(&self, objid: ObjId) -> Result<Arc<Layout>> {
        let slot = objid.slot() as usize;
        if slot >= self.slotvcnt() {
            return_errno_with_msg!(NotFound, "objid names no visible MDC");
        }
        let sl = &self.slots[slot];

        let found = {
            let obj = sl.colock.read();
            obj.get(&objid).cloned()
        };
        let found = match found {
            Some(layout) => Some(layout),
            None => sl.uncolock.lock().get(&objid).cloned(),
        };
        let Some(layout) = found else {
            return_errno_with_msg!(NotFound, "no such object");
        };
        self.obj_get(&layout)?;
        Ok(layout)
    }
}

impl Mpool {
    /// Allocates a new object of the given type and capacity on the given
    /// media class (falling back to faster classes when it is full).
    pub fn obj_alloc(
        &self,
        otype: ObjType,
        capacity: u64,
        mclass: Mclass,
    ) -> Result<Arc<Layout>> {
        self.core.obj_alloc(otype, capacity, mclass)
    }

    /// Re-allocates an object with a caller-chosen id, which must belong to
    /// a user MDC and lie at or below the slot's allocation high-water.
    pub fn obj_realloc(
        &self,
        objid: ObjId,
        capacity: u64,
        mclass: Mclass,
    ) -> Result<Arc<Layout>> {
        self.core.obj_realloc(objid, capacity, mclass)
    }

    pub fn obj_commit(&self, layout: &Arc<Layout>) -> Result<()> {
        self.core.obj_commit(layout)
    }

    pub fn obj_abort(&self, layout: &Arc<Layout>) -> Result<()> {
        self.core.obj_abort(layout)
    }

    pub fn obj_delete(&self, layout: &Arc<Layout>) -> Result<()> {
        self.core.obj_delete(layout)
    }

    pub fn obj_erase(&self, layout: &Arc<Layout>, new_gen: u64) -> Result<()> {
        self.core.obj_erase(layout, new_gen)
    }

    pub fn obj_get(&self, layout: &Arc<Layout>) -> Result<()> {
        self.core.obj_get(layout)
    }

    pub fn obj_put(&self, layout: &Arc<Layout>) -> Result<()> {
        self.core.obj_put(layout)
    }

    pub fn obj_find_get(&self, objid: ObjId) -> Result<Arc<Layout>> {
        self.core.obj_find_get(objid)
    }
}

struct EqState {
    queue: VecDeque<Arc<Layout>>,
    inflight: usize,
    stop: bool,
}

struct EqShared {
    pdv: Arc<RwLock<Vec<PoolPd>>>,
    state: Mutex<EqState>,
    work_cv: Condvar,
    idle_cv: Condvar,
}

/// The asynchronous erase pipeline.
///
/// Delete and abort hand the last reference of a layout here; a worker
/// erases the underlying zones (mandatory for mblocks, advisory for mlogs)
/// and returns the space to the drive's space map.
pub(crate) struct EraseQueue {
    shared: Arc<EqShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EraseQueue {
    pub fn new(pdv: Arc<RwLock<Vec<PoolPd>>>) -> Self {
        Self {
            shared: Arc::new(EqShared {
                pdv,
                state: Mutex::new(EqState {
                    queue: VecDeque::new(),
                    inflight: 0,
                    stop: false,
                }),
                work_cv: Condvar::new(),
                idle_cv: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for _ in 0..ERASE_WORKERS {
            let shared = self.shared.clone();
            workers.push(os::spawn(move || worker_loop(&shared)));
        }
    }

    pub fn enqueue(&self, layout: Arc<Layout>) {
        let stopped = {
            let mut state = self.shared.state.lock();
            if !state.stop {
                state.queue.push_back(layout.clone());
            }
            state.stop
        };
        if stopped {
            // No workers anymore, erase synchronously.
            erase_one(&self.shared.pdv, &layout);
        } else {
            self.shared.work_cv.notify_one();
        }
    }

    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.queue.is_empty() && state.inflight == 0
    }

    /// Waits until every queued erase has completed.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        while !(state.queue.is_empty() && state.inflight == 0) {
            state = self.shared.idle_cv.wait(state);
        }
    }

    /// Drains the queue, stops the workers and joins them.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
        }
        self.shared.work_cv.notify_all();
        let workers = {
            let mut workers = self.workers.lock();
            core::mem::take(&mut *workers)
        };
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &EqShared) {
    loop {
        let layout = {
            let mut state = shared.state.lock();
            loop {
                if let Some(layout) = state.queue.pop_front() {
                    state.inflight += 1;
                    break Some(layout);
                }
                if state.stop {
                    break None;
                }
                state = shared.work_cv.wait(state);
            }
        };
        let Some(layout) = layout else {
            return;
        };

        erase_one(&shared.pdv, &layout);

        let mut state = shared.state.lock();
        state.inflight -= 1;
        if state.queue.is_empty() && state.inflight == 0 {
            shared.idle_cv.notify_all();
        }
    }
}

/// Erases one removed object and frees its zones.
///
/// Zone erasure is mandatory for mblocks and advisory for mlogs. The final
/// outstanding reference to the layout is released when it is dropped here.
fn erase_one(pdv: &RwLock<Vec<PoolPd>>, layout: &Arc<Layout>) {
    let pdv = pdv.read();
    let Some(pp) = pdv.get(layout.pdi()) else {
        return;
    };
    if layout.otype() == ObjType::Mblock && pp.pd.is_available() {
        // Exclude payload readers while the zones go blank.
        let _w = layout.payload_write();
        if let Err(e) = pp.pd.erase_zones(layout.zaddr(), layout.zcnt()) {
            warn!("erase of {} failed: {}", layout.objid(), e);
        }
    }
    pp.smap.free(layout.zaddr(), layout.zcnt());
}
