// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios over in-memory drives.
//!
//! Dropping an `Mpool` without deactivating it models a crash: the shared
//! `MemPd` storage survives and re-activation replays the metadata logs.
use uuid::Uuid;

use super::*;
use crate::{
    error::Errno,
    layers::pd::{sb, Mclass, MemPd, PdDev, PdDevType, PdProps},
    os::Arc,
};

const MIB: u64 = 1 << 20;

struct TestPd {
    mem: MemPd,
    props: PdProps,
}

impl TestPd {
    fn new(zonepg: u32, nzones: u64, mclass: Mclass) -> Self {
        let props = PdProps {
            uuid: Uuid::new_v4(),
            mclass,
            zonepg,
            sectorsz: 512,
            devtype: PdDevType::File,
            features: 0,
        };
        let mem = MemPd::new(props.zone_bytes() * nzones);
        Self { mem, props }
    }

    fn dev(&self) -> (Arc<dyn PdDev>, PdProps) {
        (Arc::new(self.mem.clone()), self.props.clone())
    }
}

fn small_cfg() -> MpoolCfg {
    MpoolCfg {
        mdcncap: 8192,
        ..MpoolCfg::default()
    }
}

#[test]
fn fresh_create_and_commit() {
    // One capacity-class drive with 1 MiB zones.
    let pd = TestPd::new(256, 64, Mclass::Capacity);
    let mp = Mpool::create(vec![pd.dev()], "mp0", MpoolCfg::default()).unwrap();

    let layout = mp.obj_alloc(ObjType::Mblock, 3 * MIB, Mclass::Capacity).unwrap();
    let objid = layout.objid();
    assert_eq!(objid.slot(), 1);
    assert_eq!(objid.uniq(), 1);
    assert_eq!(objid.otype().unwrap(), ObjType::Mblock);
    assert_eq!(layout.zcnt(), 3);
    assert_eq!(layout.alen(), 3 * MIB);

    mp.obj_commit(&layout).unwrap();
    assert!(layout.is_visible());

    let found = mp.obj_find_get(objid).unwrap();
    assert_eq!(found.objid(), objid);
    mp.obj_put(&found).unwrap();

    let usage = mp.mpool_usage();
    assert_eq!(usage.mblock_cnt, 1);
    assert_eq!(usage.mblock_alen, 3 * MIB);
    assert_eq!(usage.uncommitted_cnt, 0);

    mp.deactivate().unwrap();
}

#[test]
fn alloc_without_user_mdc_is_no_space() {
    let pd = TestPd::new(1, 64, Mclass::Capacity);
    let mp = Mpool::create(vec![pd.dev()], "mp0", small_cfg()).unwrap();

    // Hide the user MDCs to model the pre-seeded state.
    mp.core.slotvcnt.store(1, core::sync::atomic::Ordering::Release);
    let err = mp.obj_alloc(ObjType::Mblock, 4096, Mclass::Capacity).unwrap_err();
    assert_eq!(err.errno(), Errno::NoSpace);
}

#[test]
fn checkpoint_survives_crash() {
    let pd = TestPd::new(1, 2048, Mclass::Capacity);
    let mp = Mpool::create(vec![pd.dev()], "mp0", small_cfg()).unwrap();
    let nslots = mp.slotvcnt() - 1;
    assert_eq!(nslots, MDC_SET_SZ);

    // 257 allocations per slot; none committed.
    let total = (CKPT_DELTA as usize + 1) * nslots;
    let mut max_uniq = 0;
    let mut uncommitted = Vec::new();
    for _ in 0..total {
        let layout = mp.obj_alloc(ObjType::Mblock, 4096, Mclass::Capacity).unwrap();
        max_uniq = max_uniq.max(layout.objid().uniq());
        uncommitted.push(layout.objid());
    }
    assert_eq!(max_uniq, CKPT_DELTA + 1);

    // Crash.
    drop(mp);

    let mp = Mpool::activate(vec![pd.dev()], small_cfg()).unwrap();

    // The uniquifier restarts just above anything possibly handed out.
    for slot in 1..mp.slotvcnt() {
        let uq = mp.core.slots[slot].uqlock.lock();
        assert_eq!(uq.lckpt.uniq(), CKPT_DELTA);
        assert_eq!(uq.luniq, uq.lckpt.uniq() + CKPT_DELTA - 1);
    }

    // Uncommitted objects vanished with the crash.
    assert_eq!(mp.mpool_usage().uncommitted_cnt, 0);
    assert_eq!(
        mp.obj_find_get(uncommitted[0]).unwrap_err().errno(),
        Errno::NotFound
    );

    // Newly minted ids are strictly above every id handed out before.
    for _ in 0..nslots {
        let layout = mp.obj_alloc(ObjType::Mblock, 4096, Mclass::Capacity).unwrap();
        assert_eq!(layout.objid().uniq(), 2 * CKPT_DELTA);
        assert!(layout.objid().uniq() > max_uniq);
    }

    mp.deactivate().unwrap();
}

#[test]
fn commit_compacts_a_full_mdc() {
    let pd = TestPd::new(1, 1024, Mclass::Capacity);
    let mp = Mpool::create(vec![pd.dev()], "mp0", small_cfg()).unwrap();

    // Commit steadily while deleting older objects, so the log fills with
    // garbage and commits have to compact in-line.
    let mut live: Vec<Arc<Layout>> = Vec::new();
    for _ in 0..300 {
        let layout = mp.obj_alloc(ObjType::Mblock, 4096, Mclass::Capacity).unwrap();
        mp.obj_commit(&layout).unwrap();
        live.push(layout);
        if live.len() > 3 {
            let victim = live.remove(0);
            mp.obj_delete(&victim).unwrap();
        }
    }

    // Every commit succeeded; compactions must have happened for that.
    let (len, cap) = mp.mdc_cap();
    assert!(cap > 0 && len <= cap);

    // Compact the slot of the newest object and check the counter reset.
    let slot = live.last().unwrap().objid().slot() as usize;
    mp.core.compact_slot(slot).unwrap();
    let pco = &mp.core.slots[slot].pco;
    let cr = pco.cr.load(core::sync::atomic::Ordering::Relaxed);
    let cobj = pco.cobj.load(core::sync::atomic::Ordering::Relaxed);
    assert_eq!(cr, cobj);
    assert_eq!(pco.del.load(core::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(pco.er.load(core::sync::atomic::Ordering::Relaxed), 0);

    // Compaction is idempotent: a second pass re-emits the same records.
    let len_after_first = mp.core.slots[slot].pco.len.load(core::sync::atomic::Ordering::Relaxed);
    mp.core.compact_slot(slot).unwrap();
    let len_after_second = mp.core.slots[slot].pco.len.load(core::sync::atomic::Ordering::Relaxed);
    assert_eq!(len_after_first, len_after_second);

    // Full recovery reproduces exactly the live set.
    let live_ids: Vec<ObjId> = live.iter().map(|l| l.objid()).collect();
    drop(live);
    drop(mp);
    let mp = Mpool::activate(vec![pd.dev()], small_cfg()).unwrap();
    for objid in &live_ids {
        let found = mp.obj_find_get(*objid).unwrap();
        assert!(found.is_visible());
        mp.obj_put(&found).unwrap();
    }
    assert_eq!(mp.mpool_usage().mblock_cnt, live_ids.len() as u64);
    mp.deactivate().unwrap();
}

#[test]
fn zombie_drive_is_rejected() {
    let pd_a = TestPd::new(1, 256, Mclass::Capacity);
    let pd_b = TestPd::new(1, 256, Mclass::Capacity);
    let mp = Mpool::create(vec![pd_a.dev(), pd_b.dev()], "mp0", small_cfg()).unwrap();
    let uuid = mp.uuid();
    drop(mp);

    // A drive carrying this mpool's identity that MDC0 knows nothing about.
    let pd_c = TestPd::new(1, 256, Mclass::Capacity);
    sb::write_update(
        &pd_c.mem,
        &sb::SbImage::new(uuid, "mp0".to_string(), None),
    )
    .unwrap();

    let err = Mpool::activate(vec![pd_a.dev(), pd_b.dev(), pd_c.dev()], small_cfg()).unwrap_err();
    assert_eq!(err.errno(), Errno::Zombie);
    assert_eq!(err.rpt.pd_uuid, Some(pd_c.props.uuid));
}

#[test]
fn missing_drive_goes_unavail() {
    let pd_a = TestPd::new(1, 256, Mclass::Capacity);
    let pd_b = TestPd::new(1, 256, Mclass::Staging);
    let mp = Mpool::create(vec![pd_a.dev(), pd_b.dev()], "mp0", small_cfg()).unwrap();
    drop(mp);

    // Activating without the staging drive marks it unavailable.
    let mp = Mpool::activate(vec![pd_a.dev()], small_cfg()).unwrap();
    let props = mp.pd_props();
    assert_eq!(props.len(), 2);
    let missing = props
        .iter()
        .find(|(p, _)| p.uuid == pd_b.props.uuid)
        .unwrap();
    assert_eq!(missing.1, crate::layers::pd::PdState::Unavail);
    mp.deactivate().unwrap();
}

#[test]
fn too_many_missing_drives_fail_activation() {
    let pd_a = TestPd::new(1, 256, Mclass::Capacity);
    let pd_b = TestPd::new(1, 256, Mclass::Capacity);
    let pd_c = TestPd::new(1, 256, Mclass::Staging);
    let mp = Mpool::create(vec![pd_a.dev(), pd_b.dev(), pd_c.dev()], "mp0", small_cfg()).unwrap();
    // MDC0 must live on drive A for the test to offer it alone.
    assert_eq!(mp.core.pdv.read()[mp.core.mdc0_pdi.load(core::sync::atomic::Ordering::Acquire)]
        .pd
        .uuid(), pd_a.props.uuid);
    drop(mp);

    let err = Mpool::activate(vec![pd_a.dev()], small_cfg()).unwrap_err();
    assert_eq!(err.errno(), Errno::InsufficientGood);
}

#[test]
fn changed_drive_parameters_mismatch() {
    let pd_a = TestPd::new(1, 256, Mclass::Capacity);
    let pd_b = TestPd::new(1, 256, Mclass::Capacity);
    let mp = Mpool::create(vec![pd_a.dev(), pd_b.dev()], "mp0", small_cfg()).unwrap();
    let mdc0_uuid = {
        let pdv = mp.core.pdv.read();
        pdv[mp.core.mdc0_pdi.load(core::sync::atomic::Ordering::Acquire)]
            .pd
            .uuid()
    };
    drop(mp);

    // Tamper with the reported sector size of the non-MDC0 drive.
    let (tampered, intact) = if mdc0_uuid == pd_a.props.uuid {
        (&pd_b, &pd_a)
    } else {
        (&pd_a, &pd_b)
    };
    let mut props = tampered.props.clone();
    props.sectorsz = 4096;

    let err = Mpool::activate(
        vec![intact.dev(), (Arc::new(tampered.mem.clone()), props)],
        small_cfg(),
    )
    .unwrap_err();
    assert_eq!(err.errno(), Errno::ParmMismatch);
    assert_eq!(err.rpt.pd_uuid, Some(tampered.props.uuid));
}

#[test]
fn parallel_load_reports_the_corrupt_mdc() {
    let pd = TestPd::new(1, 1024, Mclass::Capacity);
    let mut cfg = small_cfg();
    cfg.objloadjobs = 4;
    let mp = Mpool::create(vec![pd.dev()], "mp0", cfg.clone()).unwrap();
    mp.mdc_alloc().unwrap();
    assert_eq!(mp.slotvcnt(), 9);

    // Corrupt one mlog of MDC3 right at its head.
    let (zaddr, zone_bytes) = {
        let objs = mp.core.slots[0].colock.read();
        let layout = objs.get(&ObjId::logid_make(6, 0)).unwrap();
        (layout.zaddr(), layout.alen() / layout.zcnt() as u64)
    };
    drop(mp);
    pd.mem
        .write_at(zaddr * zone_bytes, &0x7fff_ffffu32.to_le_bytes())
        .unwrap();

    let err = Mpool::activate(vec![pd.dev()], cfg).unwrap_err();
    assert_eq!(err.errno(), Errno::Corrupt);
    assert_eq!(err.rpt.mdc, Some(3));
}

#[test]
fn concurrent_deletes_settle_to_one_winner() {
    let pd = TestPd::new(1, 512, Mclass::Capacity);
    let mp = Arc::new(Mpool::create(vec![pd.dev()], "mp0", small_cfg()).unwrap());

    let layout = mp.obj_alloc(ObjType::Mblock, 4096, Mclass::Capacity).unwrap();
    mp.obj_commit(&layout).unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let mp = mp.clone();
        let layout = layout.clone();
        handles.push(crate::os::spawn(move || mp.obj_delete(&layout)));
    }
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    let loser = results.iter().find(|r| r.is_err()).unwrap();
    let errno = loser.as_ref().unwrap_err().errno();
    assert!(errno == Errno::Gone || errno == Errno::Busy);

    // P10: the deleted object is gone from every index.
    assert_eq!(
        mp.obj_find_get(layout.objid()).unwrap_err().errno(),
        Errno::NotFound
    );
}

#[test]
fn refcounts_gate_delete_and_put() {
    let pd = TestPd::new(1, 512, Mclass::Capacity);
    let mp = Mpool::create(vec![pd.dev()], "mp0", small_cfg()).unwrap();

    let layout = mp.obj_alloc(ObjType::Mblock, 4096, Mclass::Capacity).unwrap();
    mp.obj_commit(&layout).unwrap();

    // A reader holds the object; delete must back off.
    let reader = mp.obj_find_get(layout.objid()).unwrap();
    assert_eq!(mp.obj_delete(&layout).unwrap_err().errno(), Errno::Busy);
    mp.obj_put(&reader).unwrap();
    mp.obj_delete(&layout).unwrap();

    assert_eq!(mp.obj_get(&layout).unwrap_err().errno(), Errno::Gone);
    mp.deactivate().unwrap();
}

#[test]
fn abort_returns_space() {
    let pd = TestPd::new(1, 512, Mclass::Capacity);
    let mp = Mpool::create(vec![pd.dev()], "mp0", small_cfg()).unwrap();
    let before = mp.mpool_usage().usable_free;

    let layout = mp.obj_alloc(ObjType::Mblock, 16 * 4096, Mclass::Capacity).unwrap();
    assert!(mp.mpool_usage().usable_free < before);
    mp.obj_abort(&layout).unwrap();
    mp.core.erase_q.flush();

    assert_eq!(mp.mpool_usage().usable_free, before);
    assert_eq!(mp.mpool_usage().uncommitted_cnt, 0);
    mp.deactivate().unwrap();
}

#[test]
fn delete_returns_space_through_erase_worker() {
    let pd = TestPd::new(1, 512, Mclass::Capacity);
    let mp = Mpool::create(vec![pd.dev()], "mp0", small_cfg()).unwrap();
    let before = mp.mpool_usage().usable_free;

    let layout = mp.obj_alloc(ObjType::Mblock, 8 * 4096, Mclass::Capacity).unwrap();
    mp.obj_commit(&layout).unwrap();
    mp.obj_delete(&layout).unwrap();
    mp.core.erase_q.flush();

    assert_eq!(mp.mpool_usage().usable_free, before);
    mp.deactivate().unwrap();
}

#[test]
fn mlog_erase_generation_survives_recovery() {
    let pd = TestPd::new(1, 512, Mclass::Capacity);
    let mp = Mpool::create(vec![pd.dev()], "mp0", small_cfg()).unwrap();

    let layout = mp.obj_alloc(ObjType::Mlog, 4096, Mclass::Capacity).unwrap();
    mp.obj_commit(&layout).unwrap();
    let objid = layout.objid();

    mp.obj_erase(&layout, 3).unwrap();
    assert_eq!(layout.gen(), 3);
    assert_eq!(mp.obj_erase(&layout, 3).unwrap_err().errno(), Errno::InvalidArgs);
    drop(layout);
    drop(mp);

    let mp = Mpool::activate(vec![pd.dev()], small_cfg()).unwrap();
    let found = mp.obj_find_get(objid).unwrap();
    assert_eq!(found.gen(), 3);
    mp.obj_put(&found).unwrap();
    mp.deactivate().unwrap();
}

#[test]
fn realloc_validates_the_id() {
    let pd = TestPd::new(1, 512, Mclass::Capacity);
    let mp = Mpool::create(vec![pd.dev()], "mp0", small_cfg()).unwrap();

    let layout = mp.obj_alloc(ObjType::Mblock, 4096, Mclass::Capacity).unwrap();
    let objid = layout.objid();

    // The id is still allocated.
    assert_eq!(
        mp.obj_realloc(objid, 4096, Mclass::Capacity).unwrap_err().errno(),
        Errno::Exists
    );

    mp.obj_abort(&layout).unwrap();
    mp.core.erase_q.flush();
    let layout = mp.obj_realloc(objid, 4096, Mclass::Capacity).unwrap();
    assert_eq!(layout.objid(), objid);

    // Ids beyond the slot's high-water are refused.
    let bogus = ObjId::make(1 << 20, ObjType::Mblock, objid.slot());
    assert_eq!(
        mp.obj_realloc(bogus, 4096, Mclass::Capacity).unwrap_err().errno(),
        Errno::InvalidArgs
    );
}

#[test]
fn properties_persist_across_activation() {
    let pd = TestPd::new(1, 512, Mclass::Capacity);
    let mp = Mpool::create(vec![pd.dev()], "mp0", small_cfg()).unwrap();

    mp.prop_mcspare(Mclass::Capacity, 10).unwrap();
    mp.prop_mpconfig("renamed").unwrap();
    mp.deactivate().unwrap();

    let mp = Mpool::activate(vec![pd.dev()], small_cfg()).unwrap();
    assert_eq!(mp.spzone_pct(Mclass::Capacity), 10);
    assert_eq!(mp.mp_desc().name, "renamed");
    mp.deactivate().unwrap();
}

#[test]
fn class_fallback_walks_upward() {
    // The capacity drive is tiny; big objects must fall back to staging.
    let pd_cap = TestPd::new(1, 64, Mclass::Capacity);
    let pd_stg = TestPd::new(1, 512, Mclass::Staging);
    let mp = Mpool::create(vec![pd_cap.dev(), pd_stg.dev()], "mp0", small_cfg()).unwrap();

    let layout = mp.obj_alloc(ObjType::Mblock, 128 * 4096, Mclass::Capacity).unwrap();
    assert_eq!(layout.pd_uuid(), pd_stg.props.uuid);

    // An impossible size fails with NoSpace after both classes refuse.
    assert_eq!(
        mp.obj_alloc(ObjType::Mblock, 4096 * 4096, Mclass::Capacity)
            .unwrap_err()
            .errno(),
        Errno::NoSpace
    );
    mp.deactivate().unwrap();
}

#[test]
fn precompact_tick_compacts_garbage() {
    let pd = TestPd::new(1, 1024, Mclass::Capacity);
    let mut cfg = small_cfg();
    cfg.pcopctfull = 10;
    cfg.pcopctgarbage = 10;
    let mp = Mpool::create(vec![pd.dev()], "mp0", cfg).unwrap();

    // Build up garbage records by committing and deleting.
    let mut target_slot = 0;
    for _ in 0..160 {
        let layout = mp.obj_alloc(ObjType::Mblock, 4096, Mclass::Capacity).unwrap();
        mp.obj_commit(&layout).unwrap();
        target_slot = layout.objid().slot() as usize;
        mp.obj_delete(&layout).unwrap();
    }

    // Tick until the round-robin reaches the slot we dirtied.
    for _ in 0..MDC_SET_SZ {
        mp.core.precompact_tick();
    }

    let pco = &mp.core.slots[target_slot].pco;
    assert_eq!(pco.del.load(core::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(
        pco.cr.load(core::sync::atomic::Ordering::Relaxed),
        pco.cobj.load(core::sync::atomic::Ordering::Relaxed)
    );
    mp.deactivate().unwrap();
}

#[test]
fn precompact_task_starts_and_stops() {
    let pd = TestPd::new(1, 512, Mclass::Capacity);
    let mut cfg = small_cfg();
    cfg.pcoperiod = 1;
    let mp = Mpool::create(vec![pd.dev()], "mp0", cfg).unwrap();

    mp.precompact_start();
    mp.precompact_start(); // idempotent
    mp.precompact_stop();
    mp.precompact_stop();
    mp.deactivate().unwrap();
}

#[test]
fn mdc_alloc_extends_the_pool() {
    let pd = TestPd::new(1, 1024, Mclass::Capacity);
    let mp = Mpool::create(vec![pd.dev()], "mp0", small_cfg()).unwrap();
    assert_eq!(mp.slotvcnt(), 1 + MDC_SET_SZ);

    let created = mp.mdc_alloc().unwrap();
    assert_eq!(created, MDC_SET_SZ);
    assert_eq!(mp.slotvcnt(), 1 + 2 * MDC_SET_SZ);

    // The new MDCs survive recovery.
    drop(mp);
    let mp = Mpool::activate(vec![pd.dev()], small_cfg()).unwrap();
    assert_eq!(mp.slotvcnt(), 1 + 2 * MDC_SET_SZ);
    mp.deactivate().unwrap();
}
