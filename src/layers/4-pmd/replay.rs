// SPDX-License-Identifier: MPL-2.0

//! Activation-time recovery: replaying the MDC logs back into memory.
//!
//! MDC0 is replayed twice. The first pass reads only property records and
//! stages the drive set (MCCONFIG is last-wins per drive UUID) so it can be
//! reconciled against the drives offered by the caller. The second pass
//! replays object records and rebuilds the index of MDC-backing mlogs, from
//! which the user MDCs are then loaded in parallel.
use core::sync::atomic::{AtomicUsize, Ordering};

use uuid::Uuid;

use super::{
    layout::Layout,
    mpool::{ActivateErr, BootInfo, MpProps, MpoolCfg, PmdCore, PoolPd},
    objid::{ObjId, CKPT_DELTA},
    slot::MdcInfo,
};
use crate::{
    layers::{
        mdc::{Mdc, Mlog},
        omf::{self, LayoutDesc, MdcCver, MdcRec, MpDesc, MAX_REC_LEN},
        pd::{Mclass, Pd, PdDev, PdProps},
    },
    os::{self, HashMap, Mutex, Vec},
    prelude::*,
};

/// Default spare percentage when MDC0 carries no MCSPARE for a class.
const DEFAULT_SPZONE_PCT: u8 = 2;

/// Drive and property state staged from the MDC0 property pass.
struct StagedProps {
    /// Last-wins MCCONFIG per drive UUID.
    drives: HashMap<Uuid, omf::PdDesc>,
    spares: [Option<u8>; Mclass::COUNT],
    version: Option<MdcCver>,
    mpdesc: Option<MpDesc>,
}

/// Replays MDC0 for properties only, skipping object records.
fn replay_mdc0_props(mdc: &mut Mdc, recbuf: &mut [u8]) -> Result<StagedProps> {
    let mut staged = StagedProps {
        drives: HashMap::new(),
        spares: [None; Mclass::COUNT],
        version: None,
        mpdesc: None,
    };

    mdc.rewind();
    let mut first = true;
    loop {
        let len = mdc.read(recbuf)?;
        if len == 0 {
            break;
        }
        match omf::unpack(&recbuf[..len])? {
            MdcRec::Version(v) => {
                if !first {
                    return_errno_with_msg!(Corrupt, "VERSION record is not first");
                }
                if v > MdcCver::LATEST {
                    return_errno_with_msg!(Unsupported, "metadata is newer than this binary");
                }
                staged.version = Some(v);
            }
            MdcRec::McConfig(desc) => {
                staged.drives.insert(desc.props.uuid, desc);
            }
            MdcRec::McSpare { mclass, spzone_pct } => {
                let Some(i) = Mclass::from_index(mclass as usize) else {
                    return_errno_with_msg!(Corrupt, "MCSPARE names no media class");
                };
                staged.spares[i as usize] = Some(spzone_pct.min(100));
            }
            MdcRec::MpConfig(desc) => staged.mpdesc = Some(desc),
            rec if rec.is_obj_rec() => (),
            _ => unreachable!(),
        }
        first = false;
    }
    Ok(staged)
}

/// Builds the activated core: opens MDC0, replays its properties, reconciles
/// the drive list, initializes the space maps, replays MDC0's object records
/// and validates the MDC set.
pub(crate) fn activate_core(
    devs: Vec<(Arc<dyn PdDev>, PdProps)>,
    cfg: MpoolCfg,
    boot: BootInfo,
) -> core::result::Result<Arc<PmdCore>, ActivateErr> {
    // Open MDC0 from the superblock locations.
    let locs = boot.sb_img.mdc0.expect("boot info carries MDC0");
    let (mdc0_dev, mdc0_props) = &devs[boot.mdc0_dev];
    let zb = mdc0_props.zone_bytes();
    let open_log = |loc: &crate::layers::pd::sb::SbMdcLoc| {
        Mlog::open(mdc0_dev.clone(), loc.zaddr * zb, loc.zcnt as u64 * zb)
    };
    let mut mdc = (|| {
        Mdc::open(open_log(&locs[0])?, locs[0].gen, open_log(&locs[1])?, locs[1].gen)
    })()
    .map_err(|e| ActivateErr::with_mdc(e, 0))?;

    // Pass 1: properties.
    let mut recbuf = vec![0u8; MAX_REC_LEN];
    let staged =
        replay_mdc0_props(&mut mdc, &mut recbuf).map_err(|e| ActivateErr::with_mdc(e, 0))?;

    // Reconcile the staged drive set against the offered descriptors.
    // Every descriptor starts out defunct; a descriptor that no staged
    // MCCONFIG claims is a zombie from some other mpool.
    let mut matched = vec![false; devs.len()];
    let mut pool: Vec<PoolPd> = Vec::with_capacity(devs.len());
    let mut unavail_cnt = 0usize;

    for (uuid, desc) in staged.drives.iter() {
        if desc.defunct {
            continue;
        }
        match devs.iter().position(|(_, p)| p.uuid == *uuid) {
            Some(i) => {
                let offered = &devs[i].1;
                let known = &desc.props;
                if offered.zonepg != known.zonepg
                    || offered.sectorsz != known.sectorsz
                    || offered.devtype != known.devtype
                    || offered.features != known.features
                    || offered.mclass != known.mclass
                {
                    if desc.unavail {
                        warn!("drive {} parameters changed while unavailable", uuid);
                    } else {
                        return Err(ActivateErr::with_pd(
                            Error::with_msg(ParmMismatch, "drive parameters mismatch MDC0"),
                            *uuid,
                        ));
                    }
                }
                matched[i] = true;
                pool.push(PoolPd::new(Pd::new(devs[i].0.clone(), offered.clone())));
            }
            None => {
                warn!("drive {} recorded in MDC0 was not offered, unavailable", uuid);
                unavail_cnt += 1;
                pool.push(PoolPd::new(Pd::unavail(desc.props.clone())));
            }
        }
    }

    for (i, ok) in matched.iter().enumerate() {
        if !ok {
            return Err(ActivateErr::with_pd(
                Error::with_msg(Zombie, "drive is unknown to MDC0"),
                devs[i].1.uuid,
            ));
        }
    }
    if unavail_cnt >= Mclass::COUNT {
        return Err(ActivateErr::from(Error::with_msg(
            InsufficientGood,
            "too many unavailable drives",
        )));
    }

    // Apply the read per-class spare percentages.
    let mut spzone_pct = [DEFAULT_SPZONE_PCT; Mclass::COUNT];
    for (i, staged_pct) in staged.spares.iter().enumerate() {
        if let Some(pct) = staged_pct {
            spzone_pct[i] = *pct;
        }
    }
    for pp in &pool {
        pp.smap
            .set_spzone_pct(spzone_pct[pp.pd.props().mclass as usize]);
    }

    let mdc0_pdi = pool
        .iter()
        .position(|pp| pp.pd.uuid() == mdc0_props.uuid)
        .ok_or_else(|| {
            ActivateErr::with_pd(
                Error::with_msg(Corrupt, "MDC0 drive is not in the reconciled set"),
                mdc0_props.uuid,
            )
        })?;

    let props = MpProps {
        desc: staged.mpdesc.unwrap_or(MpDesc {
            uuid: boot.uuid,
            name: boot.name.clone(),
        }),
        spzone_pct,
    };
    let sb_img = crate::layers::pd::sb::SbImage::new(boot.uuid, boot.name, Some(locs));
    let core = PmdCore::new(cfg, props, pool, sb_img.clone());
    core.mdc0_pdi.store(mdc0_pdi, Ordering::Release);

    install_mdc0_pair(&core, &sb_img, mdc0_pdi, true).map_err(|e| ActivateErr::with_mdc(e, 0))?;

    {
        let mut info = core.slots[0].compactlock.lock();
        info.mdc = Some(mdc);

        // Pass 2: object records.
        replay_obj_records(&core, 0, &mut info).map_err(|e| ActivateErr::with_mdc(e, 0))?;
        info.mdccver = staged.version;
        core.slots[0].refresh_usage(&info);

        mdc0_validate(&core, &mut info).map_err(|e| ActivateErr::with_mdc(e, 0))?;
    }

    core.erase_q.start();
    Ok(core)
}

/// Indexes the MDC0 mlog pair in slot 0's committed index.
pub(crate) fn install_mdc0_pair(
    core: &PmdCore,
    sb_img: &crate::layers::pd::sb::SbImage,
    mdc0_pdi: usize,
    insert_smap: bool,
) -> Result<()> {
    let locs = sb_img
        .mdc0
        .as_ref()
        .ok_or(Error::with_msg(Corrupt, "superblock image carries no MDC0"))?;

    {
        let pdv = core.pdv.read();
        let pp = &pdv[mdc0_pdi];
        let zb = pp.pd.zone_bytes();
        let mut obj = core.slots[0].colock.write();
        for loc in locs {
            if insert_smap {
                pp.smap
                    .insert(loc.zaddr, loc.zcnt)
                    .map_err(|_| Error::with_msg(Corrupt, "MDC0 zones overlap a layout"))?;
            }
            let objid = ObjId::from_raw(loc.logid);
            let layout = Layout::new(
                objid,
                pp.pd.uuid(),
                mdc0_pdi,
                loc.zaddr,
                loc.zcnt,
                zb,
                loc.gen,
                true,
                1,
            );
            obj.insert(objid, layout);
        }
    }

    // Uniqs 0 and 1 belong to the MDC0 pair itself.
    let mut uq = core.slots[0].uqlock.lock();
    uq.luniq = uq.luniq.max(1);
    Ok(())
}

fn layout_from_desc(
    desc: &LayoutDesc,
    pdv: &[PoolPd],
    uuid_to_pdi: &HashMap<Uuid, usize>,
) -> Result<Arc<Layout>> {
    let pdi = *uuid_to_pdi
        .get(&desc.pd_uuid)
        .ok_or(Error::with_msg(Corrupt, "layout names an unknown drive"))?;
    let zb = pdv[pdi].pd.props().zone_bytes();
    Ok(Layout::new(
        ObjId::from_raw(desc.objid),
        desc.pd_uuid,
        pdi,
        desc.zaddr,
        desc.zcnt,
        zb,
        desc.gen,
        true,
        1,
    ))
}

/// Replays the object records of one MDC, applying the record state machine
/// in log order, then reconstructs space maps, stats and the uniquifier.
///
/// | record  | precondition                        | effect                |
/// |---------|-------------------------------------|-----------------------|
/// | VERSION | first record only                   | set content version   |
/// | OCREATE | objid not yet indexed               | index, mark committed |
/// | ODELETE | objid indexed                       | drop from index       |
/// | OERASE  | objid indexed, gen not below layout | bump generation       |
/// | OUPDATE | objid indexed                       | replace layout        |
/// | OIDCKPT | uniq above the last checkpoint      | advance checkpoint    |
///
/// Any precondition violation aborts the replay with `Corrupt`.
pub(crate) fn replay_obj_records(
    core: &PmdCore,
    slot: usize,
    info: &mut MdcInfo,
) -> Result<()> {
    let pdv = core.pdv.read();
    let uuid_to_pdi: HashMap<Uuid, usize> = pdv
        .iter()
        .enumerate()
        .map(|(i, pp)| (pp.pd.uuid(), i))
        .collect();

    let mut ver: Option<MdcCver> = None;
    let mut lckpt = ObjId::from_raw(0);
    let mut first = true;

    {
        let MdcInfo { mdc, recbuf, .. } = info;
        let mdc = mdc
            .as_mut()
            .ok_or(Error::with_msg(Critical, "mdc is not open"))?;
        let mut objs = core.slots[slot].colock.write();

        mdc.rewind();
        loop {
            let len = mdc.read(recbuf)?;
            if len == 0 {
                break;
            }
            match omf::unpack(&recbuf[..len])? {
                MdcRec::Version(v) => {
                    if !first {
                        return_errno_with_msg!(Corrupt, "VERSION record is not first");
                    }
                    if v > MdcCver::LATEST {
                        return_errno_with_msg!(Unsupported, "metadata is newer than this binary");
                    }
                    ver = Some(v);
                }
                MdcRec::OCreate(desc) => {
                    let objid = ObjId::from_raw(desc.objid);
                    if objs.contains_key(&objid) {
                        error!("mdc{}: OCREATE of indexed object {}", slot, objid);
                        return_errno_with_msg!(Corrupt, "OCREATE of an indexed object");
                    }
                    let layout = layout_from_desc(&desc, &pdv, &uuid_to_pdi)?;
                    objs.insert(objid, layout);
                }
                MdcRec::ODelete { objid } => {
                    let objid = ObjId::from_raw(objid);
                    if objs.remove(&objid).is_none() {
                        error!("mdc{}: ODELETE of unknown object {}", slot, objid);
                        return_errno_with_msg!(Corrupt, "ODELETE of an unknown object");
                    }
                }
                MdcRec::OErase { objid, gen } => {
                    let objid = ObjId::from_raw(objid);
                    let Some(layout) = objs.get(&objid) else {
                        error!("mdc{}: OERASE of unknown object {}", slot, objid);
                        return_errno_with_msg!(Corrupt, "OERASE of an unknown object");
                    };
                    if gen < layout.gen() {
                        error!(
                            "mdc{}: OERASE gen regressed, {} has {} got {}",
                            slot,
                            objid,
                            layout.gen(),
                            gen
                        );
                        return_errno_with_msg!(Corrupt, "OERASE generation regressed");
                    }
                    layout.set_gen(gen);
                }
                MdcRec::OUpdate(desc) => {
                    let objid = ObjId::from_raw(desc.objid);
                    if !objs.contains_key(&objid) {
                        error!("mdc{}: OUPDATE of unknown object {}", slot, objid);
                        return_errno_with_msg!(Corrupt, "OUPDATE of an unknown object");
                    }
                    // Last-wins: no generation guard on updates.
                    let layout = layout_from_desc(&desc, &pdv, &uuid_to_pdi)?;
                    objs.insert(objid, layout);
                }
                MdcRec::OIdCkpt { objid } => {
                    let objid = ObjId::from_raw(objid);
                    let both_zero = objid.uniq() == 0 && lckpt.uniq() == 0;
                    if objid.uniq() <= lckpt.uniq() && !both_zero {
                        error!("mdc{}: OIDCKPT regressed at {}", slot, objid);
                        return_errno_with_msg!(Corrupt, "OIDCKPT uniq regressed");
                    }
                    lckpt = objid;
                }
                rec => {
                    // Property records appear only in MDC0.
                    if slot != 0 {
                        error!("mdc{}: property record {:?} in a user MDC", slot, rec);
                        return_errno_with_msg!(Corrupt, "property record in a user MDC");
                    }
                }
            }
            first = false;
        }

        // Hand every surviving layout's zones to the space map and rebuild
        // the stats.
        for (objid, layout) in objs.iter() {
            if slot == 0 && objid.is_mdc0_log() {
                continue;
            }
            let pp = &pdv[layout.pdi()];
            if pp.pd.is_available() {
                pp.smap
                    .insert(layout.zaddr(), layout.zcnt())
                    .map_err(|_| Error::with_msg(Corrupt, "surviving layouts overlap"))?;
            }
            core.slots[slot].stats_add(layout, true, 1);
        }

        if slot > 0 {
            core.slots[slot].pco.reset(objs.len() as u64);
        }
    }
    drop(pdv);

    if slot == 0 {
        let max_uniq = {
            let objs = core.slots[0].colock.read();
            objs.keys().map(|id| id.uniq()).max().unwrap_or(1)
        };
        {
            let mut uq = core.slots[0].uqlock.lock();
            uq.luniq = uq.luniq.max(max_uniq);
        }
        let _vg = core.slotvlock.lock();
        core.slotvcnt
            .store((max_uniq / 2) as usize + 1, Ordering::Release);
    } else {
        let mut uq = core.slots[slot].uqlock.lock();
        uq.lckpt = lckpt;
        uq.luniq = lckpt.uniq() + CKPT_DELTA - 1;
    }

    info.mdccver = ver;
    Ok(())
}

/// Counts the backing mlogs of every expected MDC. Each MDCi below the
/// maximum must have exactly two; the maximum may have fewer, indicating a
/// torn MDC allocation from a prior run, in which case the stragglers are
/// deleted and the slot count is truncated.
fn mdc0_validate(core: &PmdCore, info: &mut MdcInfo) -> Result<()> {
    let mdcmax = core.slotvcnt() - 1;
    if mdcmax == 0 {
        return Ok(());
    }

    let count_logs = |slot: usize| -> Vec<ObjId> {
        let objs = core.slots[0].colock.read();
        [
            ObjId::logid_make(2 * slot as u64, 0),
            ObjId::logid_make(2 * slot as u64 + 1, 0),
        ]
        .into_iter()
        .filter(|id| objs.contains_key(id))
        .collect()
    };

    for i in 1..mdcmax {
        let present = count_logs(i);
        if present.len() != 2 {
            error!("mdc{} has {} backing mlogs, expected 2", i, present.len());
            return_errno_with_msg!(Corrupt, "MDC lost a backing mlog");
        }
    }

    let stragglers = count_logs(mdcmax);
    if stragglers.len() == 2 {
        return Ok(());
    }

    warn!(
        "torn MDC allocation at slot {}, deleting {} straggler(s)",
        mdcmax,
        stragglers.len()
    );
    for logid in stragglers {
        core.mdc_addrec_locked(
            0,
            info,
            &MdcRec::ODelete {
                objid: logid.as_raw(),
            },
        )?;
        let layout = {
            let mut objs = core.slots[0].colock.write();
            objs.remove(&logid)
        };
        if let Some(layout) = layout {
            let pdv = core.pdv.read();
            let pp = &pdv[layout.pdi()];
            if pp.pd.is_available() {
                pp.smap.free(layout.zaddr(), layout.zcnt());
            }
            core.slots[0].stats_add(&layout, true, -1);
        }
    }

    let _vg = core.slotvlock.lock();
    core.slotvcnt.store(mdcmax, Ordering::Release);
    Ok(())
}

/// Loads the user MDCs with a small worker pool.
///
/// Workers claim slots from a shared counter; the first failure is recorded
/// and every worker observes it and stops claiming further slots.
pub(crate) fn load_user_mdcs(core: &Arc<PmdCore>) -> core::result::Result<(), ActivateErr> {
    let slotvcnt = core.slotvcnt();
    if slotvcnt <= 1 {
        return Ok(());
    }

    let jobs = (core.cfg.objloadjobs.max(1) as usize).min(slotvcnt - 1);
    let next = Arc::new(AtomicUsize::new(1));
    let fail: Arc<Mutex<Option<ActivateErr>>> = Arc::new(Mutex::new(None));

    let mut handles = Vec::with_capacity(jobs);
    for _ in 0..jobs {
        let core = core.clone();
        let next = next.clone();
        let fail = fail.clone();
        handles.push(os::spawn(move || loop {
            if fail.lock().is_some() {
                break;
            }
            let slot = next.fetch_add(1, Ordering::AcqRel);
            if slot >= core.slotvcnt() {
                break;
            }
            if let Err(e) = load_one_mdc(&core, slot) {
                warn!("loading mdc{} failed: {}", slot, e);
                let mut f = fail.lock();
                if f.is_none() {
                    *f = Some(ActivateErr::with_mdc(e, slot as u8));
                }
                break;
            }
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }

    let result = match fail.lock().take() {
        Some(e) => Err(e),
        None => Ok(()),
    };
    result
}

fn load_one_mdc(core: &PmdCore, slot: usize) -> Result<()> {
    let (l0, l1) = {
        let objs = core.slots[0].colock.read();
        let get = |uniq: u64| {
            objs.get(&ObjId::logid_make(uniq, 0))
                .cloned()
                .ok_or(Error::with_msg(Corrupt, "MDC backing mlog is not indexed"))
        };
        (get(2 * slot as u64)?, get(2 * slot as u64 + 1)?)
    };

    let log0 = core.open_backing_mlog(&l0)?;
    let log1 = core.open_backing_mlog(&l1)?;
    let mdc = Mdc::open(log0, l0.gen(), log1, l1.gen())?;

    let mut info = core.slots[slot].compactlock.lock();
    info.mdc = Some(mdc);
    replay_obj_records(core, slot, &mut info)?;
    core.slots[slot].refresh_usage(&info);
    Ok(())
}

/// Compacts every MDC whose on-media version predates this binary, MDC0
/// first, bringing the whole pool to the current version.
pub(crate) fn upgrade_mdcs(core: &PmdCore) -> Result<()> {
    for slot in 0..core.slotvcnt() {
        let stale = {
            let info = core.slots[slot].compactlock.lock();
            info.mdc.is_some() && info.mdccver != Some(MdcCver::LATEST)
        };
        if stale {
            info!("upgrading mdc{} to {}", slot, MdcCver::LATEST);
            core.compact_slot(slot)?;
        }
    }
    Ok(())
}
