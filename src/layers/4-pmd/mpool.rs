// SPDX-License-Identifier: MPL-2.0

//! The mpool handle: activation, deactivation, and the MDC compaction
//! engine.
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use uuid::Uuid;

use super::{
    objid::{ObjId, MDC_SLOTS},
    ops::EraseQueue,
    precompact::{PreCompactTask, MDC_TBL_SZ},
    replay,
    slot::{MdcInfo, MdcSlot},
    COMPACT_RETRY_MAX,
};
use crate::{
    layers::{
        mdc::{Mdc, Mlog},
        omf::{MdcCver, MdcRec, MpDesc, PdDesc},
        pd::{sb, Mclass, Pd, PdDev, PdProps, PdState},
        smap::{Smap, SpcType},
    },
    os::{Mutex, RwLock, SpinLock, String, Vec},
    prelude::*,
};

/// Default spare-zone percentage applied to every media class at create.
const DEFAULT_SPZONE_PCT: u8 = 2;

/// Configuration knobs of an mpool handle.
#[derive(Clone, Debug)]
pub struct MpoolCfg {
    /// Parallel-activation worker count.
    pub objloadjobs: u32,
    /// Target byte capacity for each newly-allocated MDC mlog.
    pub mdcncap: u64,
    /// Per-MDC compaction triggers, percent (0-100).
    pub pcopctfull: u8,
    pub pcopctgarbage: u8,
    /// Global new-MDC triggers, percent (0-100).
    pub crtmdcpctfull: u8,
    pub crtmdcpctgrbg: u8,
    /// Pre-compactor tick in seconds, clamped to [1, 3600] at use.
    pub pcoperiod: u64,
    /// MDCs after the current compaction target excluded from allocation.
    pub pconbnoalloc: u8,
}

impl Default for MpoolCfg {
    fn default() -> Self {
        Self {
            objloadjobs: 4,
            mdcncap: 1 << 20,
            pcopctfull: 70,
            pcopctgarbage: 20,
            crtmdcpctfull: 80,
            crtmdcpctgrbg: 40,
            pcoperiod: 60,
            pconbnoalloc: 1,
        }
    }
}

/// Identifies the drive or MDC involved in an activation failure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DevRpt {
    pub pd_uuid: Option<Uuid>,
    pub mdc: Option<u8>,
}

/// An activation failure: the first underlying cause plus the drive or MDC
/// it was observed on.
#[derive(Clone, Debug)]
pub struct ActivateErr {
    pub err: Error,
    pub rpt: DevRpt,
}

impl ActivateErr {
    pub(crate) fn with_pd(err: Error, pd_uuid: Uuid) -> Self {
        Self {
            err,
            rpt: DevRpt {
                pd_uuid: Some(pd_uuid),
                mdc: None,
            },
        }
    }

    pub(crate) fn with_mdc(err: Error, mdc: u8) -> Self {
        Self {
            err,
            rpt: DevRpt {
                pd_uuid: None,
                mdc: Some(mdc),
            },
        }
    }

    pub fn errno(&self) -> crate::error::Errno {
        self.err.errno()
    }
}

impl From<Error> for ActivateErr {
    fn from(err: Error) -> Self {
        Self {
            err,
            rpt: DevRpt::default(),
        }
    }
}

impl fmt::Display for ActivateErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.err, self.rpt)
    }
}

impl std::error::Error for ActivateErr {}

/// One drive of the pool: the device plus its space map.
pub(crate) struct PoolPd {
    pub pd: Pd,
    pub smap: Smap,
}

impl PoolPd {
    pub(crate) fn new(pd: Pd) -> Self {
        // Zone 0 of every drive is reserved for the superblock.
        let smap = Smap::new(pd.nzones(), 1);
        Self { pd, smap }
    }
}

/// Mpool-wide properties.
pub(crate) struct MpProps {
    pub desc: MpDesc,
    pub spzone_pct: [u8; Mclass::COUNT],
}

/// The shared state behind an [`Mpool`] handle.
pub(crate) struct PmdCore {
    pub cfg: MpoolCfg,
    pub props: Mutex<MpProps>,
    pub pdv: Arc<RwLock<Vec<PoolPd>>>,
    pub slots: Vec<MdcSlot>,
    /// Count of visible slots, published under `slotvlock`.
    pub slotvcnt: AtomicUsize,
    pub slotvlock: SpinLock<()>,
    /// Slot-selection table realizing the credit ratios.
    pub mds_tbl: Vec<AtomicU8>,
    pub rotor: AtomicUsize,
    /// Next MDC to consider for compaction.
    pub nmtoc: AtomicUsize,
    /// Slot currently targeted by the pre-compactor (`usize::MAX` if none).
    pub compacting_slot: AtomicUsize,
    pub mclass_rotor: [AtomicUsize; Mclass::COUNT],
    pub pd_rotor: AtomicUsize,
    /// Serializes MDC-set allocation.
    pub mdc_alloc_lock: Mutex<()>,
    pub erase_q: EraseQueue,
    /// In-memory MDC0 superblock image.
    pub sb: Mutex<sb::SbImage>,
    /// Index of the drive hosting MDC0.
    pub mdc0_pdi: AtomicUsize,
}

/// An activated mpool.
pub struct Mpool {
    pub(crate) core: Arc<PmdCore>,
    pub(crate) precompact: Mutex<Option<PreCompactTask>>,
}

impl core::fmt::Debug for Mpool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mpool").finish_non_exhaustive()
    }
}

impl PmdCore {
    pub(crate) fn new(cfg: MpoolCfg, props: MpProps, pdv: Vec<PoolPd>, sb_img: sb::SbImage) -> Arc<Self> {
        let pdv = Arc::new(RwLock::new(pdv));
        let erase_q = EraseQueue::new(pdv.clone());
        Arc::new(Self {
            cfg,
            props: Mutex::new(props),
            pdv,
            slots: (0..MDC_SLOTS).map(|s| MdcSlot::new(s as u8)).collect(),
            slotvcnt: AtomicUsize::new(0),
            slotvlock: SpinLock::new(()),
            mds_tbl: (0..MDC_TBL_SZ).map(|_| AtomicU8::new(0)).collect(),
            rotor: AtomicUsize::new(0),
            nmtoc: AtomicUsize::new(0),
            compacting_slot: AtomicUsize::new(usize::MAX),
            mclass_rotor: Default::default(),
            pd_rotor: AtomicUsize::new(0),
            mdc_alloc_lock: Mutex::new(()),
            erase_q,
            sb: Mutex::new(sb_img),
            mdc0_pdi: AtomicUsize::new(0),
        })
    }

    pub(crate) fn slotvcnt(&self) -> usize {
        self.slotvcnt.load(Ordering::Acquire)
    }

    /// Opens the mlog backing an MDC, addressed by its owning layout.
    pub(crate) fn open_backing_mlog(&self, layout: &super::layout::Layout) -> Result<Mlog> {
        let pdv = self.pdv.read();
        let pp = pdv
            .get(layout.pdi())
            .ok_or(Error::with_msg(Critical, "backing layout names no drive"))?;
        let dev = pp.pd.dev()?.clone();
        let zb = pp.pd.zone_bytes();
        Mlog::open(dev, layout.zaddr() * zb, layout.zcnt() as u64 * zb)
    }

    /// Packs and appends one record to an open MDC.
    pub(crate) fn append_rec(info: &mut MdcInfo, rec: &MdcRec, sync: bool) -> Result<()> {
        let MdcInfo { mdc, recbuf, .. } = info;
        let mdc = mdc
            .as_mut()
            .ok_or(Error::with_msg(Critical, "mdc is not open"))?;
        let len = crate::layers::omf::pack(rec, recbuf)?;
        mdc.append(&recbuf[..len], sync)
    }

    /// Appends one record with the slot's compact-lock held by the caller.
    ///
    /// A full active mlog triggers one compaction and one retry.
    pub(crate) fn mdc_addrec_locked(
        &self,
        slot: usize,
        info: &mut MdcInfo,
        rec: &MdcRec,
    ) -> Result<()> {
        let res = match Self::append_rec(info, rec, true) {
            Err(e) if e.errno() == TooBig => {
                debug!("mdc{} active mlog is full, compacting", slot);
                self.compact_locked(slot, info)?;
                Self::append_rec(info, rec, true)
            }
            other => other,
        };
        if let Err(e) = &res {
            if e.errno() != TooBig {
                info.err_state = true;
            }
        }
        self.slots[slot].refresh_usage(info);
        res
    }

    /// Appends one record to the given MDC, taking its compact-lock.
    pub(crate) fn mdc_addrec(&self, slot: usize, rec: &MdcRec) -> Result<()> {
        let mut info = self.slots[slot].compactlock.lock();
        self.mdc_addrec_locked(slot, &mut info, rec)
    }

    /// Persists the new generation of a backing mlog after `cstart`.
    ///
    /// MDC0's generations live in the superblock image; every other pair is
    /// recorded by an `OErase` in MDC0.
    fn persist_log_gen(&self, slot: usize, side: usize, gen: u64) -> Result<()> {
        let logid = ObjId::logid_make(2 * slot as u64 + side as u64, 0);
        let layout = self.slots[0]
            .colock
            .read()
            .get(&logid)
            .cloned()
            .ok_or(Error::with_msg(Critical, "backing mlog is not indexed"))?;

        if slot == 0 {
            let mut sb_img = self.sb.lock();
            let locs = sb_img
                .mdc0
                .as_mut()
                .ok_or(Error::with_msg(Critical, "superblock image lost MDC0"))?;
            locs[side].gen = gen;
            let pdv = self.pdv.read();
            let pp = &pdv[self.mdc0_pdi.load(Ordering::Acquire)];
            sb::write_update(pp.pd.dev()?.as_ref(), &sb_img)?;
        } else {
            self.mdc_addrec(
                0,
                &MdcRec::OErase {
                    objid: logid.as_raw(),
                    gen,
                },
            )?;
            self.slots[0].pco.bump(&self.slots[0].pco.er);
        }
        layout.set_gen(gen);
        Ok(())
    }

    /// Compacts one MDC with its compact-lock held by the caller.
    ///
    /// Every step but the final `cend` is retried; a `cend` failure or
    /// exhausted retries is critical: the mpool stays readable, but further
    /// metadata appends to this MDC are unsafe.
    pub(crate) fn compact_locked(&self, slot: usize, info: &mut MdcInfo) -> Result<()> {
        for _ in 0..COMPACT_RETRY_MAX {
            match self.compact_once(slot, info) {
                Ok(compacted) => {
                    if slot > 0 {
                        self.slots[slot].pco.reset(compacted);
                    }
                    info.mdccver = Some(MdcCver::LATEST);
                    info.err_state = false;
                    self.slots[slot].refresh_usage(info);
                    debug!("mdc{} compacted, {} objects re-emitted", slot, compacted);
                    return Ok(());
                }
                Err(e) if e.errno() == Critical => {
                    info.err_state = true;
                    error!("mdc{} compaction failed critically: {}", slot, e);
                    return Err(e);
                }
                Err(e) => {
                    info.err_state = true;
                    warn!("mdc{} compaction attempt failed: {}", slot, e);
                }
            }
        }
        error!("mdc{} compaction retries exhausted", slot);
        Err(Error::with_msg(Critical, "compaction retries exhausted"))
    }

    pub(crate) fn compact_slot(&self, slot: usize) -> Result<()> {
        let mut info = self.slots[slot].compactlock.lock();
        self.compact_locked(slot, &mut info)
    }

    fn compact_once(&self, slot: usize, info: &mut MdcInfo) -> Result<u64> {
        if info.err_state {
            let mdc = info
                .mdc
                .as_mut()
                .ok_or(Error::with_msg(Critical, "mdc is not open"))?;
            mdc.reopen()?;
            info.err_state = false;
        }

        let (gen, side) = {
            let mdc = info
                .mdc
                .as_mut()
                .ok_or(Error::with_msg(Critical, "mdc is not open"))?;
            let gen = mdc.cstart()?;
            (gen, mdc.target().unwrap_or(0))
        };
        self.persist_log_gen(slot, side, gen)?;

        Self::append_rec(info, &MdcRec::Version(MdcCver::LATEST), false)?;

        if slot == 0 {
            // Post-activation the drive list only mutates under this very
            // compact-lock (spare updates), so the read here cannot deadlock.
            {
                let pdv = self.pdv.read();
                for pp in pdv.iter() {
                    if pp.pd.state() == PdState::Defunct {
                        continue;
                    }
                    let rec = MdcRec::McConfig(PdDesc {
                        props: pp.pd.props().clone(),
                        defunct: false,
                        unavail: pp.pd.state() == PdState::Unavail,
                    });
                    Self::append_rec(info, &rec, false)?;
                }
            }
            let (spares, desc) = {
                let props = self.props.lock();
                (props.spzone_pct, props.desc.clone())
            };
            for (i, pct) in spares.iter().enumerate() {
                Self::append_rec(
                    info,
                    &MdcRec::McSpare {
                        mclass: i as u8,
                        spzone_pct: *pct,
                    },
                    false,
                )?;
            }
            Self::append_rec(info, &MdcRec::MpConfig(desc), false)?;
        } else {
            let lckpt = self.slots[slot].uqlock.lock().lckpt;
            Self::append_rec(
                info,
                &MdcRec::OIdCkpt {
                    objid: lckpt.as_raw(),
                },
                false,
            )?;
        }

        let mut compacted = 0u64;
        {
            let obj = self.slots[slot].colock.read();
            for (objid, layout) in obj.iter() {
                if objid.is_mdc0_log() {
                    continue;
                }
                Self::append_rec(info, &MdcRec::OCreate(layout.desc()), false)?;
                compacted += 1;
            }
        }

        let mdc = info
            .mdc
            .as_mut()
            .ok_or(Error::with_msg(Critical, "mdc is not open"))?;
        if let Err(e) = mdc.cend() {
            error!("mdc{} cend failed: {}", slot, e);
            return Err(Error::with_msg(Critical, "compaction finalization failed"));
        }
        Ok(compacted)
    }

    /// Closes every open MDC, in reverse slot order so that closing MDCi
    /// can still reach MDC0.
    pub(crate) fn close_all_mdcs(&self) {
        for slot in (0..MDC_SLOTS).rev() {
            let mut info = self.slots[slot].compactlock.lock();
            if let Some(mdc) = info.mdc.take() {
                let _ = mdc.flush();
            }
        }
    }
}

impl Mpool {
    /// Formats the offered drives into a fresh mpool and activates it.
    pub fn create(
        devs: Vec<(Arc<dyn PdDev>, PdProps)>,
        name: &str,
        cfg: MpoolCfg,
    ) -> core::result::Result<Mpool, ActivateErr> {
        validate_devs(&devs)?;
        let uuid = Uuid::new_v4();

        let mut pdv: Vec<PoolPd> = devs
            .iter()
            .map(|(dev, props)| PoolPd::new(Pd::new(dev.clone(), props.clone())))
            .collect();
        for pp in &mut pdv {
            pp.smap.set_spzone_pct(DEFAULT_SPZONE_PCT);
        }

        // MDC0 lives on the first capacity-class drive.
        let mdc0_pdi = pdv
            .iter()
            .position(|pp| pp.pd.props().mclass == Mclass::Capacity)
            .expect("validated above");
        let (mdc, sb_img) = format_mdc0(&pdv[mdc0_pdi], uuid, name, cfg.mdcncap)
            .map_err(|e| ActivateErr::with_pd(e, pdv[mdc0_pdi].pd.uuid()))?;

        // Stamp every drive with the pool identity; only the MDC0 drive
        // carries the MDC0 locations.
        for (i, pp) in pdv.iter().enumerate() {
            let img = if i == mdc0_pdi {
                sb_img.clone()
            } else {
                sb::SbImage::new(uuid, name.to_string(), None)
            };
            sb::write_update(pp.pd.dev().map_err(|e| ActivateErr::with_pd(e, pp.pd.uuid()))?.as_ref(), &img)
                .map_err(|e| ActivateErr::with_pd(e, pp.pd.uuid()))?;
        }

        let props = MpProps {
            desc: MpDesc {
                uuid,
                name: name.to_string(),
            },
            spzone_pct: [DEFAULT_SPZONE_PCT; Mclass::COUNT],
        };
        let core = PmdCore::new(cfg, props, pdv, sb_img.clone());
        core.mdc0_pdi.store(mdc0_pdi, Ordering::Release);

        replay::install_mdc0_pair(&core, &sb_img, mdc0_pdi, false)?;
        {
            let mut info = core.slots[0].compactlock.lock();
            info.mdc = Some(mdc);
            info.mdccver = Some(MdcCver::LATEST);
            core.slots[0].refresh_usage(&info);
        }
        core.slotvcnt.store(1, Ordering::Release);
        core.erase_q.start();

        let res: Result<()> = (|| {
            // Initial property records.
            core.mdc_addrec(0, &MdcRec::Version(MdcCver::LATEST))?;
            {
                let pdv = core.pdv.read();
                for pp in pdv.iter() {
                    core.mdc_addrec(
                        0,
                        &MdcRec::McConfig(PdDesc {
                            props: pp.pd.props().clone(),
                            defunct: false,
                            unavail: false,
                        }),
                    )?;
                }
            }
            for i in 0..Mclass::COUNT {
                core.mdc_addrec(
                    0,
                    &MdcRec::McSpare {
                        mclass: i as u8,
                        spzone_pct: DEFAULT_SPZONE_PCT,
                    },
                )?;
            }
            core.mdc_addrec(
                0,
                &MdcRec::MpConfig(MpDesc {
                    uuid,
                    name: name.to_string(),
                }),
            )?;

            // Seed the first MDC set so allocation can proceed.
            core.mdc_alloc_set()?;
            Ok(())
        })();
        if let Err(e) = res {
            core.erase_q.stop();
            core.close_all_mdcs();
            return Err(e.into());
        }

        info!("mpool {} created with {} drives", uuid, core.pdv.read().len());
        Ok(Mpool {
            core,
            precompact: Mutex::new(None),
        })
    }

    /// Activates an existing mpool from the offered drives.
    ///
    /// On failure the partial state is torn down (MDCs closed in reverse
    /// slot order) and the first underlying cause is reported along with
    /// the drive or MDC involved.
    pub fn activate(
        devs: Vec<(Arc<dyn PdDev>, PdProps)>,
        cfg: MpoolCfg,
    ) -> core::result::Result<Mpool, ActivateErr> {
        validate_devs(&devs)?;
        let boot = read_superblocks(&devs)?;

        let core = replay::activate_core(devs, cfg, boot)?;

        let res = replay::load_user_mdcs(&core).and_then(|_| {
            replay::upgrade_mdcs(&core).map_err(ActivateErr::from)
        });
        if let Err(e) = res {
            core.erase_q.stop();
            core.close_all_mdcs();
            return Err(e);
        }

        core.update_credit();
        info!(
            "mpool {} activated, {} MDCs, {} drives",
            core.props.lock().desc.uuid,
            core.slotvcnt(),
            core.pdv.read().len()
        );
        Ok(Mpool {
            core,
            precompact: Mutex::new(None),
        })
    }

    /// Shuts the mpool down: stops background work, flushes and closes
    /// every MDC in reverse slot order, and releases the drives.
    pub fn deactivate(self) -> Result<()> {
        self.precompact_stop();
        self.core.erase_q.stop();
        self.core.close_all_mdcs();
        Ok(())
    }

    /// The mpool UUID.
    pub fn uuid(&self) -> Uuid {
        self.core.props.lock().desc.uuid
    }

    /// The mpool name.
    pub fn name(&self) -> String {
        self.core.props.lock().desc.name.clone()
    }
}

impl Drop for Mpool {
    fn drop(&mut self) {
        self.precompact_stop();
        self.core.erase_q.stop();
    }
}

/// Bootstrap state discovered from the superblocks.
pub(crate) struct BootInfo {
    pub uuid: Uuid,
    pub name: String,
    pub sb_img: sb::SbImage,
    /// Index (in the offered device list) of the drive hosting MDC0.
    pub mdc0_dev: usize,
}

fn validate_devs(
    devs: &[(Arc<dyn PdDev>, PdProps)],
) -> core::result::Result<(), ActivateErr> {
    if devs.is_empty() {
        return Err(Error::with_msg(InvalidArgs, "no drives offered").into());
    }
    if !devs
        .iter()
        .any(|(_, p)| p.mclass == Mclass::Capacity)
    {
        return Err(Error::with_msg(InvalidArgs, "no capacity-class drive").into());
    }
    for (i, (dev, props)) in devs.iter().enumerate() {
        if props.zonepg == 0 {
            return Err(ActivateErr::with_pd(
                Error::with_msg(InvalidArgs, "drive has zero zone size"),
                props.uuid,
            ));
        }
        if dev.nbytes() / props.zone_bytes() < 4 {
            return Err(ActivateErr::with_pd(
                Error::with_msg(InvalidArgs, "drive is too small"),
                props.uuid,
            ));
        }
        if devs[..i].iter().any(|(_, p)| p.uuid == props.uuid) {
            return Err(ActivateErr::with_pd(
                Error::with_msg(InvalidArgs, "duplicate drive UUID"),
                props.uuid,
            ));
        }
    }
    Ok(())
}

fn read_superblocks(
    devs: &[(Arc<dyn PdDev>, PdProps)],
) -> core::result::Result<BootInfo, ActivateErr> {
    let mut boot: Option<BootInfo> = None;
    let mut uuid: Option<Uuid> = None;

    for (i, (dev, props)) in devs.iter().enumerate() {
        let img = sb::read(dev.as_ref()).map_err(|e| ActivateErr::with_pd(e, props.uuid))?;
        match uuid {
            None => uuid = Some(img.uuid),
            Some(u) if u != img.uuid => {
                return Err(ActivateErr::with_pd(
                    Error::with_msg(ParmMismatch, "drive belongs to another mpool"),
                    props.uuid,
                ));
            }
            _ => (),
        }
        if img.mdc0.is_some() {
            if boot.is_some() {
                return Err(ActivateErr::with_pd(
                    Error::with_msg(Corrupt, "two drives claim MDC0"),
                    props.uuid,
                ));
            }
            boot = Some(BootInfo {
                uuid: img.uuid,
                name: img.name.clone(),
                sb_img: img,
                mdc0_dev: i,
            });
        }
    }

    boot.ok_or_else(|| {
        ActivateErr::from(Error::with_msg(Corrupt, "no drive carries the MDC0 superblock"))
    })
}

/// Formats the MDC0 mlog pair on the given drive.
fn format_mdc0(
    pp: &PoolPd,
    uuid: Uuid,
    name: &str,
    mdcncap: u64,
) -> Result<(Mdc, sb::SbImage)> {
    let zb = pp.pd.zone_bytes();
    let zcnt = (mdcncap.div_ceil(zb)).max(1) as u32;

    let zaddr0 = pp.smap.alloc(zcnt, SpcType::Usable, 1)?;
    let zaddr1 = pp.smap.alloc(zcnt, SpcType::Usable, 1)?;

    let dev = pp.pd.dev()?.clone();
    let log0 = Mlog::open(dev.clone(), zaddr0 * zb, zcnt as u64 * zb)?;
    let log1 = Mlog::open(dev, zaddr1 * zb, zcnt as u64 * zb)?;
    let mdc = Mdc::create(log0, log1)?;

    let sb_img = sb::SbImage::new(
        uuid,
        name.to_string(),
        Some([
            sb::SbMdcLoc {
                logid: ObjId::logid_make(0, 0).as_raw(),
                zaddr: zaddr0,
                zcnt,
                gen: mdc.gen(0),
            },
            sb::SbMdcLoc {
                logid: ObjId::logid_make(1, 0).as_raw(),
                zaddr: zaddr1,
                zcnt,
                gen: mdc.gen(1),
            },
        ]),
    );
    Ok((mdc, sb_img))
}
