// SPDX-License-Identifier: MPL-2.0

//! Mpool-wide property persistence and usage reporting.
//!
//! Property records are appended to MDC0 synchronously during live
//! operation; an in-progress MDC0 compaction re-emits them itself, with the
//! final `cend` flushing the lot.
use core::sync::atomic::Ordering;

use uuid::Uuid;

use super::mpool::{Mpool, PmdCore};
use crate::{
    layers::{
        omf::{MdcRec, MpDesc, PdDesc},
        pd::{Mclass, PdProps, PdState},
    },
    os::{String, Vec},
    prelude::*,
};

/// Aggregate usage of an mpool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MpUsage {
    /// Bytes across all available drives.
    pub total: u64,
    /// Free bytes available to normal allocations.
    pub usable_free: u64,
    /// Bytes held back as spare reserve.
    pub spare: u64,
    pub mblock_cnt: u64,
    pub mblock_alen: u64,
    pub mlog_cnt: u64,
    pub mlog_alen: u64,
    pub uncommitted_cnt: u64,
    pub uncommitted_alen: u64,
}

impl PmdCore {
    fn find_pd(&self, uuid: Uuid) -> Result<usize> {
        self.pdv
            .read()
            .iter()
            .position(|pp| pp.pd.uuid() == uuid)
            .ok_or(Error::with_msg(NotFound, "no such drive"))
    }
}

impl Mpool {
    /// Re-persists the configuration record of one drive.
    pub fn prop_mcconfig(&self, pd_uuid: Uuid) -> Result<()> {
        let core = &self.core;
        let pdi = core.find_pd(pd_uuid)?;
        let rec = {
            let pdv = core.pdv.read();
            let pd = &pdv[pdi].pd;
            MdcRec::McConfig(PdDesc {
                props: pd.props().clone(),
                defunct: pd.state() == PdState::Defunct,
                unavail: pd.state() == PdState::Unavail,
            })
        };
        core.mdc_addrec(0, &rec)
    }

    /// Sets and persists the spare-zone percentage of a media class.
    pub fn prop_mcspare(&self, mclass: Mclass, spzone_pct: u8) -> Result<()> {
        if spzone_pct > 100 {
            return_errno_with_msg!(InvalidArgs, "spare percentage beyond 100");
        }
        let core = &self.core;

        core.mdc_addrec(
            0,
            &MdcRec::McSpare {
                mclass: mclass as u8,
                spzone_pct,
            },
        )?;

        core.props.lock().spzone_pct[mclass as usize] = spzone_pct;
        let pdv = core.pdv.read();
        for pp in pdv.iter() {
            if pp.pd.props().mclass == mclass {
                pp.smap.set_spzone_pct(spzone_pct);
            }
        }
        Ok(())
    }

    /// Persists a new mpool configuration (currently the pool name).
    pub fn prop_mpconfig(&self, name: &str) -> Result<()> {
        let core = &self.core;
        let desc = {
            let mut props = core.props.lock();
            props.desc.name = name.to_string();
            props.desc.clone()
        };
        core.mdc_addrec(0, &MdcRec::MpConfig(desc))
    }

    /// The persisted mpool configuration.
    pub fn mp_desc(&self) -> MpDesc {
        self.core.props.lock().desc.clone()
    }

    /// The configured spare percentage of a media class.
    pub fn spzone_pct(&self, mclass: Mclass) -> u8 {
        self.core.props.lock().spzone_pct[mclass as usize]
    }

    /// Aggregate space and object usage across the pool.
    ///
    /// Object counts cover client objects (user MDC slots); the mlogs
    /// backing the MDCs themselves are internal.
    pub fn mpool_usage(&self) -> MpUsage {
        let core = &self.core;
        let mut usage = MpUsage::default();

        {
            let pdv = core.pdv.read();
            for pp in pdv.iter() {
                if !pp.pd.is_available() {
                    continue;
                }
                let zb = pp.pd.zone_bytes();
                let s = pp.smap.usage();
                usage.total += s.total * zb;
                usage.spare += s.spare * zb;
                usage.usable_free += s.free.saturating_sub(s.spare) * zb;
            }
        }

        for slot in 1..core.slotvcnt() {
            let stats = *core.slots[slot].stats.lock();
            usage.mblock_cnt += stats.mb_cnt;
            usage.mblock_alen += stats.mb_alen;
            usage.mlog_cnt += stats.ml_cnt;
            usage.mlog_alen += stats.ml_alen;
            usage.uncommitted_cnt += stats.uncob_cnt;
            usage.uncommitted_alen += stats.uncob_alen;
        }
        usage
    }

    /// Properties and state of every drive in the pool.
    pub fn pd_props(&self) -> Vec<(PdProps, PdState)> {
        self.core
            .pdv
            .read()
            .iter()
            .map(|pp| (pp.pd.props().clone(), pp.pd.state()))
            .collect()
    }

    /// Number of visible MDC slots (MDC0 included).
    pub fn slotvcnt(&self) -> usize {
        self.core.slotvcnt.load(Ordering::Acquire)
    }
}
