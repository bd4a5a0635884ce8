// SPDX-License-Identifier: MPL-2.0

//! Pool metadata core of a multi-device object-storage mpool.
//!
//! An mpool aggregates block devices ("drives") into media classes and
//! stores two flavors of objects on them: mblocks (write-once bulk data)
//! and mlogs (append-only logs). This crate is the authoritative metadata
//! manager: object identity, the on-media metadata containers (MDC0..N,
//! each a paired-mlog log with atomic compaction), drive membership and
//! per-class configuration, the object lifecycle, and the background
//! pre-compaction that keeps the metadata logs from filling up.
#![deny(unsafe_code)]
#![allow(dead_code)]

mod error;
mod layers;
mod os;
mod prelude;
mod util;

pub use self::{
    error::{Errno, Error},
    layers::{
        omf::{MdcCver, MpDesc},
        pd::{Mclass, MemPd, PdDev, PdDevType, PdProps, PdState, PAGE_SIZE},
        pmd::{
            objid_to_uhandle, uhandle_to_objid, ActivateErr, DevRpt, Layout, Mpool, MpoolCfg,
            MpUsage, ObjId, ObjType, CKPT_DELTA, MDC_SET_SZ, MDC_SLOTS, MDC_TBL_SZ,
        },
    },
};
