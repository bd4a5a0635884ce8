// SPDX-License-Identifier: MPL-2.0

//! The pool metadata ("pmd") core.
//!
//! This layer owns object identity, the in-memory layout indices, the
//! metadata containers MDC0..N and their compaction, drive membership and
//! per-class configuration, the object lifecycle
//! (allocate → commit → erase → delete), and the background pre-compaction
//! task that bounds worst-case commit latency.
//!
//! MDC0 persists mpool-wide properties and the location of every other MDC;
//! MDC1..N each hold a shard of client-object records. New allocations are
//! spread across the MDCs by a credit-weighted round-robin table rebuilt
//! from per-MDC free space.
mod layout;
mod mpool;
mod objid;
mod ops;
mod precompact;
mod props;
mod replay;
mod slot;
#[cfg(test)]
mod tests;

pub use self::{
    layout::Layout,
    mpool::{ActivateErr, DevRpt, Mpool, MpoolCfg},
    objid::{objid_to_uhandle, uhandle_to_objid, ObjId, ObjType, CKPT_DELTA, MDC_SLOTS},
    precompact::{MDC_SET_SZ, MDC_TBL_SZ},
    props::MpUsage,
};

pub(crate) use self::{
    mpool::{PmdCore, PoolPd},
    slot::{MdcInfo, MdcSlot},
};

/// Retries of the compaction loop before the failure is declared critical.
pub(crate) const COMPACT_RETRY_MAX: usize = 5;
