// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// Checkpoint interval of the per-slot uniquifier.
///
/// Every `CKPT_DELTA`-th id is persisted (OIdCkpt) before it is returned,
/// so recovery can restart the uniquifier above any id that may have been
/// handed out before a crash.
pub const CKPT_DELTA: u64 = 256;

/// Maximum number of MDCs, and the exclusive upper bound of slot numbers.
pub const MDC_SLOTS: usize = 256;

const UNIQ_SHIFT: u32 = 12;
const TYPE_SHIFT: u32 = 8;
const TYPE_MASK: u64 = 0xf;
const SLOT_MASK: u64 = 0xff;

/// Bit pattern mixed into user handles so a raw objid handed back as a
/// handle (or vice versa) is caught at the API boundary.
const UHANDLE_MIX: u64 = 0x5048_4e44_4c45_0000;

/// Type of a client object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjType {
    /// Write-once bulk data region.
    Mblock = 1,
    /// Append-only log region.
    Mlog = 2,
}

/// A 64-bit object id: `uniq` (52 bits) | `type` (4 bits) | `slot` (8 bits).
///
/// The slot names the MDC that owns the object's metadata. Slot 0 is
/// internal: it holds only the mlogs backing the MDCs themselves.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ObjId(u64);

impl ObjId {
    pub fn make(uniq: u64, otype: ObjType, slot: u8) -> Self {
        debug_assert!(uniq < 1 << (64 - UNIQ_SHIFT));
        Self((uniq << UNIQ_SHIFT) | ((otype as u64) << TYPE_SHIFT) | slot as u64)
    }

    /// The id of an MDC-backing mlog: `uniq = 2i` and `2i + 1` for MDCi.
    pub fn logid_make(uniq: u64, slot: u8) -> Self {
        Self::make(uniq, ObjType::Mlog, slot)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub fn uniq(self) -> u64 {
        self.0 >> UNIQ_SHIFT
    }

    pub fn slot(self) -> u8 {
        (self.0 & SLOT_MASK) as u8
    }

    pub fn otype(self) -> Result<ObjType> {
        match (self.0 >> TYPE_SHIFT) & TYPE_MASK {
            1 => Ok(ObjType::Mblock),
            2 => Ok(ObjType::Mlog),
            _ => Err(Error::with_msg(InvalidArgs, "objid carries no valid type")),
        }
    }

    /// Whether this id crosses a checkpoint boundary and must be persisted
    /// before it is returned to a caller.
    pub fn is_ckpt(self) -> bool {
        self.uniq() % CKPT_DELTA == 0
    }

    /// Whether this id names an MDC-backing mlog (slot 0).
    pub fn is_mdc_log(self) -> bool {
        self.slot() == 0 && matches!(self.otype(), Ok(ObjType::Mlog))
    }

    /// Whether this id names one of the two mlogs backing MDC0 itself.
    pub fn is_mdc0_log(self) -> bool {
        self.is_mdc_log() && self.uniq() <= 1
    }

    /// For an MDC-backing mlog, the MDC slot it belongs to.
    pub fn log_mdc_slot(self) -> u8 {
        debug_assert!(self.is_mdc_log());
        (self.uniq() / 2) as u8
    }
}

impl Debug for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjId({:#x})", self.0)
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Converts an objid into the opaque handle form clients hold.
pub fn objid_to_uhandle(objid: ObjId) -> u64 {
    objid.as_raw().rotate_left(32) ^ UHANDLE_MIX
}

/// Converts a client handle back into an objid, rejecting values that were
/// never produced by [`objid_to_uhandle`].
pub fn uhandle_to_objid(uhandle: u64) -> Result<ObjId> {
    let objid = ObjId::from_raw((uhandle ^ UHANDLE_MIX).rotate_right(32));
    objid.otype()?;
    Ok(objid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_extraction() {
        let id = ObjId::make(513, ObjType::Mblock, 3);
        assert_eq!(id.uniq(), 513);
        assert_eq!(id.otype().unwrap(), ObjType::Mblock);
        assert_eq!(id.slot(), 3);
        assert!(!id.is_mdc_log());
    }

    #[test]
    fn ckpt_boundaries() {
        assert!(ObjId::make(0, ObjType::Mlog, 1).is_ckpt());
        assert!(ObjId::make(CKPT_DELTA, ObjType::Mblock, 1).is_ckpt());
        assert!(ObjId::make(4 * CKPT_DELTA, ObjType::Mblock, 1).is_ckpt());
        assert!(!ObjId::make(CKPT_DELTA + 1, ObjType::Mblock, 1).is_ckpt());
    }

    #[test]
    fn mdc_log_ids() {
        let l0 = ObjId::logid_make(0, 0);
        let l1 = ObjId::logid_make(1, 0);
        assert!(l0.is_mdc0_log() && l1.is_mdc0_log());

        let l6 = ObjId::logid_make(6, 0);
        assert!(l6.is_mdc_log() && !l6.is_mdc0_log());
        assert_eq!(l6.log_mdc_slot(), 3);
    }

    #[test]
    fn uhandle_round_trip() {
        let id = ObjId::make(77, ObjType::Mlog, 2);
        let uh = objid_to_uhandle(id);
        assert_ne!(uh, id.as_raw());
        assert_eq!(uhandle_to_objid(uh).unwrap(), id);

        // A raw objid is not a valid handle.
        assert!(uhandle_to_objid(id.as_raw()).is_err());
    }
}
