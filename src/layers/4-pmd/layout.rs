// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use uuid::Uuid;

use super::objid::{ObjId, ObjType};
use crate::{layers::omf::LayoutDesc, os::RwLock, prelude::*};

const STATE_COMMITTED: u8 = 0b01;
const STATE_REMOVED: u8 = 0b10;

/// In-memory descriptor of one object's on-drive placement.
///
/// The placement fields are immutable after commit. The flag, refcount and
/// generation fields are mutated only under the owning slot's locks; the
/// atomics make the reads cheap, they are not a synchronization protocol of
/// their own. The per-layout rwlock isolates payload readers from erase.
pub struct Layout {
    objid: ObjId,
    pd_uuid: Uuid,
    /// Index of the owning drive in the activation drive list.
    pdi: usize,
    zaddr: u64,
    zcnt: u32,
    zone_bytes: u64,
    gen: AtomicU64,
    state: AtomicU8,
    isdel: AtomicBool,
    refcnt: AtomicU32,
    rwlock: RwLock<()>,
}

impl Layout {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        objid: ObjId,
        pd_uuid: Uuid,
        pdi: usize,
        zaddr: u64,
        zcnt: u32,
        zone_bytes: u64,
        gen: u64,
        committed: bool,
        refcnt: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            objid,
            pd_uuid,
            pdi,
            zaddr,
            zcnt,
            zone_bytes,
            gen: AtomicU64::new(gen),
            state: AtomicU8::new(if committed { STATE_COMMITTED } else { 0 }),
            isdel: AtomicBool::new(false),
            refcnt: AtomicU32::new(refcnt),
            rwlock: RwLock::new(()),
        })
    }

    pub fn objid(&self) -> ObjId {
        self.objid
    }

    pub fn otype(&self) -> ObjType {
        // Layouts are only built from ids with a valid type.
        self.objid.otype().unwrap_or(ObjType::Mblock)
    }

    pub fn pd_uuid(&self) -> Uuid {
        self.pd_uuid
    }

    pub(crate) fn pdi(&self) -> usize {
        self.pdi
    }

    pub fn zaddr(&self) -> u64 {
        self.zaddr
    }

    pub fn zcnt(&self) -> u32 {
        self.zcnt
    }

    /// Allocated length in bytes.
    pub fn alen(&self) -> u64 {
        self.zcnt as u64 * self.zone_bytes
    }

    pub fn gen(&self) -> u64 {
        self.gen.load(Ordering::Acquire)
    }

    pub(crate) fn set_gen(&self, gen: u64) {
        self.gen.store(gen, Ordering::Release);
    }

    pub fn is_committed(&self) -> bool {
        self.state.load(Ordering::Acquire) & STATE_COMMITTED != 0
    }

    pub fn is_removed(&self) -> bool {
        self.state.load(Ordering::Acquire) & STATE_REMOVED != 0
    }

    pub fn is_del(&self) -> bool {
        self.isdel.load(Ordering::Acquire)
    }

    /// Committed and visible to clients.
    pub fn is_visible(&self) -> bool {
        self.is_committed() && !self.is_removed() && !self.is_del()
    }

    pub(crate) fn set_committed(&self, committed: bool) {
        if committed {
            self.state.fetch_or(STATE_COMMITTED, Ordering::AcqRel);
        } else {
            self.state.fetch_and(!STATE_COMMITTED, Ordering::AcqRel);
        }
    }

    pub(crate) fn set_removed(&self, removed: bool) {
        if removed {
            self.state.fetch_or(STATE_REMOVED, Ordering::AcqRel);
        } else {
            self.state.fetch_and(!STATE_REMOVED, Ordering::AcqRel);
        }
    }

    pub(crate) fn set_del(&self, isdel: bool) {
        self.isdel.store(isdel, Ordering::Release);
    }

    pub(crate) fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub(crate) fn ref_inc(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn ref_dec(&self) {
        self.refcnt.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn ref_reset(&self) {
        self.refcnt.store(0, Ordering::Release);
    }

    /// On-media form of this layout.
    pub(crate) fn desc(&self) -> LayoutDesc {
        LayoutDesc {
            objid: self.objid.as_raw(),
            gen: self.gen(),
            pd_uuid: self.pd_uuid,
            zaddr: self.zaddr,
            zcnt: self.zcnt,
        }
    }

    /// Takes the payload latch shared, for readers of the object payload.
    pub fn payload_read(&self) -> crate::os::RwLockReadGuard<'_, ()> {
        self.rwlock.read()
    }

    /// Takes the payload latch exclusive, isolating erase from readers.
    pub fn payload_write(&self) -> crate::os::RwLockWriteGuard<'_, ()> {
        self.rwlock.write()
    }
}

impl Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layout")
            .field("objid", &self.objid)
            .field("pd", &self.pd_uuid)
            .field("zaddr", &self.zaddr)
            .field("zcnt", &self.zcnt)
            .field("gen", &self.gen())
            .field("committed", &self.is_committed())
            .field("isdel", &self.is_del())
            .finish()
    }
}
