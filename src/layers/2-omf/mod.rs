// SPDX-License-Identifier: MPL-2.0

//! On-media format ("omf") of the metadata containers.
//!
//! Every MDC record is a tagged variant of [`MdcRec`], packed with
//! `postcard` (little-endian on media) into a scratch buffer of at most
//! [`MAX_REC_LEN`] bytes. The record taxonomy:
//!
//! - `Version` — content version of the log; if present it must be the
//!   first record.
//! - `McConfig` / `McSpare` / `MpConfig` — mpool-wide properties, MDC0 only.
//! - `OCreate` / `ODelete` / `OErase` / `OUpdate` / `OIdCkpt` — object
//!   records replayed by the recovery state machine.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    layers::pd::PdProps,
    os::String,
    prelude::*,
};

/// Upper bound of a packed record, and the size of every record scratch
/// buffer.
pub const MAX_REC_LEN: usize = 256;

/// Content version of an MDC log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MdcCver(pub u16, pub u16, pub u16, pub u16);

impl MdcCver {
    /// The version this binary writes.
    pub const LATEST: MdcCver = MdcCver(1, 0, 0, 1);
}

impl fmt::Display for MdcCver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0, self.1, self.2, self.3)
    }
}

/// Persisted state of a drive, carried by `McConfig`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdDesc {
    pub props: PdProps,
    /// `true` once the drive has been removed from the mpool.
    pub defunct: bool,
    /// `true` if the drive was missing at the last activation.
    pub unavail: bool,
}

/// Mpool-wide configuration, carried by `MpConfig`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpDesc {
    pub uuid: Uuid,
    pub name: String,
}

/// On-media description of an object layout.
///
/// Drives are referenced by UUID; drive indices are not stable across
/// activations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutDesc {
    pub objid: u64,
    pub gen: u64,
    pub pd_uuid: Uuid,
    pub zaddr: u64,
    pub zcnt: u32,
}

/// A metadata record as it appears in an MDC log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MdcRec {
    Version(MdcCver),
    McConfig(PdDesc),
    McSpare { mclass: u8, spzone_pct: u8 },
    MpConfig(MpDesc),
    OCreate(LayoutDesc),
    ODelete { objid: u64 },
    OErase { objid: u64, gen: u64 },
    OUpdate(LayoutDesc),
    OIdCkpt { objid: u64 },
}

impl MdcRec {
    /// Whether this is an object record (as opposed to a property record).
    pub fn is_obj_rec(&self) -> bool {
        matches!(
            self,
            MdcRec::OCreate(_)
                | MdcRec::ODelete { .. }
                | MdcRec::OErase { .. }
                | MdcRec::OUpdate(_)
                | MdcRec::OIdCkpt { .. }
        )
    }
}

/// Packs a record into `buf`, returning the packed length.
///
/// `buf` is expected to be a `MAX_REC_LEN` scratch buffer; a record that
/// does not fit fails with `TooBig`.
pub fn pack(rec: &MdcRec, buf: &mut [u8]) -> Result<usize> {
    match postcard::to_slice(rec, buf) {
        Ok(packed) => Ok(packed.len()),
        Err(postcard::Error::SerializeBufferFull) => {
            return_errno_with_msg!(TooBig, "record exceeds the record length bound")
        }
        Err(_) => return_errno_with_msg!(InvalidArgs, "record serialization failed"),
    }
}

/// Unpacks one record from an exact payload slice.
pub fn unpack(buf: &[u8]) -> Result<MdcRec> {
    postcard::from_bytes(buf).map_err(|_| Error::with_msg(Corrupt, "record undecodable"))
}

#[cfg(test)]
mod tests {
    use crate::layers::pd::{Mclass, PdDevType};

    use super::*;

    fn sample_props() -> PdProps {
        PdProps {
            uuid: Uuid::new_v4(),
            mclass: Mclass::Capacity,
            zonepg: 256,
            sectorsz: 512,
            devtype: PdDevType::File,
            features: 0,
        }
    }

    #[test]
    fn pack_unpack_round_trip() {
        let recs = [
            MdcRec::Version(MdcCver::LATEST),
            MdcRec::McConfig(PdDesc {
                props: sample_props(),
                defunct: false,
                unavail: false,
            }),
            MdcRec::McSpare {
                mclass: 0,
                spzone_pct: 5,
            },
            MdcRec::MpConfig(MpDesc {
                uuid: Uuid::new_v4(),
                name: "mp0".to_string(),
            }),
            MdcRec::OCreate(LayoutDesc {
                objid: 0x1001,
                gen: 0,
                pd_uuid: Uuid::new_v4(),
                zaddr: 17,
                zcnt: 3,
            }),
            MdcRec::ODelete { objid: 0x1001 },
            MdcRec::OErase {
                objid: 0x2002,
                gen: 9,
            },
            MdcRec::OUpdate(LayoutDesc {
                objid: 0x2002,
                gen: 1,
                pd_uuid: Uuid::new_v4(),
                zaddr: 40,
                zcnt: 1,
            }),
            MdcRec::OIdCkpt { objid: 0x100000 },
        ];

        let mut buf = [0u8; MAX_REC_LEN];
        for rec in recs {
            let len = pack(&rec, &mut buf).unwrap();
            assert!(len <= MAX_REC_LEN);
            assert_eq!(unpack(&buf[..len]).unwrap(), rec);
        }
    }

    #[test]
    fn obj_rec_classification() {
        assert!(MdcRec::OCreate(LayoutDesc {
            objid: 1,
            gen: 0,
            pd_uuid: Uuid::nil(),
            zaddr: 0,
            zcnt: 1,
        })
        .is_obj_rec());
        assert!(MdcRec::OIdCkpt { objid: 1 }.is_obj_rec());
        assert!(!MdcRec::Version(MdcCver::LATEST).is_obj_rec());
        assert!(!MdcRec::McSpare {
            mclass: 0,
            spzone_pct: 0
        }
        .is_obj_rec());
    }

    #[test]
    fn version_ordering() {
        assert!(MdcCver(1, 0, 0, 0) < MdcCver::LATEST);
        assert!(MdcCver(1, 0, 0, 2) > MdcCver::LATEST);
        assert!(MdcCver(2, 0, 0, 0) > MdcCver(1, 9, 9, 9));
    }
}
