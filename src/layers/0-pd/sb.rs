// SPDX-License-Identifier: MPL-2.0

//! The per-drive superblock image.
//!
//! Zone 0 of every drive is reserved for a small superblock naming the mpool
//! the drive belongs to. The drive hosting MDC0 additionally records the
//! location and generations of the MDC0 mlog pair; that is the bootstrap
//! information activation needs before any metadata log can be read.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PdDev;
use crate::{os::String, prelude::*};

const SB_MAGIC: u64 = 0x4d50_4f4f_4c53_4231;
/// Bytes reserved at the head of every drive for the superblock.
pub const SB_AREA_LEN: u64 = 4096;

/// Location and generation of one mlog of the MDC0 pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbMdcLoc {
    /// Raw object id of the mlog.
    pub logid: u64,
    pub zaddr: u64,
    pub zcnt: u32,
    pub gen: u64,
}

/// The superblock image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbImage {
    magic: u64,
    pub uuid: Uuid,
    pub name: String,
    /// MDC0 pair, present only on the drive hosting MDC0.
    pub mdc0: Option<[SbMdcLoc; 2]>,
}

impl SbImage {
    pub fn new(uuid: Uuid, name: String, mdc0: Option<[SbMdcLoc; 2]>) -> Self {
        Self {
            magic: SB_MAGIC,
            uuid,
            name,
            mdc0,
        }
    }
}

/// Persists the superblock image to the head of the drive.
pub fn write_update(dev: &dyn PdDev, sb: &SbImage) -> Result<()> {
    let mut buf = vec![0u8; SB_AREA_LEN as usize];
    let body = postcard::to_slice(sb, &mut buf[4..])
        .map_err(|_| Error::with_msg(TooBig, "superblock image too large"))?;
    let body_len = body.len() as u32;
    buf[..4].copy_from_slice(&body_len.to_le_bytes());
    dev.write_at(0, &buf)?;
    dev.flush()
}

/// Reads the superblock image from the head of the drive.
///
/// Returns `NotFound` for a blank drive and `Corrupt` for an unreadable
/// image.
pub fn read(dev: &dyn PdDev) -> Result<SbImage> {
    let mut buf = vec![0u8; SB_AREA_LEN as usize];
    dev.read_at(0, &mut buf)?;
    let body_len = u32::from_le_bytes(buf[..4].try_into().unwrap_or([0; 4])) as usize;
    if body_len == 0 {
        return_errno_with_msg!(NotFound, "no superblock on drive");
    }
    if body_len > buf.len() - 4 {
        return_errno_with_msg!(Corrupt, "superblock length out of range");
    }

    let sb: SbImage = postcard::from_bytes(&buf[4..4 + body_len])
        .map_err(|_| Error::with_msg(Corrupt, "superblock image undecodable"))?;
    if sb.magic != SB_MAGIC {
        return_errno_with_msg!(Corrupt, "superblock magic mismatch");
    }
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::pd::MemPd;

    #[test]
    fn sb_round_trip() {
        let dev = MemPd::new(SB_AREA_LEN * 4);
        assert_eq!(read(&dev).unwrap_err().errno(), NotFound);

        let sb = SbImage::new(
            Uuid::new_v4(),
            "mp0".to_string(),
            Some([
                SbMdcLoc {
                    logid: 2,
                    zaddr: 1,
                    zcnt: 1,
                    gen: 1,
                },
                SbMdcLoc {
                    logid: 3,
                    zaddr: 2,
                    zcnt: 1,
                    gen: 0,
                },
            ]),
        );
        write_update(&dev, &sb).unwrap();
        assert_eq!(read(&dev).unwrap(), sb);
    }
}
