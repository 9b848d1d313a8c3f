//! Per-architecture decoding policy: pointer width, byte order, alignment.
//!
//! The data model is selected from the header magic and nothing else; there
//! is no auto-detection. Every multi-byte read in the crate goes through the
//! [`scroll::Endian`] this module hands out.

use scroll::Endian;

use crate::error::{Error, Result};
use crate::header;

/// Immutable decoding policy for one image: pointer size, byte order and the
/// natural alignment of pointer-sized fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataModel {
    pointer_size: usize,
    endianness: Endian,
}

impl DataModel {
    /// Selects the data model for `magic`, which is expected to be the first
    /// four bytes of the image read as a little-endian `u32`. The `CIGAM`
    /// forms mean the image data is byte-swapped relative to that reading.
    ///
    /// Anything other than the four recognized values is refused.
    pub fn from_magic(magic: u32) -> Result<DataModel> {
        match magic {
            header::MH_MAGIC => Ok(DataModel { pointer_size: 4, endianness: Endian::Little }),
            header::MH_CIGAM => Ok(DataModel { pointer_size: 4, endianness: Endian::Big }),
            header::MH_MAGIC_64 => Ok(DataModel { pointer_size: 8, endianness: Endian::Little }),
            header::MH_CIGAM_64 => Ok(DataModel { pointer_size: 8, endianness: Endian::Big }),
            magic => Err(Error::BadMagic(magic as u64)),
        }
    }

    pub fn is_64(&self) -> bool {
        self.pointer_size == 8
    }

    /// Whether image data is byte-swapped relative to the little-endian
    /// reading of the magic.
    pub fn is_swapped(&self) -> bool {
        matches!(self.endianness, Endian::Big)
    }

    /// Pointer width in bytes: 4 or 8.
    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    pub fn endianness(&self) -> Endian {
        self.endianness
    }

    /// Alignment wide loads must honor before the map will perform them.
    pub fn natural_alignment(&self) -> usize {
        self.pointer_size
    }

    /// Size of the mach header under this model.
    pub fn header_size(&self) -> usize {
        if self.is_64() { header::SIZEOF_HEADER_64 } else { header::SIZEOF_HEADER_32 }
    }

    /// Size of one symbol-table entry (`nlist` / `nlist_64`).
    pub fn nlist_size(&self) -> usize {
        if self.is_64() { 16 } else { 12 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64};

    #[test]
    fn recognized_magics_select_the_model() {
        let dm = DataModel::from_magic(MH_MAGIC_64).unwrap();
        assert!(dm.is_64() && !dm.is_swapped());
        assert_eq!(dm.pointer_size(), 8);
        assert_eq!(dm.header_size(), 32);

        let dm = DataModel::from_magic(MH_MAGIC).unwrap();
        assert!(!dm.is_64() && !dm.is_swapped());
        assert_eq!(dm.nlist_size(), 12);

        assert!(DataModel::from_magic(MH_CIGAM).unwrap().is_swapped());
        let dm = DataModel::from_magic(MH_CIGAM_64).unwrap();
        assert!(dm.is_64() && dm.is_swapped());
    }

    #[test]
    fn anything_else_is_refused() {
        for magic in [0u32, 0xcafebabe, 0xbebafeca, 0xfeedfacd, 0x7f454c46] {
            match DataModel::from_magic(magic) {
                Err(Error::BadMagic(m)) => assert_eq!(m, magic as u64),
                other => panic!("expected BadMagic, got {other:?}"),
            }
        }
    }
}
