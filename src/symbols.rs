//! The symbolic information triple: the flat string table, the `nlist`
//! symbol table that indexes into it, and the indirect symbol table that
//! stub and symbol-pointer sections consult.
//!
//! All three are windows the image carves out of the link-edit segment;
//! entries are materialized lazily on access, and a reference that falls
//! outside its table is an ordinary miss (`None`), never a crash.

use core::fmt::{self, Debug};

use scroll::{Endian, Pread, Pwrite, SizeWith};

use crate::data_model::DataModel;
use crate::node::{Backing, Describe, Field, Range};

// Masks and values for the n_type field
/// if any of these bits are set, this is a symbolic debugging entry
pub const N_STAB: u8 = 0xe0;
/// private external symbol bit
pub const N_PEXT: u8 = 0x10;
/// mask for the type bits
pub const N_TYPE: u8 = 0x0e;
/// external symbol bit
pub const N_EXT: u8 = 0x01;

// Values of n_type & N_TYPE
/// undefined, n_sect == NO_SECT
pub const N_UNDF: u8 = 0x0;
/// absolute, n_sect == NO_SECT
pub const N_ABS: u8 = 0x2;
/// defined in section number n_sect
pub const N_SECT: u8 = 0xe;
/// prebound undefined (defined in a dylib)
pub const N_PBUD: u8 = 0xc;
/// indirect
pub const N_INDR: u8 = 0xa;

/// symbol is not in any section
pub const NO_SECT: u8 = 0;

// Sentinels in the indirect symbol table
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
pub const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

/// A 32-bit symbol table entry as it sits on disk.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Nlist32 {
    /// index into the string table
    pub n_strx: u32,
    /// type flag
    pub n_type: u8,
    /// section number or NO_SECT
    pub n_sect: u8,
    /// see <mach-o/stab.h>
    pub n_desc: u16,
    /// value of this symbol (or stab offset)
    pub n_value: u32,
}

pub const SIZEOF_NLIST_32: usize = 12;

/// A 64-bit symbol table entry as it sits on disk.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Nlist64 {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

pub const SIZEOF_NLIST_64: usize = 16;

/// A width-unified symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// index into the string table
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

impl Symbol {
    pub fn is_stab(&self) -> bool {
        self.n_type & N_STAB != 0
    }

    pub fn is_external(&self) -> bool {
        self.n_type & N_EXT != 0
    }

    pub fn is_undefined(&self) -> bool {
        !self.is_stab() && self.n_type & N_TYPE == N_UNDF
    }
}

impl From<Nlist32> for Symbol {
    fn from(nlist: Nlist32) -> Symbol {
        Symbol {
            n_strx: nlist.n_strx,
            n_type: nlist.n_type,
            n_sect: nlist.n_sect,
            n_desc: nlist.n_desc,
            n_value: nlist.n_value as u64,
        }
    }
}

impl From<Nlist64> for Symbol {
    fn from(nlist: Nlist64) -> Symbol {
        Symbol {
            n_strx: nlist.n_strx,
            n_type: nlist.n_type,
            n_sect: nlist.n_sect,
            n_desc: nlist.n_desc,
            n_value: nlist.n_value,
        }
    }
}

impl Describe for Symbol {
    fn description(&self) -> Vec<Field> {
        vec![
            Field::dec("n_strx", self.n_strx as u64),
            Field::hex("n_type", self.n_type as u64),
            Field::dec("n_sect", self.n_sect as u64),
            Field::hex("n_desc", self.n_desc as u64),
            Field::hex("n_value", self.n_value),
        ]
    }
}

/// The flat buffer of NUL-terminated strings the symbol table indexes into.
#[derive(Debug, Clone)]
pub struct StringTable {
    backing: Backing,
}

impl StringTable {
    pub(crate) fn new(backing: Backing) -> StringTable {
        StringTable { backing }
    }

    pub fn range(&self) -> Range {
        self.backing.range()
    }

    pub fn len(&self) -> u64 {
        self.backing.range().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The string starting at `offset`: bytes up to the next NUL, bounded by
    /// the table. An offset at or past the end of the table is a miss.
    pub fn string_at(&self, offset: u32) -> Option<String> {
        let offset = offset as u64;
        let remaining = self.len().checked_sub(offset).filter(|&r| r > 0)?;
        let bytes = self.backing.view_at(offset, remaining).ok()?;
        let end = bytes.iter().position(|&byte| byte == 0).unwrap_or(bytes.len());
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

impl Describe for StringTable {
    fn description(&self) -> Vec<Field> {
        vec![
            Field::hex("address", self.backing.range().addr.0),
            Field::dec("strsize", self.len()),
        ]
    }
}

/// The `nlist` symbol table. Entries are decoded on access, not up front.
#[derive(Clone)]
pub struct SymbolTable {
    backing: Backing,
    dm: DataModel,
    nsyms: u32,
    strings: Option<StringTable>,
}

impl SymbolTable {
    pub(crate) fn new(
        backing: Backing,
        dm: DataModel,
        nsyms: u32,
        strings: Option<StringTable>,
    ) -> SymbolTable {
        SymbolTable { backing, dm, nsyms, strings }
    }

    pub fn range(&self) -> Range {
        self.backing.range()
    }

    pub fn len(&self) -> u32 {
        self.nsyms
    }

    pub fn is_empty(&self) -> bool {
        self.nsyms == 0
    }

    /// Decode entry `index`, a miss when `index` is out of range or the
    /// entry's bytes cannot be read.
    pub fn get(&self, index: u32) -> Option<Symbol> {
        if index >= self.nsyms {
            return None;
        }
        let entry_size = self.dm.nlist_size();
        let offset = index as u64 * entry_size as u64;
        let bytes = self.backing.view_at(offset, entry_size as u64).ok()?;
        let le = self.dm.endianness();
        if self.dm.is_64() {
            bytes.pread_with::<Nlist64>(0, le).ok().map(Symbol::from)
        } else {
            bytes.pread_with::<Nlist32>(0, le).ok().map(Symbol::from)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Symbol> + '_ {
        (0..self.nsyms).filter_map(move |index| self.get(index))
    }

    /// Resolve a symbol's name through the string table. A miss when the
    /// string table is absent or the symbol's index is past its end.
    pub fn name_of(&self, symbol: &Symbol) -> Option<String> {
        self.strings.as_ref()?.string_at(symbol.n_strx)
    }
}

impl Debug for SymbolTable {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("SymbolTable")
            .field("range", &self.backing.range())
            .field("nsyms", &self.nsyms)
            .field("strings", &self.strings.is_some())
            .finish()
    }
}

impl Describe for SymbolTable {
    fn description(&self) -> Vec<Field> {
        vec![
            Field::hex("address", self.backing.range().addr.0),
            Field::dec("nsyms", self.nsyms as u64),
        ]
    }
}

/// One decoded indirect-symbol-table entry: a sentinel or a symbol index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectEntry {
    /// The entry refers to a local symbol that was stripped.
    Local,
    /// The entry refers to an absolute symbol that was stripped.
    Absolute,
    /// Both sentinel bits set.
    LocalAbsolute,
    /// An index into the symbol table.
    Symbol(u32),
}

impl IndirectEntry {
    fn decode(value: u32) -> IndirectEntry {
        let local = value & INDIRECT_SYMBOL_LOCAL != 0;
        let abs = value & INDIRECT_SYMBOL_ABS != 0;
        match (local, abs) {
            (true, true) => IndirectEntry::LocalAbsolute,
            (true, false) => IndirectEntry::Local,
            (false, true) => IndirectEntry::Absolute,
            (false, false) => IndirectEntry::Symbol(value),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        !matches!(self, IndirectEntry::Symbol(_))
    }

    pub fn symbol_index(&self) -> Option<u32> {
        match self {
            IndirectEntry::Symbol(index) => Some(*index),
            _ => None,
        }
    }
}

/// The flat array of 32-bit indices consulted by stub and symbol-pointer
/// sections.
#[derive(Debug, Clone)]
pub struct IndirectSymbolTable {
    backing: Backing,
    le: Endian,
    count: u32,
}

pub const SIZEOF_INDIRECT_ENTRY: usize = 4;

impl IndirectSymbolTable {
    pub(crate) fn new(backing: Backing, le: Endian, count: u32) -> IndirectSymbolTable {
        IndirectSymbolTable { backing, le, count }
    }

    pub fn range(&self) -> Range {
        self.backing.range()
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, index: u32) -> Option<IndirectEntry> {
        if index >= self.count {
            return None;
        }
        let offset = index as u64 * SIZEOF_INDIRECT_ENTRY as u64;
        let bytes = self.backing.view_at(offset, SIZEOF_INDIRECT_ENTRY as u64).ok()?;
        bytes.pread_with::<u32>(0, self.le).ok().map(IndirectEntry::decode)
    }

    pub fn iter(&self) -> impl Iterator<Item = IndirectEntry> + '_ {
        (0..self.count).filter_map(move |index| self.get(index))
    }
}

impl Describe for IndirectSymbolTable {
    fn description(&self) -> Vec<Field> {
        vec![
            Field::hex("address", self.backing.range().addr.0),
            Field::dec("nindirectsyms", self.count as u64),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ContextAddress;
    use crate::data_model::DataModel;
    use crate::header::MH_MAGIC_64;
    use crate::map::{FileMap, MemoryMap};
    use std::sync::Arc;

    fn table_backing(bytes: Vec<u8>) -> Backing {
        let size = bytes.len() as u64;
        let map = Arc::new(MemoryMap::from(FileMap::from_bytes(bytes)));
        Backing::new(map, Range::new(ContextAddress(0), size)).unwrap()
    }

    #[test]
    fn string_table_is_nul_and_size_bounded() {
        let strings = StringTable::new(table_backing(b"\0_main\0_start\0junk".to_vec()));
        assert_eq!(strings.string_at(1).as_deref(), Some("_main"));
        assert_eq!(strings.string_at(7).as_deref(), Some("_start"));
        assert_eq!(strings.string_at(0).as_deref(), Some(""));
        // No terminating NUL: bounded by the table end.
        assert_eq!(strings.string_at(14).as_deref(), Some("junk"));
        assert_eq!(strings.string_at(18), None);
        assert_eq!(strings.string_at(0x7fff_ffff), None);
    }

    #[test]
    fn symbols_materialize_lazily_with_names() {
        let dm = DataModel::from_magic(MH_MAGIC_64).unwrap();
        let mut bytes = Vec::new();
        for (strx, value) in [(1u32, 0x1000u64), (7, 0x2000)] {
            let mut entry = [0u8; SIZEOF_NLIST_64];
            entry
                .pwrite_with(
                    Nlist64 {
                        n_strx: strx,
                        n_type: N_SECT | N_EXT,
                        n_sect: 1,
                        n_desc: 0,
                        n_value: value,
                    },
                    0,
                    scroll::LE,
                )
                .unwrap();
            bytes.extend_from_slice(&entry);
        }
        let strings = StringTable::new(table_backing(b"\0_main\0_start\0".to_vec()));
        let table = SymbolTable::new(table_backing(bytes), dm, 2, Some(strings));
        let first = table.get(0).unwrap();
        assert_eq!(first.n_value, 0x1000);
        assert_eq!(table.name_of(&first).as_deref(), Some("_main"));
        let second = table.get(1).unwrap();
        assert_eq!(table.name_of(&second).as_deref(), Some("_start"));
        assert_eq!(table.get(2), None);
        assert_eq!(table.iter().count(), 2);
    }

    #[test]
    fn indirect_entries_decode_sentinels() {
        assert_eq!(IndirectEntry::decode(5), IndirectEntry::Symbol(5));
        assert_eq!(IndirectEntry::decode(INDIRECT_SYMBOL_LOCAL), IndirectEntry::Local);
        assert_eq!(IndirectEntry::decode(INDIRECT_SYMBOL_ABS), IndirectEntry::Absolute);
        assert_eq!(
            IndirectEntry::decode(INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS),
            IndirectEntry::LocalAbsolute
        );
        assert!(IndirectEntry::Local.is_sentinel());
        assert_eq!(IndirectEntry::Symbol(3).symbol_index(), Some(3));

        let mut bytes = Vec::new();
        for value in [1u32, INDIRECT_SYMBOL_LOCAL, 0] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let table = IndirectSymbolTable::new(table_backing(bytes), scroll::LE, 3);
        assert_eq!(table.get(0), Some(IndirectEntry::Symbol(1)));
        assert_eq!(table.get(1), Some(IndirectEntry::Local));
        assert_eq!(table.get(2), Some(IndirectEntry::Symbol(0)));
        assert_eq!(table.get(3), None);
    }
}
