//! Segments and their sections.
//!
//! A segment node is *derived* from a segment load command after the command
//! walk: the image iterates segment commands and instantiates one node per
//! command. The node's context range is the single most load-bearing
//! address-kind decision in the crate — reads through a segment land in
//! file-backed bytes when the image came from a file and in VM-backed bytes
//! when it came from memory — so it is made explicitly, per origin, at
//! construction.

use std::sync::Arc;

use scroll::Pread;

use crate::addr::{ContextAddress, FileAddress, VmAddress};
use crate::constants::{
    S_CSTRING_LITERALS, S_GB_ZEROFILL, S_LAZY_DYLIB_SYMBOL_POINTERS, S_LAZY_SYMBOL_POINTERS,
    S_NON_LAZY_SYMBOL_POINTERS, S_REGULAR, S_SYMBOL_STUBS, S_ZEROFILL, SECT_CSTRING,
    SECTION_TYPE, SEG_TEXT,
};
use crate::data_model::DataModel;
use crate::error::{Error, Result};
use crate::image::AddressSpace;
use crate::load_command::{
    CommandVariant, LoadCommand, SIZEOF_SECTION_32, SIZEOF_SECTION_64,
    SIZEOF_SEGMENT_COMMAND_32, SIZEOF_SEGMENT_COMMAND_64, Section32, Section64,
};
use crate::map::MemoryMap;
use crate::node::{Backing, Describe, Field, Range, Warning};

// Constants for the flags field of a segment command
/// the file contents for this segment are for the high part of the VM space,
/// the low part is zero filled (for stacks in core files)
pub const SG_HIGHVM: u32 = 0x1;
/// this segment is the VM allocated by a fixed VM library
pub const SG_FVMLIB: u32 = 0x2;
/// this segment has nothing that was relocated in it or to it
pub const SG_NORELOC: u32 = 0x4;
/// this segment is protected; pages past the first are encrypted
pub const SG_PROTECTED_VERSION_1: u32 = 0x8;

// VM protection bits for maxprot/initprot
pub const VM_PROT_READ: u32 = 0x1;
pub const VM_PROT_WRITE: u32 = 0x2;
pub const VM_PROT_EXECUTE: u32 = 0x4;

/// A contiguous range of memory mapped from the image at load time.
#[derive(Debug, Clone)]
pub struct Segment {
    backing: Backing,
    pub name: String,
    pub vmaddr: VmAddress,
    pub vmsize: u64,
    pub fileoff: FileAddress,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub flags: u32,
    /// Index of the defining load command in the image's command list.
    pub command_index: usize,
    sections: Vec<Section>,
    pub warnings: Vec<Warning>,
    memory_origin: bool,
}

impl Segment {
    /// Derive a segment node from a segment load command. Returns `None` for
    /// non-segment commands.
    pub(crate) fn from_command(
        map: &Arc<MemoryMap>,
        dm: DataModel,
        space: &AddressSpace,
        command_index: usize,
        command: &LoadCommand,
    ) -> Option<Segment> {
        let raw = RawSegment::from_variant(&command.variant)?;
        let mut warnings = Vec::new();
        let name = name16(&raw.segname);

        let backing = segment_backing(map, space, &raw, command.address, &mut warnings);
        let sections = parse_sections(
            map,
            dm,
            space,
            command,
            &raw,
            &backing,
            &mut warnings,
        );

        Some(Segment {
            backing,
            name,
            vmaddr: VmAddress(raw.vmaddr),
            vmsize: raw.vmsize,
            fileoff: FileAddress(raw.fileoff),
            filesize: raw.filesize,
            maxprot: raw.maxprot,
            initprot: raw.initprot,
            flags: raw.flags,
            command_index,
            sections,
            warnings,
            memory_origin: space.memory_origin,
        })
    }

    /// The segment's window in the context space; empty for zero-fill
    /// segments and for segments whose bytes the map does not cover.
    pub fn range(&self) -> Range {
        self.backing.range()
    }

    pub(crate) fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section_named(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name == name)
    }

    pub fn section_at_index(&self, index: usize) -> Option<&Section> {
        self.sections.get(index)
    }

    /// The section whose context range covers `addr`.
    pub fn section_containing(&self, addr: ContextAddress) -> Option<&Section> {
        self.sections.iter().find(|section| section.range().contains(addr))
    }

    /// Whether this segment has no file-resident content (`__PAGEZERO`,
    /// `__bss`-only segments, …).
    pub fn is_zero_fill(&self) -> bool {
        self.filesize == 0 && self.vmsize > 0
    }

    /// Bounded read of segment content. Zero-fill segments have no mapped
    /// bytes: when the image origin is memory their reads synthesize zeroes
    /// up to `vmsize`; when the origin is a file they fail.
    pub fn read_at(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        if self.is_zero_fill() && self.memory_origin {
            let end = offset
                .checked_add(size)
                .ok_or(Error::OutOfRange { address: offset, size })?;
            if end > self.vmsize {
                return Err(Error::OutOfRange { address: offset, size });
            }
            return Ok(vec![0; size as usize]);
        }
        self.backing.read_at(offset, size)
    }
}

impl Describe for Segment {
    fn description(&self) -> Vec<Field> {
        vec![
            Field::string("name", &self.name),
            Field::hex("vmaddr", self.vmaddr.0),
            Field::hex("vmsize", self.vmsize),
            Field::hex("fileoff", self.fileoff.0),
            Field::hex("filesize", self.filesize),
            Field::hex("maxprot", self.maxprot as u64),
            Field::hex("initprot", self.initprot as u64),
            Field::hex("flags", self.flags as u64),
            Field::dec("sections", self.sections.len() as u64),
        ]
    }
}

/// What a section's content is, decided by an ordered rule list over
/// `(section type, segment name, section name)` — first match wins,
/// unrecognized sections fall back to [`SectionVariant::Generic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionVariant {
    /// Fixed-size machine thunks; the stub size is the descriptor's
    /// reserved2 field.
    Stubs { stub_size: u32 },
    /// NUL-terminated literal strings.
    CStrings,
    /// Pointer-sized entries, entry `i` paired with indirect-symbol entry
    /// `reserved1 + i`.
    IndirectPointers,
    /// Anything else: only the range is exposed.
    Generic,
}

#[derive(Clone, Copy)]
enum SectionKind {
    Stubs,
    CStrings,
    IndirectPointers,
}

/// The dispatch rule list. A `None` component matches anything.
const SECTION_RULES: &[(Option<u32>, Option<&str>, Option<&str>, SectionKind)] = &[
    (Some(S_SYMBOL_STUBS), None, None, SectionKind::Stubs),
    (Some(S_CSTRING_LITERALS), None, None, SectionKind::CStrings),
    (Some(S_LAZY_SYMBOL_POINTERS), None, None, SectionKind::IndirectPointers),
    (Some(S_NON_LAZY_SYMBOL_POINTERS), None, None, SectionKind::IndirectPointers),
    (Some(S_LAZY_DYLIB_SYMBOL_POINTERS), None, None, SectionKind::IndirectPointers),
    (Some(S_REGULAR), Some(SEG_TEXT), Some(SECT_CSTRING), SectionKind::CStrings),
];

fn classify(flags: u32, segname: &str, sectname: &str, reserved2: u32) -> SectionVariant {
    let section_type = flags & SECTION_TYPE;
    for (ty, seg, sect, kind) in SECTION_RULES {
        if ty.is_some_and(|ty| ty != section_type) {
            continue;
        }
        if seg.is_some_and(|seg| seg != segname) {
            continue;
        }
        if sect.is_some_and(|sect| sect != sectname) {
            continue;
        }
        return match kind {
            SectionKind::Stubs => SectionVariant::Stubs { stub_size: reserved2 },
            SectionKind::CStrings => SectionVariant::CStrings,
            SectionKind::IndirectPointers => SectionVariant::IndirectPointers,
        };
    }
    SectionVariant::Generic
}

/// A named, typed sub-range of a segment.
#[derive(Debug, Clone)]
pub struct Section {
    backing: Backing,
    pub name: String,
    pub segment_name: String,
    pub addr: VmAddress,
    pub size: u64,
    /// file offset of this section
    pub offset: u32,
    /// section alignment (power of 2)
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub variant: SectionVariant,
}

impl Section {
    pub fn range(&self) -> Range {
        self.backing.range()
    }

    pub fn section_type(&self) -> u32 {
        self.flags & SECTION_TYPE
    }

    pub fn is_zero_fill(&self) -> bool {
        matches!(self.section_type(), S_ZEROFILL | S_GB_ZEROFILL)
    }

    /// Bounded read of section content.
    pub fn read_at(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.backing.read_at(offset, size)
    }

    /// Number of entries for stub and indirect-pointer sections, `None` for
    /// other variants (or a stub size of zero).
    pub fn entry_count(&self, dm: DataModel) -> Option<u64> {
        match self.variant {
            SectionVariant::Stubs { stub_size } if stub_size > 0 => {
                Some(self.size / stub_size as u64)
            }
            SectionVariant::IndirectPointers => Some(self.size / dm.pointer_size() as u64),
            _ => None,
        }
    }

    /// The indirect-symbol-table index paired with entry `entry` of a stub
    /// or indirect-pointer section.
    pub fn indirect_table_index(&self, entry: u64) -> Option<u32> {
        match self.variant {
            SectionVariant::Stubs { .. } | SectionVariant::IndirectPointers => {
                u32::try_from(self.reserved1 as u64 + entry).ok()
            }
            _ => None,
        }
    }

    /// The pointer stored at entry `entry` of an indirect-pointer section.
    pub fn pointer_value(&self, entry: u64, dm: DataModel) -> Result<u64> {
        let pointer_size = dm.pointer_size() as u64;
        let offset = entry
            .checked_mul(pointer_size)
            .ok_or(Error::OutOfRange { address: entry, size: pointer_size })?;
        let bytes = self.backing.view_at(offset, pointer_size)?;
        let value = if dm.is_64() {
            bytes.pread_with::<u64>(0, dm.endianness())?
        } else {
            bytes.pread_with::<u32>(0, dm.endianness())? as u64
        };
        Ok(value)
    }

    /// Enumerate the NUL-terminated strings of a C-string section.
    pub fn cstrings(&self) -> Result<Vec<String>> {
        if self.variant != SectionVariant::CStrings {
            return Err(Error::Malformed(format!(
                "section {},{} is not a C-string section",
                self.segment_name, self.name
            )));
        }
        let bytes = self.backing.view_at(0, self.backing.range().size)?;
        Ok(bytes
            .split(|&byte| byte == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect())
    }
}

impl Describe for Section {
    fn description(&self) -> Vec<Field> {
        vec![
            Field::string("sectname", &self.name),
            Field::string("segname", &self.segment_name),
            Field::hex("addr", self.addr.0),
            Field::hex("size", self.size),
            Field::hex("offset", self.offset as u64),
            Field::dec("align", self.align as u64),
            Field::hex("flags", self.flags as u64),
            Field::hex("reserved1", self.reserved1 as u64),
            Field::hex("reserved2", self.reserved2 as u64),
        ]
    }
}

/// The width-unified fields of a segment command.
struct RawSegment {
    segname: [u8; 16],
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    maxprot: u32,
    initprot: u32,
    nsects: u32,
    flags: u32,
    cmdsize: u32,
    is_64: bool,
}

impl RawSegment {
    fn from_variant(variant: &CommandVariant) -> Option<RawSegment> {
        match variant {
            CommandVariant::Segment32(c) => Some(RawSegment {
                segname: c.segname,
                vmaddr: c.vmaddr as u64,
                vmsize: c.vmsize as u64,
                fileoff: c.fileoff as u64,
                filesize: c.filesize as u64,
                maxprot: c.maxprot,
                initprot: c.initprot,
                nsects: c.nsects,
                flags: c.flags,
                cmdsize: c.cmdsize,
                is_64: false,
            }),
            CommandVariant::Segment64(c) => Some(RawSegment {
                segname: c.segname,
                vmaddr: c.vmaddr,
                vmsize: c.vmsize,
                fileoff: c.fileoff,
                filesize: c.filesize,
                maxprot: c.maxprot,
                initprot: c.initprot,
                nsects: c.nsects,
                flags: c.flags,
                cmdsize: c.cmdsize,
                is_64: true,
            }),
            _ => None,
        }
    }

    fn fixed_size(&self) -> usize {
        if self.is_64 { SIZEOF_SEGMENT_COMMAND_64 } else { SIZEOF_SEGMENT_COMMAND_32 }
    }

    fn section_size(&self) -> usize {
        if self.is_64 { SIZEOF_SECTION_64 } else { SIZEOF_SECTION_32 }
    }
}

/// Pick the segment's node range for the image origin and validate it
/// against the map. Failures degrade to an empty range with a warning; the
/// segment node is still constructed.
fn segment_backing(
    map: &Arc<MemoryMap>,
    space: &AddressSpace,
    raw: &RawSegment,
    command_address: ContextAddress,
    warnings: &mut Vec<Warning>,
) -> Backing {
    let zero_fill = raw.filesize == 0;
    let (addr, size) = if space.memory_origin {
        (space.context_for_vm(VmAddress(raw.vmaddr)), raw.vmsize)
    } else {
        (space.context_for_file(FileAddress(raw.fileoff)), raw.filesize)
    };
    let Some(addr) = addr else {
        warnings.push(Warning::new(
            command_address,
            format!("segment {} has no address in this origin", name16(&raw.segname)),
        ));
        return Backing::empty(Arc::clone(map), command_address);
    };
    if zero_fill {
        return Backing::empty(Arc::clone(map), addr);
    }
    match Backing::new(Arc::clone(map), Range::new(addr, size)) {
        Ok(backing) => backing,
        Err(err) => {
            warnings.push(Warning::new(
                command_address,
                format!(
                    "segment {} content {size:#x} bytes at {addr} is not mapped: {err}",
                    name16(&raw.segname)
                ),
            ));
            Backing::empty(Arc::clone(map), addr)
        }
    }
}

/// Decode the section descriptors trailing a segment command, eagerly.
fn parse_sections(
    map: &Arc<MemoryMap>,
    dm: DataModel,
    space: &AddressSpace,
    command: &LoadCommand,
    raw: &RawSegment,
    segment_backing: &Backing,
    warnings: &mut Vec<Warning>,
) -> Vec<Section> {
    let fixed = raw.fixed_size();
    let each = raw.section_size();
    let declared = raw.nsects as usize;
    let room = (raw.cmdsize as usize).saturating_sub(fixed) / each;
    let count = if declared > room {
        warnings.push(Warning::new(
            command.address,
            format!("segment declares {declared} sections but has room for {room}"),
        ));
        room
    } else {
        declared
    };

    let mut sections = Vec::with_capacity(count);
    for index in 0..count {
        let offset = fixed as u64 + (index * each) as u64;
        let Some(address) = command.address.checked_add(offset) else { break };
        let bytes = match map.view(address, each as u64) {
            Ok(bytes) => bytes,
            Err(err) => {
                warnings.push(Warning::new(
                    address,
                    format!("section descriptor {index} unreadable: {err}"),
                ));
                break;
            }
        };
        let section = if raw.is_64 {
            bytes
                .pread_with::<Section64>(0, dm.endianness())
                .ok()
                .map(|raw64| build_section(map, space, raw, segment_backing, raw64.into(), warnings))
        } else {
            bytes
                .pread_with::<Section32>(0, dm.endianness())
                .ok()
                .map(|raw32| build_section(map, space, raw, segment_backing, raw32.into(), warnings))
        };
        match section {
            Some(section) => sections.push(section),
            None => break,
        }
    }
    sections
}

struct RawSection {
    sectname: [u8; 16],
    segname: [u8; 16],
    addr: u64,
    size: u64,
    offset: u32,
    align: u32,
    reloff: u32,
    nreloc: u32,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
}

impl From<Section32> for RawSection {
    fn from(s: Section32) -> RawSection {
        RawSection {
            sectname: s.sectname,
            segname: s.segname,
            addr: s.addr as u64,
            size: s.size as u64,
            offset: s.offset,
            align: s.align,
            reloff: s.reloff,
            nreloc: s.nreloc,
            flags: s.flags,
            reserved1: s.reserved1,
            reserved2: s.reserved2,
        }
    }
}

impl From<Section64> for RawSection {
    fn from(s: Section64) -> RawSection {
        RawSection {
            sectname: s.sectname,
            segname: s.segname,
            addr: s.addr,
            size: s.size,
            offset: s.offset,
            align: s.align,
            reloff: s.reloff,
            nreloc: s.nreloc,
            flags: s.flags,
            reserved1: s.reserved1,
            reserved2: s.reserved2,
        }
    }
}

fn build_section(
    map: &Arc<MemoryMap>,
    space: &AddressSpace,
    segment: &RawSegment,
    segment_backing: &Backing,
    raw: RawSection,
    warnings: &mut Vec<Warning>,
) -> Section {
    let name = name16(&raw.sectname);
    let segment_name = name16(&raw.segname);
    let variant = classify(raw.flags, &segment_name, &name, raw.reserved2);
    let zero_fill = matches!(raw.flags & SECTION_TYPE, S_ZEROFILL | S_GB_ZEROFILL);

    // VM containment inside the declaring segment (checked in the VM space,
    // where both are always defined).
    let seg_end = segment.vmaddr.checked_add(segment.vmsize);
    let sect_end = raw.addr.checked_add(raw.size);
    let contained = match (seg_end, sect_end) {
        (Some(seg_end), Some(sect_end)) => {
            raw.size == 0 || (raw.addr >= segment.vmaddr && sect_end <= seg_end)
        }
        _ => false,
    };
    if !contained {
        warnings.push(Warning::new(
            segment_backing.range().addr,
            format!(
                "section {segment_name},{name} [{:#x}, {:#x}) escapes its segment [{:#x}, {:#x})",
                raw.addr,
                raw.addr.wrapping_add(raw.size),
                segment.vmaddr,
                segment.vmaddr.wrapping_add(segment.vmsize),
            ),
        ));
    }

    let addr = if space.memory_origin {
        space.context_for_vm(VmAddress(raw.addr))
    } else {
        space.context_for_file(FileAddress(raw.offset as u64))
    };
    let backing = match addr {
        Some(addr) if !zero_fill => {
            match segment_backing.child(Range::new(addr, raw.size)) {
                Ok(backing) => backing,
                Err(_) => {
                    warnings.push(Warning::new(
                        addr,
                        format!("section {segment_name},{name} content escapes its segment"),
                    ));
                    Backing::empty(Arc::clone(map), addr)
                }
            }
        }
        Some(addr) => Backing::empty(Arc::clone(map), addr),
        None => Backing::empty(Arc::clone(map), segment_backing.range().addr),
    };

    Section {
        backing,
        name,
        segment_name,
        addr: VmAddress(raw.addr),
        size: raw.size,
        offset: raw.offset,
        align: raw.align,
        reloff: raw.reloff,
        nreloc: raw.nreloc,
        flags: raw.flags,
        reserved1: raw.reserved1,
        reserved2: raw.reserved2,
        variant,
    }
}

fn name16(bytes: &[u8; 16]) -> String {
    let end = bytes.iter().position(|&byte| byte == 0).unwrap_or(16);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_are_walked_in_order_first_match_wins() {
        assert_eq!(
            classify(S_SYMBOL_STUBS, "__TEXT", "__stubs", 6),
            SectionVariant::Stubs { stub_size: 6 }
        );
        assert_eq!(classify(S_CSTRING_LITERALS, "__DATA", "__whatever", 0), SectionVariant::CStrings);
        assert_eq!(
            classify(S_LAZY_SYMBOL_POINTERS, "__DATA", "__la_symbol_ptr", 0),
            SectionVariant::IndirectPointers
        );
        assert_eq!(
            classify(S_NON_LAZY_SYMBOL_POINTERS, "__DATA", "__nl_symbol_ptr", 0),
            SectionVariant::IndirectPointers
        );
        // Name-pair rule: a regular section called __TEXT,__cstring.
        assert_eq!(classify(S_REGULAR, "__TEXT", "__cstring", 0), SectionVariant::CStrings);
        // A regular section anywhere else is generic.
        assert_eq!(classify(S_REGULAR, "__DATA", "__cstring", 0), SectionVariant::Generic);
        assert_eq!(classify(S_ZEROFILL, "__DATA", "__bss", 0), SectionVariant::Generic);
        // Attribute bits do not disturb the type match.
        assert_eq!(
            classify(0x8000_0000 | S_SYMBOL_STUBS, "__TEXT", "__stubs", 16),
            SectionVariant::Stubs { stub_size: 16 }
        );
    }

    #[test]
    fn names_are_nul_bounded() {
        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(b"__text");
        assert_eq!(name16(&bytes), "__text");
        let full = *b"0123456789abcdef";
        assert_eq!(name16(&full), "0123456789abcdef");
    }
}
