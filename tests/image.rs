//! End-to-end tests over synthetic images built byte-by-byte.

use std::sync::{Arc, Once};

use machview::constants::{
    S_ATTR_PURE_INSTRUCTIONS, S_CSTRING_LITERALS, S_LAZY_SYMBOL_POINTERS, S_REGULAR,
};
use machview::error::Error;
use machview::header::{MH_DYLIB_IN_CACHE, MH_EXECUTE, MH_MAGIC_64};
use machview::load_command::{CommandVariant, LC_DYSYMTAB, LC_RPATH, LC_SEGMENT_64, LC_SYMTAB};
use machview::node::Describe;
use machview::segment::SectionVariant;
use machview::symbols::{INDIRECT_SYMBOL_LOCAL, IndirectEntry};
use machview::{
    ContextAddress, FileAddress, FileMap, IMAGE_WAS_PROCESSED_BY_DYLD, Image, MemoryMap, Slide,
    TaskMap, VmAddress,
};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = stderrlog::new().verbosity(2).init();
    });
}

fn file_image(bytes: Vec<u8>) -> Image {
    init_logging();
    let map = Arc::new(MemoryMap::from(FileMap::from_bytes(bytes)));
    Image::new("a.out", Slide(0), 0, ContextAddress(0), map).expect("image should parse")
}

/// A byte writer with a single endianness switch, for building fixtures in
/// either byte order.
struct Writer {
    buf: Vec<u8>,
    be: bool,
}

impl Writer {
    fn new(be: bool) -> Writer {
        Writer { buf: Vec::new(), be }
    }

    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u16(&mut self, value: u16) {
        let bytes = if self.be { value.to_be_bytes() } else { value.to_le_bytes() };
        self.buf.extend_from_slice(&bytes);
    }

    fn u32(&mut self, value: u32) {
        let bytes = if self.be { value.to_be_bytes() } else { value.to_le_bytes() };
        self.buf.extend_from_slice(&bytes);
    }

    fn u64(&mut self, value: u64) {
        let bytes = if self.be { value.to_be_bytes() } else { value.to_le_bytes() };
        self.buf.extend_from_slice(&bytes);
    }

    fn name16(&mut self, name: &str) {
        let mut bytes = [0u8; 16];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        self.buf.extend_from_slice(&bytes);
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn pad_to(&mut self, offset: usize) {
        assert!(self.buf.len() <= offset, "fixture layout overlap at {offset:#x}");
        self.buf.resize(offset, 0);
    }

    fn header64(&mut self, ncmds: u32, sizeofcmds: u32, flags: u32) {
        self.u32(MH_MAGIC_64);
        self.u32(0x0100_000c); // CPU_TYPE_ARM64
        self.u32(0);
        self.u32(MH_EXECUTE);
        self.u32(ncmds);
        self.u32(sizeofcmds);
        self.u32(flags);
        self.u32(0);
    }

    #[allow(clippy::too_many_arguments)]
    fn segment64(
        &mut self,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        prot: u32,
        sections: &[SectionDesc],
    ) {
        self.u32(LC_SEGMENT_64);
        self.u32(72 + 80 * sections.len() as u32);
        self.name16(name);
        self.u64(vmaddr);
        self.u64(vmsize);
        self.u64(fileoff);
        self.u64(filesize);
        self.u32(prot);
        self.u32(prot);
        self.u32(sections.len() as u32);
        self.u32(0);
        for section in sections {
            self.name16(section.name);
            self.name16(name);
            self.u64(section.addr);
            self.u64(section.size);
            self.u32(section.offset);
            self.u32(4); // align
            self.u32(0); // reloff
            self.u32(0); // nreloc
            self.u32(section.flags);
            self.u32(section.reserved1);
            self.u32(section.reserved2);
            self.u32(0); // reserved3
        }
    }

    fn symtab(&mut self, symoff: u32, nsyms: u32, stroff: u32, strsize: u32) {
        self.u32(LC_SYMTAB);
        self.u32(24);
        self.u32(symoff);
        self.u32(nsyms);
        self.u32(stroff);
        self.u32(strsize);
    }

    fn dysymtab(&mut self, indirectsymoff: u32, nindirectsyms: u32) {
        self.u32(LC_DYSYMTAB);
        self.u32(80);
        for _ in 0..12 {
            self.u32(0);
        }
        self.u32(indirectsymoff);
        self.u32(nindirectsyms);
        for _ in 0..4 {
            self.u32(0);
        }
    }

    fn nlist64(&mut self, strx: u32, value: u64) {
        self.u32(strx);
        self.u8(0x0f); // N_SECT | N_EXT
        self.u8(1);
        self.u16(0);
        self.u64(value);
    }
}

const TEXT_VM: u64 = 0x1_0000_0000;

/// The minimal executable of scenario S1: `__PAGEZERO`, `__TEXT` with one
/// `__text` section, and a symtab naming `_main` and `_start`. No link-edit
/// segment, so the symbol windows resolve by direct file offset.
fn minimal_exec(be: bool, ncmds: u32, sizeofcmds: u32, header_flags: u32) -> Vec<u8> {
    let mut w = Writer::new(be);
    w.header64(ncmds, sizeofcmds, header_flags);
    w.segment64("__PAGEZERO", 0, TEXT_VM, 0, 0, 0, &[]);
    w.segment64(
        "__TEXT",
        TEXT_VM,
        0x1000,
        0,
        0x420,
        5,
        &[SectionDesc {
            name: "__text",
            addr: TEXT_VM + 0x400,
            size: 0x20,
            offset: 0x400,
            flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS,
            reserved1: 0,
            reserved2: 0,
        }],
    );
    w.symtab(0x420, 2, 0x440, 14);
    assert_eq!(w.buf.len(), 32 + 248);

    w.pad_to(0x400);
    w.bytes(&[0xc3; 0x20]);
    w.pad_to(0x420);
    w.nlist64(1, TEXT_VM + 0x400);
    w.nlist64(7, TEXT_VM + 0x410);
    assert_eq!(w.buf.len(), 0x440);
    w.bytes(b"\0_main\0_start\0");
    w.buf
}

struct SectionDesc {
    name: &'static str,
    addr: u64,
    size: u64,
    offset: u32,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
}

#[derive(Default)]
struct RichOpts {
    /// Override the symtab's stroff (scenario S5 points it outside
    /// `__LINKEDIT`).
    stroff: Option<u32>,
    /// Give the `__cstring` section a VM address outside its segment.
    stray_cstring: bool,
    /// Append an LC_RPATH whose path offset is past its cmdsize (S6).
    rpath: bool,
}

/// A fuller executable: `__TEXT` (`__text`, `__cstring`), `__DATA` with a
/// lazy-pointer section, `__LINKEDIT` holding the symtab/strtab/indirect
/// windows, and a dysymtab.
fn rich_exec(opts: RichOpts) -> Vec<u8> {
    let ncmds = if opts.rpath { 7 } else { 6 };
    let sizeofcmds = 632 + if opts.rpath { 16 } else { 0 };
    let cstring_addr = if opts.stray_cstring { 0x2_0000_0000 } else { TEXT_VM + 0x420 };

    let mut w = Writer::new(false);
    w.header64(ncmds, sizeofcmds, 0);
    w.segment64("__PAGEZERO", 0, TEXT_VM, 0, 0, 0, &[]);
    w.segment64(
        "__TEXT",
        TEXT_VM,
        0x1000,
        0,
        0x430,
        5,
        &[
            SectionDesc {
                name: "__text",
                addr: TEXT_VM + 0x400,
                size: 0x20,
                offset: 0x400,
                flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS,
                reserved1: 0,
                reserved2: 0,
            },
            SectionDesc {
                name: "__cstring",
                addr: cstring_addr,
                size: 0x10,
                offset: 0x420,
                flags: S_CSTRING_LITERALS,
                reserved1: 0,
                reserved2: 0,
            },
        ],
    );
    w.segment64(
        "__DATA",
        TEXT_VM + 0x1000,
        0x1000,
        0x430,
        0x10,
        3,
        &[SectionDesc {
            name: "__la_symbol_ptr",
            addr: TEXT_VM + 0x1000,
            size: 0x10,
            offset: 0x430,
            flags: S_LAZY_SYMBOL_POINTERS,
            reserved1: 0,
            reserved2: 0,
        }],
    );
    w.segment64("__LINKEDIT", TEXT_VM + 0x2000, 0x1000, 0x440, 0x38, 1, &[]);
    w.symtab(0x440, 2, opts.stroff.unwrap_or(0x460), 0x10);
    w.dysymtab(0x470, 2);
    if opts.rpath {
        w.u32(LC_RPATH);
        w.u32(16);
        w.u32(0x40); // path offset past cmdsize
        w.u32(0);
    }
    assert_eq!(w.buf.len(), 32 + sizeofcmds as usize);

    w.pad_to(0x400);
    w.bytes(&[0xc3; 0x20]);
    w.bytes(b"hi\0world\0wide\0\0\0");
    w.u64(TEXT_VM + 0x400);
    w.u64(TEXT_VM + 0x410);
    assert_eq!(w.buf.len(), 0x440);
    w.nlist64(1, TEXT_VM + 0x400);
    w.nlist64(7, TEXT_VM + 0x410);
    w.bytes(b"\0_main\0_start\0\0\0");
    w.u32(1);
    w.u32(INDIRECT_SYMBOL_LOCAL);
    assert_eq!(w.buf.len(), 0x478);
    w.buf
}

#[test]
fn s1_minimal_executable() {
    let image = file_image(minimal_exec(false, 3, 248, 0));

    assert_eq!(image.header().ncmds, 3);
    assert_eq!(image.load_commands().len(), 3);
    assert!(image.warnings().is_empty());
    assert!(image.load_commands().iter().all(|command| command.warnings.is_empty()));

    let text = image.segment_named("__TEXT").expect("text segment");
    assert_eq!(text.sections().len(), 1);
    assert_eq!(text.sections()[0].name, "__text");
    assert_eq!(image.load_commands_of_type(LC_SEGMENT_64).count(), 2);

    let symbols = image.symbol_table().expect("symbol table");
    let first = symbols.get(0).expect("first symbol");
    assert_eq!(symbols.name_of(&first).as_deref(), Some("_main"));
    let second = symbols.get(1).expect("second symbol");
    assert_eq!(symbols.name_of(&second).as_deref(), Some("_start"));
}

#[test]
fn load_command_order_is_preserved() {
    let image = file_image(minimal_exec(false, 3, 248, 0));
    let codes: Vec<u32> = image.load_commands().iter().map(|command| command.cmd).collect();
    assert_eq!(codes, vec![LC_SEGMENT_64, LC_SEGMENT_64, LC_SYMTAB]);

    let names: Vec<&str> = image
        .load_commands_of_type(LC_SEGMENT_64)
        .filter_map(|command| match &command.variant {
            CommandVariant::Segment64(segment) => segment.name().ok(),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["__PAGEZERO", "__TEXT"]);
}

#[test]
fn s2_truncated_sizeofcmds_drops_trailing_commands() {
    // Room for the two segment commands only; the symtab no longer fits.
    let image = file_image(minimal_exec(false, 3, 224, 0));
    assert_eq!(image.load_commands().len(), 2);
    assert!(image.symbol_table().is_none());
    assert!(!image.warnings().is_empty());
}

#[test]
fn s3_byte_swapped_image_parses_identically() {
    let image = file_image(minimal_exec(true, 3, 248, 0));
    assert!(image.data_model().is_swapped());
    assert!(image.data_model().is_64());

    assert_eq!(image.header().magic, MH_MAGIC_64);
    assert_eq!(image.header().filetype, MH_EXECUTE);
    let text = image.segment_named("__TEXT").expect("text segment");
    assert_eq!(text.sections()[0].name, "__text");
    assert_eq!(text.vmaddr, VmAddress(TEXT_VM));
    let symbols = image.symbol_table().expect("symbol table");
    let first = symbols.get(0).expect("first symbol");
    assert_eq!(symbols.name_of(&first).as_deref(), Some("_main"));
}

#[test]
fn s4_bad_magic_is_refused() {
    init_logging();
    for bytes in [vec![0u8; 64], b"\x7fELF\x02\x01\x01\x00".repeat(8)] {
        let map = Arc::new(MemoryMap::from(FileMap::from_bytes(bytes)));
        match Image::new("bad", Slide(0), 0, ContextAddress(0), map) {
            Err(Error::BadMagic(_)) => {}
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }
}

#[test]
fn s5_stroff_outside_linkedit_leaves_names_absent() {
    let image = file_image(rich_exec(RichOpts { stroff: Some(0x100), ..RichOpts::default() }));

    assert!(image.string_table().is_none());
    assert!(image.warnings().iter().any(|warning| warning.message.contains("string table")));

    // Symbols still enumerate; their names miss instead of crashing.
    let symbols = image.symbol_table().expect("symbol table");
    assert_eq!(symbols.iter().count(), 2);
    let first = symbols.get(0).expect("first symbol");
    assert_eq!(symbols.name_of(&first), None);
}

#[test]
fn s6_rpath_with_bad_offset_is_present_but_pathless() {
    let image = file_image(rich_exec(RichOpts { rpath: true, ..RichOpts::default() }));

    let rpath: Vec<_> = image.load_commands_of_type(LC_RPATH).collect();
    assert_eq!(rpath.len(), 1);
    match &rpath[0].variant {
        CommandVariant::Rpath { path, .. } => assert!(path.is_none()),
        other => panic!("expected Rpath, got {other:?}"),
    }
    assert!(!rpath[0].warnings.is_empty());
    assert_eq!(rpath[0].string(), None);
}

#[test]
fn truncation_policy_survives_absurd_ncmds() {
    // ncmds claims far more commands than sizeofcmds can hold.
    let image = file_image(minimal_exec(false, 100, 248, 0));
    assert_eq!(image.load_commands().len(), 3);
    assert!(!image.warnings().is_empty());
}

#[test]
fn segments_validate_their_windows() {
    let image = file_image(rich_exec(RichOpts::default()));
    assert!(image.warnings().is_empty());

    let pagezero = image.segment_named("__PAGEZERO").expect("pagezero");
    assert!(pagezero.is_zero_fill());
    assert!(pagezero.range().is_empty());
    assert!(pagezero.read_at(0, 8).is_err());

    let text = image.segment_named("__TEXT").expect("text");
    assert_eq!(text.range().addr, ContextAddress(0));
    assert_eq!(text.range().size, 0x430);
    assert_eq!(&text.read_at(0x400, 2).unwrap(), &[0xc3, 0xc3]);

    let linkedit = image.segment_named("__LINKEDIT").expect("linkedit");
    assert_eq!(linkedit.range().addr, ContextAddress(0x440));
    assert_eq!(linkedit.range().size, 0x38);
}

#[test]
fn section_outside_its_segment_is_warned_not_fatal() {
    let image = file_image(rich_exec(RichOpts { stray_cstring: true, ..RichOpts::default() }));
    let text = image.segment_named("__TEXT").expect("text");
    assert!(
        text.warnings.iter().any(|warning| warning.message.contains("__cstring")),
        "expected a containment warning, got {:?}",
        text.warnings
    );
    // The stray section still exists and still knows its range.
    assert!(text.section_named("__cstring").is_some());
}

#[test]
fn cstring_sections_enumerate_their_strings() {
    let image = file_image(rich_exec(RichOpts::default()));
    let cstrings = image.section_named("__TEXT", "__cstring").expect("cstring section");
    assert_eq!(cstrings.variant, SectionVariant::CStrings);
    assert_eq!(cstrings.cstrings().unwrap(), vec!["hi", "world", "wide"]);

    let text = image.section_named("__TEXT", "__text").expect("text section");
    assert_eq!(text.variant, SectionVariant::Generic);
    assert!(text.cstrings().is_err());
}

#[test]
fn indirect_pointer_entries_resolve_or_are_sentinels() {
    let image = file_image(rich_exec(RichOpts::default()));
    let dm = image.data_model();
    let pointers = image.section_named("__DATA", "__la_symbol_ptr").expect("pointer section");
    assert_eq!(pointers.variant, SectionVariant::IndirectPointers);
    assert_eq!(pointers.entry_count(dm), Some(2));
    assert_eq!(pointers.pointer_value(0, dm).unwrap(), TEXT_VM + 0x400);

    let symbols = image.symbol_table().expect("symbol table");
    for entry in 0..2 {
        let indirect = image.indirect_symbol_for(pointers, entry).expect("indirect entry");
        match indirect {
            IndirectEntry::Symbol(index) => {
                let symbol = symbols.get(index).expect("valid symbol index");
                assert!(symbols.name_of(&symbol).is_some());
            }
            sentinel => assert!(sentinel.is_sentinel()),
        }
    }
    assert_eq!(image.indirect_symbol_for(pointers, 0), Some(IndirectEntry::Symbol(1)));
    assert_eq!(image.indirect_symbol_for(pointers, 1), Some(IndirectEntry::Local));
    let symbol = symbols.get(1).unwrap();
    assert_eq!(symbols.name_of(&symbol).as_deref(), Some("_start"));
}

#[test]
fn file_origin_address_conversions() {
    let image = file_image(rich_exec(RichOpts::default()));
    assert_eq!(image.vm_address(), VmAddress(TEXT_VM));
    assert_eq!(image.file_address(), FileAddress(0));

    assert_eq!(
        image.context_address_for_vm(VmAddress(TEXT_VM + 0x410)),
        Some(ContextAddress(0x410))
    );
    assert_eq!(
        image.context_address_for_file(FileAddress(0x430)),
        Some(ContextAddress(0x430))
    );
    assert_eq!(
        image.vm_address_for_context(ContextAddress(0x432)),
        Some(VmAddress(TEXT_VM + 0x1002))
    );
    assert_eq!(
        image.file_address_for_context(ContextAddress(0x410)),
        Some(FileAddress(0x410))
    );
    // Nothing maps this VM address.
    assert_eq!(image.context_address_for_vm(VmAddress(0x9_0000_0000)), None);
}

#[test]
fn shared_cache_flag_is_derived_from_the_header() {
    let plain = file_image(minimal_exec(false, 3, 248, 0));
    assert!(!plain.is_from_shared_cache());
    let cached = file_image(minimal_exec(false, 3, 248, MH_DYLIB_IN_CACHE));
    assert!(cached.is_from_shared_cache());
    assert!(!cached.is_from_memory_dump());
}

/// A dyld-processed image resident in a task's address space, slid by
/// 0x1000: `__TEXT` is backed by a captured region, `__DATA` is zero-fill.
fn memory_image() -> Image {
    init_logging();
    let mut w = Writer::new(false);
    w.header64(2, 144, 0);
    w.segment64("__TEXT", TEXT_VM, 0x1000, 0, 0x1000, 5, &[]);
    w.segment64("__DATA", TEXT_VM + 0x1000, 0x800, 0, 0, 3, &[]);
    w.pad_to(0x1000);

    let base = TEXT_VM + 0x1000;
    let map = Arc::new(MemoryMap::from(
        TaskMap::from_regions(vec![(base, w.buf)]).unwrap(),
    ));
    Image::new(
        "a.out[memory]",
        Slide(0x1000),
        IMAGE_WAS_PROCESSED_BY_DYLD,
        ContextAddress(base),
        map,
    )
    .expect("memory image should parse")
}

#[test]
fn memory_origin_zero_fill_reads_as_zeroes() {
    let image = memory_image();
    assert!(image.is_from_memory_dump());
    assert!(image.was_processed_by_dyld());
    assert_eq!(image.vm_address(), VmAddress(TEXT_VM));

    let text = image.segment_named("__TEXT").expect("text");
    assert_eq!(text.range().addr, ContextAddress(TEXT_VM + 0x1000));
    // The header bytes are visible through the slid segment.
    assert_eq!(&text.read_at(0, 4).unwrap(), &[0xcf, 0xfa, 0xed, 0xfe]);

    let data = image.segment_named("__DATA").expect("data");
    assert!(data.is_zero_fill());
    assert!(data.range().is_empty());
    assert_eq!(data.read_at(0, 16).unwrap(), vec![0u8; 16]);
    assert_eq!(data.read_at(0x700, 0x100).unwrap(), vec![0u8; 0x100]);
    assert!(data.read_at(0x7fc, 8).is_err());
}

#[test]
fn memory_origin_address_conversions_use_the_slide() {
    let image = memory_image();
    assert_eq!(
        image.context_address_for_vm(VmAddress(TEXT_VM + 0x10)),
        Some(ContextAddress(TEXT_VM + 0x1010))
    );
    assert_eq!(
        image.vm_address_for_context(ContextAddress(TEXT_VM + 0x1010)),
        Some(VmAddress(TEXT_VM + 0x10))
    );
    // File offsets are meaningless for a memory-origin image.
    assert_eq!(image.context_address_for_file(FileAddress(0)), None);
    assert_eq!(image.file_address_for_context(ContextAddress(TEXT_VM + 0x1010)), None);
}

#[test]
fn descriptions_render_name_type_value_triples() {
    let image = file_image(minimal_exec(false, 3, 248, 0));

    let header = image.header().description();
    let magic = header.iter().find(|field| field.name == "magic").expect("magic field");
    assert_eq!(magic.value, "0xfeedfacf");

    let fields = image.description();
    assert!(fields.iter().any(|field| field.name == "name" && field.value == "a.out"));
    assert!(fields.iter().any(|field| field.name == "segments" && field.value == "2"));

    let text = image.segment_named("__TEXT").unwrap();
    assert!(text.description().iter().any(|field| field.name == "vmaddr"));
    assert!(
        text.sections()[0].description().iter().any(|field| field.name == "sectname")
    );
}
