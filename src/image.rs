//! The top-level aggregate: one parsed Mach-O image.
//!
//! Construction is a single forward parse: magic → data model → header →
//! load commands (truncating, never failing) → address triangulation →
//! segments → symbol tables. Construction fails only when no meaningful
//! view can be produced at all (bad magic, unreadable header); every other
//! defect is recorded as a [`Warning`] on the image or the affected node,
//! and the caller always gets a fully constructed — possibly truncated —
//! image.

use std::sync::Arc;

use scroll::Pread;

use crate::addr::{ContextAddress, FileAddress, Slide, VmAddress};
use crate::constants::{SEG_LINKEDIT, SEG_TEXT};
use crate::data_model::DataModel;
use crate::error::{Error, Result};
use crate::header::{MH_DYLIB_IN_CACHE, MachHeader};
use crate::load_command::{self, CommandVariant, LoadCommand};
use crate::map::MemoryMap;
use crate::node::{Backing, Describe, Field, Range, Warning};
use crate::segment::{Section, Segment};
use crate::symbols::{
    IndirectEntry, IndirectSymbolTable, SIZEOF_INDIRECT_ENTRY, StringTable, SymbolTable,
};

/// The image was processed by the dynamic linker. File-offset fields of its
/// segment commands are no longer meaningful (the loader zeroed them), so
/// reads resolve through VM addresses instead.
pub const IMAGE_WAS_PROCESSED_BY_DYLD: u32 = 0x1;

/// The load-command region is conventionally confined to the first page
/// after the header.
const PAGE_SIZE: u64 = 0x1000;

/// The linear address triangulation of one image: its base in each of the
/// three address spaces, plus origin and slide.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AddressSpace {
    pub context: ContextAddress,
    pub file: FileAddress,
    pub vm: VmAddress,
    pub slide: Slide,
    pub memory_origin: bool,
}

impl AddressSpace {
    /// Context address of a file offset. Only file-origin images keep their
    /// file offsets meaningful.
    pub(crate) fn context_for_file(&self, file: FileAddress) -> Option<ContextAddress> {
        if self.memory_origin {
            return None;
        }
        let delta = file.offset_from(self.file)?;
        self.context.checked_add(delta)
    }

    /// Context address of a VM address. Only memory-origin images are laid
    /// out linearly in the VM space.
    pub(crate) fn context_for_vm(&self, vm: VmAddress) -> Option<ContextAddress> {
        if !self.memory_origin {
            return None;
        }
        self.slide.checked_apply(vm)
    }
}

/// A parsed Mach-O image: the navigable root of the node graph.
#[derive(Debug)]
pub struct Image {
    backing: Backing,
    dm: DataModel,
    name: String,
    flags: u32,
    space: AddressSpace,
    header: MachHeader,
    load_commands: Vec<LoadCommand>,
    segments: Vec<Segment>,
    string_table: Option<StringTable>,
    symbol_table: Option<SymbolTable>,
    indirect_symbol_table: Option<IndirectSymbolTable>,
    warnings: Vec<Warning>,
}

impl Image {
    /// Parse the image that `map` holds at `context_address`.
    ///
    /// `name` is whatever the caller knows the image as (a path, a dyld
    /// image name); `slide` is the offset dyld reported, zero for images
    /// straight from disk; `flags` is a combination of the `IMAGE_*`
    /// constants.
    pub fn new(
        name: impl Into<String>,
        slide: Slide,
        flags: u32,
        context_address: ContextAddress,
        map: Arc<MemoryMap>,
    ) -> Result<Image> {
        let name = name.into();
        log::debug!("parsing image {name:?} at {context_address}");

        // Magic selects the data model; anything unrecognized is fatal.
        let magic = map.view(context_address, 4)?.pread_with::<u32>(0, scroll::LE)?;
        let dm = DataModel::from_magic(magic)?;

        let header_bytes = map.view(context_address, dm.header_size() as u64)?;
        let header = MachHeader::parse(header_bytes, dm)?;

        let mut warnings = Vec::new();
        if header.sizeofcmds as u64 > PAGE_SIZE.saturating_sub(dm.header_size() as u64) {
            warnings.push(Warning::new(
                context_address,
                format!(
                    "load-command region of {:#x} bytes extends past the first page",
                    header.sizeofcmds
                ),
            ));
        }

        let commands_base = context_address
            .checked_add(dm.header_size() as u64)
            .ok_or(Error::OutOfRange { address: context_address.0, size: header.sizeofcmds as u64 })?;
        let (load_commands, mut command_warnings) =
            load_command::parse_all(&map, commands_base, header.ncmds, header.sizeofcmds, dm);
        warnings.append(&mut command_warnings);

        // Segment file offsets stay meaningful until dyld has processed the
        // image, even when the bytes are read out of another task (a file
        // image copied into memory keeps its file layout). Only a
        // dyld-processed task image is laid out by VM address.
        let memory_origin = map.is_task() && flags & IMAGE_WAS_PROCESSED_BY_DYLD != 0;
        let space =
            triangulate(context_address, slide, memory_origin, &load_commands, &mut warnings);

        let mut segments = Vec::new();
        for (index, command) in load_commands.iter().enumerate() {
            if let Some(segment) = Segment::from_command(&map, dm, &space, index, command) {
                segments.push(segment);
            }
        }

        let backing = Backing::new(
            Arc::clone(&map),
            Range::new(
                context_address,
                dm.header_size() as u64 + header.sizeofcmds as u64,
            ),
        )
        .unwrap_or_else(|_| Backing::empty(Arc::clone(&map), context_address));

        let mut string_table = None;
        let mut symbol_table = None;
        let mut indirect_symbol_table = None;
        if let Some(symtab) = load_commands.iter().find_map(|command| match &command.variant {
            CommandVariant::Symtab(symtab) => Some(*symtab),
            _ => None,
        }) {
            string_table = linkedit_window(
                &map,
                &space,
                &segments,
                symtab.stroff,
                symtab.strsize as u64,
                "string table",
                &mut warnings,
            )
            .map(StringTable::new);

            let symbols_size = symtab.nsyms as u64 * dm.nlist_size() as u64;
            symbol_table = linkedit_window(
                &map,
                &space,
                &segments,
                symtab.symoff,
                symbols_size,
                "symbol table",
                &mut warnings,
            )
            .map(|backing| SymbolTable::new(backing, dm, symtab.nsyms, string_table.clone()));
        }
        if let Some(dysymtab) = load_commands.iter().find_map(|command| match &command.variant {
            CommandVariant::Dysymtab(dysymtab) => Some(*dysymtab),
            _ => None,
        }) {
            let size = dysymtab.nindirectsyms as u64 * SIZEOF_INDIRECT_ENTRY as u64;
            indirect_symbol_table = linkedit_window(
                &map,
                &space,
                &segments,
                dysymtab.indirectsymoff,
                size,
                "indirect symbol table",
                &mut warnings,
            )
            .map(|backing| {
                IndirectSymbolTable::new(backing, dm.endianness(), dysymtab.nindirectsyms)
            });
        }

        Ok(Image {
            backing,
            dm,
            name,
            flags,
            space,
            header,
            load_commands,
            segments,
            string_table,
            symbol_table,
            indirect_symbol_table,
            warnings,
        })
    }

    /// Open `path` as a file map and parse the image at its start.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Image> {
        let name = path.as_ref().display().to_string();
        let map = Arc::new(MemoryMap::from(crate::map::FileMap::open(path)?));
        Image::new(name, Slide(0), 0, ContextAddress(0), map)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slide(&self) -> Slide {
        self.space.slide
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn data_model(&self) -> DataModel {
        self.dm
    }

    pub fn context_address(&self) -> ContextAddress {
        self.space.context
    }

    pub fn file_address(&self) -> FileAddress {
        self.space.file
    }

    pub fn vm_address(&self) -> VmAddress {
        self.space.vm
    }

    /// The image's header-plus-commands window in the context space.
    pub fn range(&self) -> Range {
        self.backing.range()
    }

    pub fn header(&self) -> &MachHeader {
        &self.header
    }

    /// Load commands in the order their bytes appear. The count can be less
    /// than the header's `ncmds` when trailing commands were truncated.
    pub fn load_commands(&self) -> &[LoadCommand] {
        &self.load_commands
    }

    /// The load commands whose type code is `cmd`, relative order preserved.
    pub fn load_commands_of_type(&self, cmd: u32) -> impl Iterator<Item = &LoadCommand> + '_ {
        self.load_commands.iter().filter(move |command| command.cmd == cmd)
    }

    /// Segments in load-command order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The first segment with this name.
    pub fn segment_named(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|segment| segment.name == name)
    }

    /// The segment derived from the load command at `command_index`.
    pub fn segment_for_command(&self, command_index: usize) -> Option<&Segment> {
        self.segments.iter().find(|segment| segment.command_index == command_index)
    }

    /// The segment whose context range covers `addr`.
    pub fn segment_containing(&self, addr: ContextAddress) -> Option<&Segment> {
        self.segments.iter().find(|segment| segment.range().contains(addr))
    }

    pub fn section_named(&self, segment: &str, section: &str) -> Option<&Section> {
        self.segment_named(segment)?.section_named(section)
    }

    pub fn string_table(&self) -> Option<&StringTable> {
        self.string_table.as_ref()
    }

    pub fn symbol_table(&self) -> Option<&SymbolTable> {
        self.symbol_table.as_ref()
    }

    pub fn indirect_symbol_table(&self) -> Option<&IndirectSymbolTable> {
        self.indirect_symbol_table.as_ref()
    }

    /// Structural warnings recorded on the image itself. Per-command
    /// warnings live on the commands, per-segment warnings on the segments.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn was_processed_by_dyld(&self) -> bool {
        self.flags & IMAGE_WAS_PROCESSED_BY_DYLD != 0
    }

    /// Whether the image came out of the dyld shared cache.
    pub fn is_from_shared_cache(&self) -> bool {
        self.header.flags & MH_DYLIB_IN_CACHE != 0
    }

    /// Whether the image was read out of (live or dumped) process memory
    /// after dyld had processed it.
    pub fn is_from_memory_dump(&self) -> bool {
        self.space.memory_origin
    }

    /// Resolve entry `entry` of a stub or indirect-pointer section to its
    /// indirect-symbol-table entry.
    pub fn indirect_symbol_for(&self, section: &Section, entry: u64) -> Option<IndirectEntry> {
        let index = section.indirect_table_index(entry)?;
        self.indirect_symbol_table.as_ref()?.get(index)
    }

    /// Where a recorded VM address currently is. Linear (by slide) for
    /// memory-origin images; through the covering segment for file-origin
    /// images.
    pub fn context_address_for_vm(&self, vm: VmAddress) -> Option<ContextAddress> {
        if self.space.memory_origin {
            return self.space.context_for_vm(vm);
        }
        let segment = self.segments.iter().find(|segment| {
            vm >= segment.vmaddr
                && segment.vmaddr.checked_add(segment.vmsize).is_some_and(|end| vm < end)
        })?;
        let delta = vm.offset_from(segment.vmaddr)?;
        if delta >= segment.range().size {
            return None;
        }
        segment.range().addr.checked_add(delta)
    }

    /// Where a file offset currently is; only defined for file-origin
    /// images.
    pub fn context_address_for_file(&self, file: FileAddress) -> Option<ContextAddress> {
        self.space.context_for_file(file)
    }

    /// The recorded VM address of a context address.
    pub fn vm_address_for_context(&self, context: ContextAddress) -> Option<VmAddress> {
        if self.space.memory_origin {
            return self.space.slide.checked_unapply(context);
        }
        let segment = self.segment_containing(context)?;
        let delta = context.offset_from(segment.range().addr)?;
        segment.vmaddr.checked_add(delta)
    }

    /// The file offset of a context address; only defined for file-origin
    /// images.
    pub fn file_address_for_context(&self, context: ContextAddress) -> Option<FileAddress> {
        if self.space.memory_origin {
            return None;
        }
        let delta = context.offset_from(self.space.context)?;
        self.space.file.checked_add(delta)
    }
}

impl Describe for Image {
    fn description(&self) -> Vec<Field> {
        vec![
            Field::string("name", &self.name),
            Field::string("slide", self.space.slide.to_string()),
            Field::hex("context_address", self.space.context.0),
            Field::hex("file_address", self.space.file.0),
            Field::hex("vm_address", self.space.vm.0),
            Field::string("filetype", crate::header::filetype_to_str(self.header.filetype)),
            Field::dec("load_commands", self.load_commands.len() as u64),
            Field::dec("segments", self.segments.len() as u64),
            Field::dec("warnings", self.warnings.len() as u64),
        ]
    }
}

/// Compute the image's file and VM base by inspecting the text segment
/// command: its `vmaddr` is the VM base, and its `fileoff` is zero by
/// convention — a violation is recorded and zero used.
fn triangulate(
    context: ContextAddress,
    slide: Slide,
    memory_origin: bool,
    load_commands: &[LoadCommand],
    warnings: &mut Vec<Warning>,
) -> AddressSpace {
    let text = load_commands.iter().find_map(|command| match &command.variant {
        CommandVariant::Segment32(segment) => (segment.name().ok()? == SEG_TEXT)
            .then_some((command.address, segment.vmaddr as u64, segment.fileoff as u64)),
        CommandVariant::Segment64(segment) => {
            (segment.name().ok()? == SEG_TEXT).then_some((command.address, segment.vmaddr, segment.fileoff))
        }
        _ => None,
    });

    let vm = match text {
        Some((command_address, vmaddr, fileoff)) => {
            if fileoff != 0 {
                warnings.push(Warning::new(
                    command_address,
                    format!("text segment has nonzero file offset {fileoff:#x}, using zero"),
                ));
            }
            VmAddress(vmaddr)
        }
        None => {
            warnings.push(Warning::new(
                context,
                "image has no text segment, VM base derived from the context address",
            ));
            if memory_origin {
                slide.checked_unapply(context).unwrap_or(VmAddress(context.0))
            } else {
                VmAddress(context.0)
            }
        }
    };

    AddressSpace { context, file: FileAddress(0), vm, slide, memory_origin }
}

/// Carve a `(file offset, size)` window for one of the symbolic tables.
/// When the image has a link-edit segment the window must lie inside it and
/// becomes one of its children; without one, the window falls back to the
/// direct file-offset translation. Failure warns and yields `None` — the
/// image is still constructed, lookups through the missing table miss.
fn linkedit_window(
    map: &Arc<MemoryMap>,
    space: &AddressSpace,
    segments: &[Segment],
    offset: u32,
    size: u64,
    what: &'static str,
    warnings: &mut Vec<Warning>,
) -> Option<Backing> {
    let offset = offset as u64;
    if let Some(linkedit) = segments.iter().find(|segment| segment.name == SEG_LINKEDIT) {
        let start = linkedit.fileoff.0;
        let end = start.checked_add(linkedit.filesize);
        let fits = offset >= start
            && end.is_some_and(|end| offset.checked_add(size).is_some_and(|woff| woff <= end));
        if !fits {
            warnings.push(Warning::new(
                linkedit.range().addr,
                format!("{what} window {size:#x} bytes at file offset {offset:#x} is outside {SEG_LINKEDIT}"),
            ));
            return None;
        }
        let delta = offset - start;
        match linkedit
            .range()
            .addr
            .checked_add(delta)
            .ok_or_else(|| Error::OutOfRange { address: offset, size })
            .and_then(|addr| linkedit_child(linkedit, addr, size, map))
        {
            Ok(backing) => Some(backing),
            Err(err) => {
                warnings.push(Warning::new(
                    linkedit.range().addr,
                    format!("{what} window is not mapped: {err}"),
                ));
                None
            }
        }
    } else {
        // No link-edit segment (minimal or object images): fall back to the
        // direct file-offset translation.
        let Some(addr) = space.context_for_file(FileAddress(offset)) else {
            warnings.push(Warning::new(
                space.context,
                format!("{what} has no address: no {SEG_LINKEDIT} segment in a memory-origin image"),
            ));
            return None;
        };
        match Backing::new(Arc::clone(map), Range::new(addr, size)) {
            Ok(backing) => Some(backing),
            Err(err) => {
                warnings.push(Warning::new(
                    addr,
                    format!("{what} window is not mapped: {err}"),
                ));
                None
            }
        }
    }
}

fn linkedit_child(
    linkedit: &Segment,
    addr: ContextAddress,
    size: u64,
    map: &Arc<MemoryMap>,
) -> Result<Backing> {
    // A link-edit segment that failed to map has an empty range; a root
    // backing keeps the table usable when the bytes are there anyway.
    if linkedit.range().is_empty() {
        Backing::new(Arc::clone(map), Range::new(addr, size))
    } else {
        linkedit.backing().child(Range::new(addr, size))
    }
}
