//! Load commands: the variably-sized records after the header that describe
//! everything from segment mappings to dependent libraries.
//!
//! The registry is [`CommandVariant`]: the `cmd` code is the discriminant,
//! the data is the decoded record. Unknown codes fall back to
//! [`CommandVariant::Unknown`], which preserves the size and raw payload.
//! Parsing is permissive: a command that declares an impossible size stops
//! the walk (truncation, not failure), and a command too small for its own
//! structure is decoded with the missing tail read as zero plus a
//! [`Warning`] on the command node.

use core::fmt::{self, Display};

use scroll::ctx::StrCtx;
use scroll::{Endian, Pread, Pwrite, SizeWith, ctx};

use crate::addr::{ContextAddress, FileAddress};
use crate::data_model::DataModel;
use crate::error::Result;
use crate::map::MemoryMap;
use crate::node::{Describe, Field, Warning};

pub const LC_REQ_DYLD: u32 = 0x8000_0000;
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_DYLINKER: u32 = 0xe;
pub const LC_ID_DYLINKER: u32 = 0xf;
pub const LC_ROUTINES: u32 = 0x11;
pub const LC_SUB_FRAMEWORK: u32 = 0x12;
pub const LC_SUB_CLIENT: u32 = 0x14;
pub const LC_SUB_LIBRARY: u32 = 0x15;
pub const LC_TWOLEVEL_HINTS: u32 = 0x16;
pub const LC_PREBIND_CKSUM: u32 = 0x17;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_ROUTINES_64: u32 = 0x1a;
pub const LC_UUID: u32 = 0x1b;
pub const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1e;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_DYLD_ENVIRONMENT: u32 = 0x27;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_SOURCE_VERSION: u32 = 0x2a;
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2b;
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;

pub fn cmd_to_str(cmd: u32) -> &'static str {
    match cmd {
        LC_SEGMENT => "LC_SEGMENT",
        LC_SYMTAB => "LC_SYMTAB",
        LC_DYSYMTAB => "LC_DYSYMTAB",
        LC_LOAD_DYLIB => "LC_LOAD_DYLIB",
        LC_ID_DYLIB => "LC_ID_DYLIB",
        LC_LOAD_DYLINKER => "LC_LOAD_DYLINKER",
        LC_ID_DYLINKER => "LC_ID_DYLINKER",
        LC_ROUTINES => "LC_ROUTINES",
        LC_SUB_FRAMEWORK => "LC_SUB_FRAMEWORK",
        LC_SUB_CLIENT => "LC_SUB_CLIENT",
        LC_SUB_LIBRARY => "LC_SUB_LIBRARY",
        LC_TWOLEVEL_HINTS => "LC_TWOLEVEL_HINTS",
        LC_PREBIND_CKSUM => "LC_PREBIND_CKSUM",
        LC_LOAD_WEAK_DYLIB => "LC_LOAD_WEAK_DYLIB",
        LC_SEGMENT_64 => "LC_SEGMENT_64",
        LC_ROUTINES_64 => "LC_ROUTINES_64",
        LC_UUID => "LC_UUID",
        LC_RPATH => "LC_RPATH",
        LC_CODE_SIGNATURE => "LC_CODE_SIGNATURE",
        LC_SEGMENT_SPLIT_INFO => "LC_SEGMENT_SPLIT_INFO",
        LC_REEXPORT_DYLIB => "LC_REEXPORT_DYLIB",
        LC_ENCRYPTION_INFO => "LC_ENCRYPTION_INFO",
        LC_DYLD_INFO => "LC_DYLD_INFO",
        LC_DYLD_INFO_ONLY => "LC_DYLD_INFO_ONLY",
        LC_LOAD_UPWARD_DYLIB => "LC_LOAD_UPWARD_DYLIB",
        LC_VERSION_MIN_MACOSX => "LC_VERSION_MIN_MACOSX",
        LC_VERSION_MIN_IPHONEOS => "LC_VERSION_MIN_IPHONEOS",
        LC_FUNCTION_STARTS => "LC_FUNCTION_STARTS",
        LC_DYLD_ENVIRONMENT => "LC_DYLD_ENVIRONMENT",
        LC_MAIN => "LC_MAIN",
        LC_DATA_IN_CODE => "LC_DATA_IN_CODE",
        LC_SOURCE_VERSION => "LC_SOURCE_VERSION",
        LC_DYLIB_CODE_SIGN_DRS => "LC_DYLIB_CODE_SIGN_DRS",
        LC_ENCRYPTION_INFO_64 => "LC_ENCRYPTION_INFO_64",
        _ => "LC_UNKNOWN",
    }
}

/// Occurs at the beginning of every load command: the tagged-union
/// discriminant plus the total command size.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct LoadCommandHeader {
    pub cmd: u32,
    pub cmdsize: u32,
}

impl Display for LoadCommandHeader {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} size: {}", cmd_to_str(self.cmd), self.cmdsize)
    }
}

pub const SIZEOF_LOAD_COMMAND: usize = 8;

/// An offset into a command's payload where a NUL-terminated string lives.
pub type LcStr = u32;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SegmentCommand32 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u32,
    pub vmsize: u32,
    pub fileoff: u32,
    pub filesize: u32,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

pub const SIZEOF_SEGMENT_COMMAND_32: usize = 56;

impl SegmentCommand32 {
    pub fn name(&self) -> Result<&str> {
        Ok(self.segname.pread_with::<&str>(0, StrCtx::DelimiterUntil(0, 16))?)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

pub const SIZEOF_SEGMENT_COMMAND_64: usize = 72;

impl SegmentCommand64 {
    pub fn name(&self) -> Result<&str> {
        Ok(self.segname.pread_with::<&str>(0, StrCtx::DelimiterUntil(0, 16))?)
    }
}

/// A 32-bit section descriptor, trailing its segment command.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Section32 {
    /// name of this section
    pub sectname: [u8; 16],
    /// segment this section goes in
    pub segname: [u8; 16],
    /// memory address of this section
    pub addr: u32,
    /// size in bytes of this section
    pub size: u32,
    /// file offset of this section
    pub offset: u32,
    /// section alignment (power of 2)
    pub align: u32,
    /// file offset of relocation entries
    pub reloff: u32,
    /// number of relocation entries
    pub nreloc: u32,
    /// flags (section type and attributes)
    pub flags: u32,
    /// reserved (for offset or index)
    pub reserved1: u32,
    /// reserved (for count or sizeof)
    pub reserved2: u32,
}

pub const SIZEOF_SECTION_32: usize = 68;

/// A 64-bit section descriptor, trailing its segment command.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    /// reserved
    pub reserved3: u32,
}

pub const SIZEOF_SECTION_64: usize = 80;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// file offset of the symbol table
    pub symoff: u32,
    /// number of symbol table entries
    pub nsyms: u32,
    /// file offset of the string table
    pub stroff: u32,
    /// string table size in bytes
    pub strsize: u32,
}

pub const SIZEOF_SYMTAB_COMMAND: usize = 24;

/// The second set of symbolic information, for the dynamic linker; the
/// fields this parser consumes are the indirect symbol table window.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DysymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// index to local symbols
    pub ilocalsym: u32,
    /// number of local symbols
    pub nlocalsym: u32,
    /// index to externally defined symbols
    pub iextdefsym: u32,
    /// number of externally defined symbols
    pub nextdefsym: u32,
    /// index to undefined symbols
    pub iundefsym: u32,
    /// number of undefined symbols
    pub nundefsym: u32,
    /// file offset to table of contents
    pub tocoff: u32,
    /// number of entries in table of contents
    pub ntoc: u32,
    /// file offset to module table
    pub modtaboff: u32,
    /// number of module table entries
    pub nmodtab: u32,
    /// offset to referenced symbol table
    pub extrefsymoff: u32,
    /// number of referenced symbol table entries
    pub nextrefsyms: u32,
    /// file offset to the indirect symbol table
    pub indirectsymoff: u32,
    /// number of indirect symbol table entries
    pub nindirectsyms: u32,
    /// offset to external relocation entries
    pub extreloff: u32,
    /// number of external relocation entries
    pub nextrel: u32,
    /// offset to local relocation entries
    pub locreloff: u32,
    /// number of local relocation entries
    pub nlocrel: u32,
}

pub const SIZEOF_DYSYMTAB_COMMAND: usize = 80;

/// A dependent library: where its install name lives in the payload, plus
/// build time stamp and versions.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Dylib {
    /// payload offset of the library's install name
    pub name: LcStr,
    /// library's build time stamp
    pub timestamp: u32,
    /// library's current version number
    pub current_version: u32,
    /// library's compatibility version number
    pub compatibility_version: u32,
}

pub const SIZEOF_DYLIB: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DylibCommand {
    /// LC_ID_DYLIB, LC_LOAD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_REEXPORT_DYLIB or
    /// LC_LOAD_UPWARD_DYLIB
    pub cmd: u32,
    /// includes pathname string
    pub cmdsize: u32,
    pub dylib: Dylib,
}

pub const SIZEOF_DYLIB_COMMAND: usize = 24;

/// The name of the dynamic linker (or, for LC_DYLD_ENVIRONMENT, an
/// environment string handed to it).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DylinkerCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub name: LcStr,
}

pub const SIZEOF_DYLINKER_COMMAND: usize = 12;

/// The address of the shared library initialization routine.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct RoutinesCommand32 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub init_address: u32,
    pub init_module: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
    pub reserved4: u32,
    pub reserved5: u32,
    pub reserved6: u32,
}

pub const SIZEOF_ROUTINES_COMMAND_32: usize = 40;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct RoutinesCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub init_address: u64,
    pub init_module: u64,
    pub reserved1: u64,
    pub reserved2: u64,
    pub reserved3: u64,
    pub reserved4: u64,
    pub reserved5: u64,
    pub reserved6: u64,
}

pub const SIZEOF_ROUTINES_COMMAND_64: usize = 72;

/// The umbrella framework this library is a subframework of.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SubFrameworkCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// payload offset of the umbrella framework name
    pub umbrella: LcStr,
}

pub const SIZEOF_SUB_FRAMEWORK_COMMAND: usize = 12;

/// A client allowed to link this subframework.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SubClientCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// payload offset of the client name
    pub client: LcStr,
}

pub const SIZEOF_SUB_CLIENT_COMMAND: usize = 12;

/// A sub-library of this shared library.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SubLibraryCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// payload offset of the sub-library name
    pub sub_library: LcStr,
}

pub const SIZEOF_SUB_LIBRARY_COMMAND: usize = 12;

/// Offset and count of the two-level namespace lookup hints table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct TwolevelHintsCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// file offset of the hint table
    pub offset: u32,
    /// number of hints
    pub nhints: u32,
}

pub const SIZEOF_TWOLEVEL_HINTS_COMMAND: usize = 16;

/// The original checksum for prebound files, or zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct PrebindCksumCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// the checksum or zero
    pub cksum: u32,
}

pub const SIZEOF_PREBIND_CKSUM_COMMAND: usize = 12;

/// The 128-bit uuid stamped on the image by the static linker.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct UuidCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub uuid: [u8; 16],
}

pub const SIZEOF_UUID_COMMAND: usize = 24;

/// A path to add to the run path used for @rpath-prefixed dylibs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct RpathCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// payload offset of the path
    pub path: LcStr,
}

pub const SIZEOF_RPATH_COMMAND: usize = 12;

/// A blob of data in the link-edit segment: code signature, split info,
/// function starts, data-in-code, or code-signing DRs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct LinkeditDataCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// file offset of the data in the link-edit segment
    pub dataoff: u32,
    /// file size of the data
    pub datasize: u32,
}

pub const SIZEOF_LINKEDIT_DATA_COMMAND: usize = 16;

impl LinkeditDataCommand {
    /// The blob as a file-offset range.
    pub fn file_range(&self) -> (FileAddress, u64) {
        (FileAddress(self.dataoff as u64), self.datasize as u64)
    }
}

/// File offset and size of an encrypted range.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct EncryptionInfoCommand32 {
    pub cmd: u32,
    pub cmdsize: u32,
    /// file offset of the encrypted range
    pub cryptoff: u32,
    /// file size of the encrypted range
    pub cryptsize: u32,
    /// which encryption system, 0 means not yet encrypted
    pub cryptid: u32,
}

pub const SIZEOF_ENCRYPTION_INFO_COMMAND_32: usize = 20;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct EncryptionInfoCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub cryptoff: u32,
    pub cryptsize: u32,
    pub cryptid: u32,
    /// padding to an 8-byte multiple
    pub pad: u32,
}

pub const SIZEOF_ENCRYPTION_INFO_COMMAND_64: usize = 24;

/// File ranges of the raw rebase, bind and export opcode streams. The
/// streams are exposed, never interpreted.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DyldInfoCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

pub const SIZEOF_DYLD_INFO_COMMAND: usize = 48;

impl DyldInfoCommand {
    pub fn rebase_range(&self) -> (FileAddress, u64) {
        (FileAddress(self.rebase_off as u64), self.rebase_size as u64)
    }

    pub fn bind_range(&self) -> (FileAddress, u64) {
        (FileAddress(self.bind_off as u64), self.bind_size as u64)
    }

    pub fn weak_bind_range(&self) -> (FileAddress, u64) {
        (FileAddress(self.weak_bind_off as u64), self.weak_bind_size as u64)
    }

    pub fn lazy_bind_range(&self) -> (FileAddress, u64) {
        (FileAddress(self.lazy_bind_off as u64), self.lazy_bind_size as u64)
    }

    pub fn export_range(&self) -> (FileAddress, u64) {
        (FileAddress(self.export_off as u64), self.export_size as u64)
    }
}

/// Minimum OS version the image was built for; X.Y.Z packed in nibbles
/// xxxx.yy.zz.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct VersionMinCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub version: u32,
    pub sdk: u32,
}

pub const SIZEOF_VERSION_MIN_COMMAND: usize = 16;

impl VersionMinCommand {
    pub fn version_string(&self) -> String {
        version_to_str(self.version)
    }

    pub fn sdk_string(&self) -> String {
        version_to_str(self.sdk)
    }
}

/// Decode the X.Y.Z version packed in nibbles xxxx.yy.zz (version-min
/// commands, dylib current/compatibility versions).
pub fn version_to_str(version: u32) -> String {
    format!("{}.{}.{}", version >> 16, (version >> 8) & 0xff, version & 0xff)
}

/// Replacement for the thread command: the file offset of main().
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct EntryPointCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// file offset of main() in __TEXT
    pub entryoff: u64,
    /// initial stack size, if not zero
    pub stacksize: u64,
}

pub const SIZEOF_ENTRY_POINT_COMMAND: usize = 24;

/// Version of the sources used to build the image; A.B.C.D.E packed as
/// a24.b10.c10.d10.e10.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SourceVersionCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub version: u64,
}

pub const SIZEOF_SOURCE_VERSION_COMMAND: usize = 16;

/// The registry: every supported command kind as a typed variant. The
/// string-bearing families resolve their payload string at parse time; an
/// out-of-command offset leaves the string `None` with a warning on the
/// command node.
#[derive(Debug, Clone)]
pub enum CommandVariant {
    Segment32(SegmentCommand32),
    Segment64(SegmentCommand64),
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    LoadDylib { command: DylibCommand, name: Option<String> },
    IdDylib { command: DylibCommand, name: Option<String> },
    LoadWeakDylib { command: DylibCommand, name: Option<String> },
    ReexportDylib { command: DylibCommand, name: Option<String> },
    LoadUpwardDylib { command: DylibCommand, name: Option<String> },
    LoadDylinker { command: DylinkerCommand, name: Option<String> },
    IdDylinker { command: DylinkerCommand, name: Option<String> },
    DyldEnvironment { command: DylinkerCommand, name: Option<String> },
    Routines32(RoutinesCommand32),
    Routines64(RoutinesCommand64),
    SubFramework { command: SubFrameworkCommand, umbrella: Option<String> },
    SubClient { command: SubClientCommand, client: Option<String> },
    SubLibrary { command: SubLibraryCommand, sub_library: Option<String> },
    TwolevelHints(TwolevelHintsCommand),
    PrebindCksum(PrebindCksumCommand),
    Uuid(UuidCommand),
    Rpath { command: RpathCommand, path: Option<String> },
    CodeSignature(LinkeditDataCommand),
    SegmentSplitInfo(LinkeditDataCommand),
    FunctionStarts(LinkeditDataCommand),
    DataInCode(LinkeditDataCommand),
    DylibCodeSignDrs(LinkeditDataCommand),
    EncryptionInfo32(EncryptionInfoCommand32),
    EncryptionInfo64(EncryptionInfoCommand64),
    DyldInfo(DyldInfoCommand),
    DyldInfoOnly(DyldInfoCommand),
    VersionMinMacosx(VersionMinCommand),
    VersionMinIphoneos(VersionMinCommand),
    Main(EntryPointCommand),
    SourceVersion(SourceVersionCommand),
    /// A command kind this parser has no decoder for; size and payload
    /// are preserved.
    Unknown { header: LoadCommandHeader, payload: Vec<u8> },
}

impl CommandVariant {
    pub(crate) fn parse(
        bytes: &[u8],
        header: LoadCommandHeader,
        le: Endian,
        address: ContextAddress,
        warnings: &mut Vec<Warning>,
    ) -> CommandVariant {
        use self::CommandVariant::*;
        macro_rules! fixed {
            ($ty:ty, $size:expr, $ctor:expr) => {
                match decode_clamped::<$ty>(bytes, $size, le, address, warnings) {
                    Some(command) => $ctor(command),
                    None => Unknown { header, payload: payload(bytes) },
                }
            };
        }
        macro_rules! named {
            ($ty:ty, $size:expr, $offset:expr, $what:expr, $ctor:expr) => {
                match decode_clamped::<$ty>(bytes, $size, le, address, warnings) {
                    Some(command) => {
                        let string = lc_string(bytes, $offset(&command), address, warnings, $what);
                        $ctor(command, string)
                    }
                    None => Unknown { header, payload: payload(bytes) },
                }
            };
        }
        macro_rules! dylib {
            ($variant:ident) => {
                named!(
                    DylibCommand,
                    SIZEOF_DYLIB_COMMAND,
                    |c: &DylibCommand| c.dylib.name,
                    "install name",
                    |command, name| $variant { command, name }
                )
            };
        }
        macro_rules! dylinker {
            ($variant:ident) => {
                named!(
                    DylinkerCommand,
                    SIZEOF_DYLINKER_COMMAND,
                    |c: &DylinkerCommand| c.name,
                    "dylinker name",
                    |command, name| $variant { command, name }
                )
            };
        }
        match header.cmd {
            LC_SEGMENT => fixed!(SegmentCommand32, SIZEOF_SEGMENT_COMMAND_32, Segment32),
            LC_SEGMENT_64 => fixed!(SegmentCommand64, SIZEOF_SEGMENT_COMMAND_64, Segment64),
            LC_SYMTAB => fixed!(SymtabCommand, SIZEOF_SYMTAB_COMMAND, Symtab),
            LC_DYSYMTAB => fixed!(DysymtabCommand, SIZEOF_DYSYMTAB_COMMAND, Dysymtab),
            LC_LOAD_DYLIB => dylib!(LoadDylib),
            LC_ID_DYLIB => dylib!(IdDylib),
            LC_LOAD_WEAK_DYLIB => dylib!(LoadWeakDylib),
            LC_REEXPORT_DYLIB => dylib!(ReexportDylib),
            LC_LOAD_UPWARD_DYLIB => dylib!(LoadUpwardDylib),
            LC_LOAD_DYLINKER => dylinker!(LoadDylinker),
            LC_ID_DYLINKER => dylinker!(IdDylinker),
            LC_DYLD_ENVIRONMENT => dylinker!(DyldEnvironment),
            LC_ROUTINES => fixed!(RoutinesCommand32, SIZEOF_ROUTINES_COMMAND_32, Routines32),
            LC_ROUTINES_64 => fixed!(RoutinesCommand64, SIZEOF_ROUTINES_COMMAND_64, Routines64),
            LC_SUB_FRAMEWORK => named!(
                SubFrameworkCommand,
                SIZEOF_SUB_FRAMEWORK_COMMAND,
                |c: &SubFrameworkCommand| c.umbrella,
                "umbrella name",
                |command, umbrella| SubFramework { command, umbrella }
            ),
            LC_SUB_CLIENT => named!(
                SubClientCommand,
                SIZEOF_SUB_CLIENT_COMMAND,
                |c: &SubClientCommand| c.client,
                "client name",
                |command, client| SubClient { command, client }
            ),
            LC_SUB_LIBRARY => named!(
                SubLibraryCommand,
                SIZEOF_SUB_LIBRARY_COMMAND,
                |c: &SubLibraryCommand| c.sub_library,
                "sub-library name",
                |command, sub_library| SubLibrary { command, sub_library }
            ),
            LC_TWOLEVEL_HINTS => {
                fixed!(TwolevelHintsCommand, SIZEOF_TWOLEVEL_HINTS_COMMAND, TwolevelHints)
            }
            LC_PREBIND_CKSUM => {
                fixed!(PrebindCksumCommand, SIZEOF_PREBIND_CKSUM_COMMAND, PrebindCksum)
            }
            LC_UUID => fixed!(UuidCommand, SIZEOF_UUID_COMMAND, Uuid),
            LC_RPATH => named!(
                RpathCommand,
                SIZEOF_RPATH_COMMAND,
                |c: &RpathCommand| c.path,
                "rpath",
                |command, path| Rpath { command, path }
            ),
            LC_CODE_SIGNATURE => {
                fixed!(LinkeditDataCommand, SIZEOF_LINKEDIT_DATA_COMMAND, CodeSignature)
            }
            LC_SEGMENT_SPLIT_INFO => {
                fixed!(LinkeditDataCommand, SIZEOF_LINKEDIT_DATA_COMMAND, SegmentSplitInfo)
            }
            LC_FUNCTION_STARTS => {
                fixed!(LinkeditDataCommand, SIZEOF_LINKEDIT_DATA_COMMAND, FunctionStarts)
            }
            LC_DATA_IN_CODE => {
                fixed!(LinkeditDataCommand, SIZEOF_LINKEDIT_DATA_COMMAND, DataInCode)
            }
            LC_DYLIB_CODE_SIGN_DRS => {
                fixed!(LinkeditDataCommand, SIZEOF_LINKEDIT_DATA_COMMAND, DylibCodeSignDrs)
            }
            LC_ENCRYPTION_INFO => fixed!(
                EncryptionInfoCommand32,
                SIZEOF_ENCRYPTION_INFO_COMMAND_32,
                EncryptionInfo32
            ),
            LC_ENCRYPTION_INFO_64 => fixed!(
                EncryptionInfoCommand64,
                SIZEOF_ENCRYPTION_INFO_COMMAND_64,
                EncryptionInfo64
            ),
            LC_DYLD_INFO => fixed!(DyldInfoCommand, SIZEOF_DYLD_INFO_COMMAND, DyldInfo),
            LC_DYLD_INFO_ONLY => fixed!(DyldInfoCommand, SIZEOF_DYLD_INFO_COMMAND, DyldInfoOnly),
            LC_VERSION_MIN_MACOSX => {
                fixed!(VersionMinCommand, SIZEOF_VERSION_MIN_COMMAND, VersionMinMacosx)
            }
            LC_VERSION_MIN_IPHONEOS => {
                fixed!(VersionMinCommand, SIZEOF_VERSION_MIN_COMMAND, VersionMinIphoneos)
            }
            LC_MAIN => fixed!(EntryPointCommand, SIZEOF_ENTRY_POINT_COMMAND, Main),
            LC_SOURCE_VERSION => {
                fixed!(SourceVersionCommand, SIZEOF_SOURCE_VERSION_COMMAND, SourceVersion)
            }
            _ => Unknown { header, payload: payload(bytes) },
        }
    }
}

/// One parsed load command node: its window in the context space, the
/// prefix, the typed variant and any structural warnings observed while
/// decoding it.
#[derive(Debug, Clone)]
pub struct LoadCommand {
    /// Context address of the command's first byte.
    pub address: ContextAddress,
    pub cmd: u32,
    pub cmdsize: u32,
    pub variant: CommandVariant,
    pub warnings: Vec<Warning>,
}

impl LoadCommand {
    /// The resolved payload string for string-bearing variants: install
    /// name, dylinker name, rpath, umbrella, client or sub-library name.
    pub fn string(&self) -> Option<&str> {
        use self::CommandVariant::*;
        match &self.variant {
            LoadDylib { name, .. }
            | IdDylib { name, .. }
            | LoadWeakDylib { name, .. }
            | ReexportDylib { name, .. }
            | LoadUpwardDylib { name, .. }
            | LoadDylinker { name, .. }
            | IdDylinker { name, .. }
            | DyldEnvironment { name, .. } => name.as_deref(),
            SubFramework { umbrella, .. } => umbrella.as_deref(),
            SubClient { client, .. } => client.as_deref(),
            SubLibrary { sub_library, .. } => sub_library.as_deref(),
            Rpath { path, .. } => path.as_deref(),
            _ => None,
        }
    }
}

impl Describe for LoadCommand {
    fn description(&self) -> Vec<Field> {
        use self::CommandVariant::*;
        let mut fields = vec![
            Field::string("cmd", cmd_to_str(self.cmd)),
            Field::dec("cmdsize", self.cmdsize as u64),
        ];
        match &self.variant {
            Segment32(command) => {
                fields.push(Field::string("segname", command.name().unwrap_or("")));
                fields.push(Field::hex("vmaddr", command.vmaddr as u64));
                fields.push(Field::hex("vmsize", command.vmsize as u64));
            }
            Segment64(command) => {
                fields.push(Field::string("segname", command.name().unwrap_or("")));
                fields.push(Field::hex("vmaddr", command.vmaddr));
                fields.push(Field::hex("vmsize", command.vmsize));
            }
            Symtab(command) => {
                fields.push(Field::hex("symoff", command.symoff as u64));
                fields.push(Field::dec("nsyms", command.nsyms as u64));
                fields.push(Field::hex("stroff", command.stroff as u64));
                fields.push(Field::dec("strsize", command.strsize as u64));
            }
            Dysymtab(command) => {
                fields.push(Field::hex("indirectsymoff", command.indirectsymoff as u64));
                fields.push(Field::dec("nindirectsyms", command.nindirectsyms as u64));
            }
            Uuid(command) => {
                let mut uuid = String::with_capacity(32);
                for byte in command.uuid {
                    uuid.push_str(&format!("{byte:02x}"));
                }
                fields.push(Field::string("uuid", uuid));
            }
            CodeSignature(command) | SegmentSplitInfo(command) | FunctionStarts(command)
            | DataInCode(command) | DylibCodeSignDrs(command) => {
                fields.push(Field::hex("dataoff", command.dataoff as u64));
                fields.push(Field::dec("datasize", command.datasize as u64));
            }
            Main(command) => {
                fields.push(Field::hex("entryoff", command.entryoff));
                fields.push(Field::hex("stacksize", command.stacksize));
            }
            _ => {}
        }
        if let Some(string) = self.string() {
            fields.push(Field::string("string", string));
        }
        fields
    }
}

/// Walk the load-command region, decoding until `ncmds` commands have been
/// parsed or the region runs dry. A command that declares `cmdsize < 8`, or
/// a size past the region or past the mapped bytes, truncates the walk with
/// a warning rather than failing it.
pub(crate) fn parse_all(
    map: &MemoryMap,
    base: ContextAddress,
    ncmds: u32,
    sizeofcmds: u32,
    dm: DataModel,
) -> (Vec<LoadCommand>, Vec<Warning>) {
    let le = dm.endianness();
    let region = sizeofcmds as u64;
    let mut commands = Vec::with_capacity(ncmds.min(64) as usize);
    let mut warnings = Vec::new();
    let mut cursor = 0u64;
    for index in 0..ncmds {
        let truncated = |at: u64, why: &str| {
            Warning::new(
                ContextAddress(base.0.wrapping_add(at)),
                format!("load commands truncated at {index} of {ncmds}: {why}"),
            )
        };
        if cursor + SIZEOF_LOAD_COMMAND as u64 > region {
            warnings.push(truncated(cursor, "no room for a command prefix"));
            break;
        }
        let Some(address) = base.checked_add(cursor) else {
            warnings.push(truncated(cursor, "command address overflows"));
            break;
        };
        let header = match map.view(address, SIZEOF_LOAD_COMMAND as u64) {
            Ok(prefix) => match prefix.pread_with::<LoadCommandHeader>(0, le) {
                Ok(header) => header,
                Err(_) => break,
            },
            Err(err) => {
                warnings.push(truncated(cursor, &format!("prefix unreadable: {err}")));
                break;
            }
        };
        if (header.cmdsize as usize) < SIZEOF_LOAD_COMMAND {
            warnings.push(truncated(cursor, &format!("cmdsize {} below minimum", header.cmdsize)));
            break;
        }
        if cursor + header.cmdsize as u64 > region {
            warnings
                .push(truncated(cursor, &format!("cmdsize {} overflows the region", header.cmdsize)));
            break;
        }
        let bytes = match map.view(address, header.cmdsize as u64) {
            Ok(bytes) => bytes,
            Err(err) => {
                warnings.push(truncated(cursor, &format!("payload unreadable: {err}")));
                break;
            }
        };
        log::debug!("load command {index} at {address}: {header}");
        let mut command_warnings = Vec::new();
        let variant = CommandVariant::parse(bytes, header, le, address, &mut command_warnings);
        commands.push(LoadCommand {
            address,
            cmd: header.cmd,
            cmdsize: header.cmdsize,
            variant,
            warnings: command_warnings,
        });
        cursor += header.cmdsize as u64;
    }
    (commands, warnings)
}

fn payload(bytes: &[u8]) -> Vec<u8> {
    bytes.get(SIZEOF_LOAD_COMMAND..).unwrap_or(&[]).to_vec()
}

/// Decode a fixed command structure of `size` bytes. If the command is too
/// small for its own structure, decode from a zero-extended copy and warn:
/// the fields clamp to zero rather than failing the command.
fn decode_clamped<T>(
    bytes: &[u8],
    size: usize,
    le: Endian,
    address: ContextAddress,
    warnings: &mut Vec<Warning>,
) -> Option<T>
where
    T: for<'a> ctx::TryFromCtx<'a, Endian, Error = scroll::Error>,
{
    if bytes.len() >= size {
        bytes.pread_with::<T>(0, le).ok()
    } else {
        warnings.push(Warning::new(
            address,
            format!(
                "cmdsize {:#x} is smaller than the command structure ({size:#x} bytes), missing fields read as zero",
                bytes.len()
            ),
        ));
        let mut padded = vec![0u8; size];
        padded[..bytes.len()].copy_from_slice(bytes);
        padded.pread_with::<T>(0, le).ok()
    }
}

/// Resolve a NUL-terminated string at `offset` within the command's bytes.
fn lc_string(
    bytes: &[u8],
    offset: LcStr,
    address: ContextAddress,
    warnings: &mut Vec<Warning>,
    what: &'static str,
) -> Option<String> {
    let offset = offset as usize;
    if offset < SIZEOF_LOAD_COMMAND || offset >= bytes.len() {
        warnings.push(Warning::new(
            address,
            format!("{what} offset {offset:#x} is outside the command"),
        ));
        return None;
    }
    match bytes.pread_with::<&str>(offset, StrCtx::DelimiterUntil(0, bytes.len() - offset)) {
        Ok(string) => Some(string.to_string()),
        Err(_) => {
            warnings.push(Warning::new(address, format!("{what} is not valid UTF-8")));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::FileMap;

    fn le_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    #[test]
    fn dylib_command_resolves_its_install_name() {
        let mut bytes = le_bytes(&[LC_LOAD_DYLIB, 0x30, 0x18, 2, 0x10000, 0x10000]);
        bytes.extend_from_slice(b"/usr/lib/libfoo.dylib\0\0\0");
        let header = LoadCommandHeader { cmd: LC_LOAD_DYLIB, cmdsize: 0x30 };
        let mut warnings = Vec::new();
        let variant = CommandVariant::parse(
            &bytes,
            header,
            scroll::LE,
            ContextAddress(0),
            &mut warnings,
        );
        match variant {
            CommandVariant::LoadDylib { command, name } => {
                assert_eq!(name.as_deref(), Some("/usr/lib/libfoo.dylib"));
                assert_eq!(command.dylib.timestamp, 2);
                assert_eq!(command.dylib.current_version, 0x10000);
            }
            other => panic!("expected LoadDylib, got {other:?}"),
        }
        assert!(warnings.is_empty());
    }

    #[test]
    fn rpath_with_bad_offset_is_absent_and_warned() {
        let bytes = le_bytes(&[LC_RPATH, 0x10, 0x40]);
        let header = LoadCommandHeader { cmd: LC_RPATH, cmdsize: 0x10 };
        let mut warnings = Vec::new();
        let variant =
            CommandVariant::parse(&bytes, header, scroll::LE, ContextAddress(0), &mut warnings);
        match variant {
            CommandVariant::Rpath { path, .. } => assert!(path.is_none()),
            other => panic!("expected Rpath, got {other:?}"),
        }
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn undersized_command_clamps_with_a_warning() {
        // A symtab command cut off after symoff.
        let bytes = le_bytes(&[LC_SYMTAB, 0xc, 0x400]);
        let header = LoadCommandHeader { cmd: LC_SYMTAB, cmdsize: 0xc };
        let mut warnings = Vec::new();
        let variant =
            CommandVariant::parse(&bytes, header, scroll::LE, ContextAddress(0), &mut warnings);
        match variant {
            CommandVariant::Symtab(command) => {
                assert_eq!(command.symoff, 0x400);
                assert_eq!(command.nsyms, 0);
                assert_eq!(command.strsize, 0);
            }
            other => panic!("expected Symtab, got {other:?}"),
        }
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn unknown_commands_preserve_their_payload() {
        let bytes = le_bytes(&[0x7fff_fffe, 0x10, 0xdead_beef, 0xfeed_f00d]);
        let header = LoadCommandHeader { cmd: 0x7fff_fffe, cmdsize: 0x10 };
        let mut warnings = Vec::new();
        let variant =
            CommandVariant::parse(&bytes, header, scroll::LE, ContextAddress(0), &mut warnings);
        match variant {
            CommandVariant::Unknown { header, payload } => {
                assert_eq!(header.cmd, 0x7fff_fffe);
                assert_eq!(payload, le_bytes(&[0xdead_beef, 0xfeed_f00d]));
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        assert!(warnings.is_empty());
    }

    #[test]
    fn walk_stops_at_an_overflowing_command() {
        // Two minimal unknown commands, the second claiming to be larger
        // than the remaining region.
        let mut bytes = le_bytes(&[0x99, 0x8]);
        bytes.extend(le_bytes(&[0x9a, 0x20]));
        let map = MemoryMap::from(FileMap::from_bytes(bytes));
        let dm = DataModel::from_magic(crate::header::MH_MAGIC_64).unwrap();
        let (commands, warnings) = parse_all(&map, ContextAddress(0), 2, 0x10, dm);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].cmd, 0x99);
        assert_eq!(warnings.len(), 1);
    }
}
