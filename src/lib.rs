//! # machview
//!
//! A lightweight, navigable Mach-O image parsing crate for files and
//! process memory.
//!
//! `machview` exposes a lazily materialized object graph over a single
//! Mach-O image — an executable, dylib, bundle or object file — resident
//! either in a file on disk or in a task's address space (live or from a
//! memory dump), including images relocated into the dyld shared cache.
//!
//! The parse is deliberately permissive: construction fails only when no
//! meaningful view exists at all (bad magic, unreadable header). Everything
//! else — truncated load-command regions, commands smaller than their own
//! structure, tables pointing outside the link-edit segment — degrades to a
//! [`Warning`](node::Warning) on the affected node, with the node (and the
//! image) still constructed.
//!
//! ```no_run
//! use machview::Image;
//!
//! fn main() -> machview::error::Result<()> {
//!     let image = Image::open("/usr/lib/dyld")?;
//!     for segment in image.segments() {
//!         println!("{} at {}", segment.name, segment.vmaddr);
//!     }
//!     if let Some(symbols) = image.symbol_table() {
//!         for symbol in symbols.iter() {
//!             println!("{:#x} {}", symbol.n_value, symbols.name_of(&symbol).unwrap_or_default());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The three address spaces an image straddles — context, file and VM — are
//! distinct types ([`addr`]); conversions are explicit operations on
//! [`Image`], parametrized by the image's slide and origin.

pub mod addr;
pub mod constants;
pub mod data_model;
pub mod error;
pub mod header;
pub mod image;
pub mod load_command;
pub mod map;
pub mod node;
pub mod segment;
pub mod symbols;

pub use crate::addr::{ContextAddress, FileAddress, Slide, VmAddress};
pub use crate::data_model::DataModel;
pub use crate::error::{Error, Result};
pub use crate::image::{IMAGE_WAS_PROCESSED_BY_DYLD, Image};
pub use crate::map::{FileMap, MemoryMap, TaskMap};
