//! The common spine of every parsed entity: a context window inside the
//! memory map, a by-value back-reference to the parent's window, bounded
//! sub-reads, structural warnings and the self-describing field schema.
//!
//! Nodes are created once during the forward parse and never mutated.
//! Ownership flows strictly downward (image owns segments, segments own
//! sections, …); parents are recorded as plain ranges, so there are no
//! reference cycles and nothing dangles — a node holds an [`Arc`] of the map
//! and re-reads on demand rather than keeping pointers into it.

use core::fmt;
use std::sync::Arc;

use crate::addr::ContextAddress;
use crate::error::{Error, Result};
use crate::map::MemoryMap;

/// A window in the context address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub addr: ContextAddress,
    pub size: u64,
}

impl Range {
    pub fn new(addr: ContextAddress, size: u64) -> Range {
        Range { addr, size }
    }

    /// A zero-length window, used for nodes with no mapped content
    /// (zero-fill segments, absent payloads).
    pub fn empty(addr: ContextAddress) -> Range {
        Range { addr, size: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// One past the last address, `None` on overflow.
    pub fn end(&self) -> Option<ContextAddress> {
        self.addr.checked_add(self.size)
    }

    pub fn contains(&self, addr: ContextAddress) -> bool {
        match self.end() {
            Some(end) => addr >= self.addr && addr < end,
            None => false,
        }
    }

    /// Whole containment; an empty `other` is contained anywhere.
    pub fn contains_range(&self, other: Range) -> bool {
        if other.is_empty() {
            return true;
        }
        match (self.end(), other.end()) {
            (Some(end), Some(other_end)) => other.addr >= self.addr && other_end <= end,
            _ => false,
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "[{}, {:#x})", self.addr, self.addr.0.wrapping_add(self.size))
    }
}

/// The backing of one node: its context window plus the map it reads from.
#[derive(Debug, Clone)]
pub struct Backing {
    map: Arc<MemoryMap>,
    range: Range,
    parent: Option<Range>,
}

impl Backing {
    /// A root backing. The window must be covered by the map unless empty.
    pub fn new(map: Arc<MemoryMap>, range: Range) -> Result<Backing> {
        if !range.is_empty() && !map.covers(range.addr, range.size) {
            return Err(Error::OutOfRange { address: range.addr.0, size: range.size });
        }
        Ok(Backing { map, range, parent: None })
    }

    /// A child backing: `range` must lie wholly inside this node's window.
    pub fn child(&self, range: Range) -> Result<Backing> {
        if !self.range.contains_range(range) {
            return Err(Error::Malformed(format!(
                "child range {} escapes parent range {}",
                range, self.range
            )));
        }
        Ok(Backing { map: Arc::clone(&self.map), range, parent: Some(self.range) })
    }

    /// An empty backing anchored at `addr`; always valid, reads nothing.
    pub fn empty(map: Arc<MemoryMap>, addr: ContextAddress) -> Backing {
        Backing { map, range: Range::empty(addr), parent: None }
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn parent(&self) -> Option<Range> {
        self.parent
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    pub fn map_arc(&self) -> &Arc<MemoryMap> {
        &self.map
    }

    pub fn contains(&self, addr: ContextAddress) -> bool {
        self.range.contains(addr)
    }

    /// Borrow `size` bytes at `offset` within this node's window.
    pub fn view_at(&self, offset: u64, size: u64) -> Result<&[u8]> {
        let address = self.translate(offset, size)?;
        self.map.view(address, size)
    }

    /// Copy out `size` bytes at `offset` within this node's window.
    pub fn read_at(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        Ok(self.view_at(offset, size)?.to_vec())
    }

    fn translate(&self, offset: u64, size: u64) -> Result<ContextAddress> {
        let err = || Error::OutOfRange { address: self.range.addr.0.wrapping_add(offset), size };
        let end = offset.checked_add(size).ok_or_else(err)?;
        if end > self.range.size {
            return Err(err());
        }
        self.range.addr.checked_add(offset).ok_or_else(err)
    }
}

/// A non-fatal structural defect, attached to the node it was observed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// Context address of the defective bytes.
    pub address: ContextAddress,
    pub message: String,
}

impl Warning {
    pub fn new(address: ContextAddress, message: impl Into<String>) -> Warning {
        let message = message.into();
        log::warn!("{address}: {message}");
        Warning { address, message }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}: {}", self.address, self.message)
    }
}

/// One entry of a node's self-description: a name/type/value triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub ty: &'static str,
    pub value: String,
}

impl Field {
    pub fn hex(name: &'static str, value: u64) -> Field {
        Field { name, ty: "hex", value: format!("{value:#x}") }
    }

    pub fn dec(name: &'static str, value: u64) -> Field {
        Field { name, ty: "dec", value: value.to_string() }
    }

    pub fn string(name: &'static str, value: impl Into<String>) -> Field {
        Field { name, ty: "string", value: value.into() }
    }
}

/// Generic self-rendering, consumed by renderers and the test suite.
pub trait Describe {
    fn description(&self) -> Vec<Field>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::FileMap;

    fn backing(len: usize) -> Backing {
        let map = Arc::new(MemoryMap::from(FileMap::from_bytes(vec![0xaa; len])));
        Backing::new(map, Range::new(ContextAddress(4), (len - 8) as u64)).unwrap()
    }

    #[test]
    fn range_containment() {
        let outer = Range::new(ContextAddress(0x10), 0x20);
        assert!(outer.contains(ContextAddress(0x10)));
        assert!(!outer.contains(ContextAddress(0x30)));
        assert!(outer.contains_range(Range::new(ContextAddress(0x18), 0x8)));
        assert!(!outer.contains_range(Range::new(ContextAddress(0x18), 0x20)));
        assert!(outer.contains_range(Range::empty(ContextAddress(0x1000))));
    }

    #[test]
    fn children_cannot_escape_their_parent() {
        let parent = backing(32);
        let child = parent.child(Range::new(ContextAddress(8), 8)).unwrap();
        assert_eq!(child.parent(), Some(parent.range()));
        assert!(parent.child(Range::new(ContextAddress(0), 8)).is_err());
        assert!(parent.child(Range::new(ContextAddress(24), 8)).is_err());
    }

    #[test]
    fn reads_are_window_relative_and_bounded() {
        let node = backing(32);
        assert_eq!(node.read_at(0, 4).unwrap(), vec![0xaa; 4]);
        assert!(node.view_at(20, 8).is_err());
        assert!(node.view_at(u64::MAX, 1).is_err());
    }

    #[test]
    fn root_backing_must_be_mapped() {
        let map = Arc::new(MemoryMap::from(FileMap::from_bytes(vec![0; 8])));
        assert!(Backing::new(Arc::clone(&map), Range::new(ContextAddress(4), 8)).is_err());
        let empty = Backing::empty(map, ContextAddress(0x999));
        assert!(empty.range().is_empty());
        assert!(empty.read_at(0, 1).is_err());
    }
}
