//! The three address spaces an image straddles, kept apart by type.
//!
//! Every cross-reference decoded out of a Mach-O image is an offset into one
//! of three spaces: the *context* space (where the bytes currently are — a
//! file offset for file maps, a runtime VA for task maps), the *file* space
//! (the offset an octet would have in the on-disk, unslid image), and the
//! *vm* space (the static virtual address the linker recorded). Conflating
//! them is the classic Mach-O parsing bug, so each gets its own newtype and
//! conversions only exist as explicit operations on
//! [`Image`](crate::image::Image).

use core::fmt;

macro_rules! address_kind {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            /// Offset this address forward, `None` on overflow.
            pub fn checked_add(self, offset: u64) -> Option<$name> {
                self.0.checked_add(offset).map($name)
            }

            /// Distance from `base` up to `self`, `None` if `self < base`.
            pub fn offset_from(self, base: $name) -> Option<u64> {
                self.0.checked_sub(base.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
                write!(fmt, "{:#x}", self.0)
            }
        }

        impl From<$name> for u64 {
            fn from(addr: $name) -> u64 {
                addr.0
            }
        }
    };
}

address_kind! {
    /// An address in the memory map the image was parsed from: a file offset
    /// when the map is file-backed, a task VA when it is task-backed.
    ContextAddress
}

address_kind! {
    /// An offset into the on-disk, unslid rendition of the image.
    FileAddress
}

address_kind! {
    /// A static virtual address as recorded by the linker.
    VmAddress
}

/// Signed offset between an image's recorded VM base and the base it
/// actually appears at (ASLR, shared-cache relocation).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slide(pub i64);

impl Slide {
    /// Slide a recorded VM address into the context space.
    pub fn checked_apply(self, vm: VmAddress) -> Option<ContextAddress> {
        checked_offset(vm.0 as i128 + self.0 as i128).map(ContextAddress)
    }

    /// Undo the slide: recover the recorded VM address from a context address.
    pub fn checked_unapply(self, context: ContextAddress) -> Option<VmAddress> {
        checked_offset(context.0 as i128 - self.0 as i128).map(VmAddress)
    }
}

impl fmt::Display for Slide {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.0 < 0 {
            write!(fmt, "-{:#x}", self.0.unsigned_abs())
        } else {
            write!(fmt, "{:#x}", self.0)
        }
    }
}

fn checked_offset(wide: i128) -> Option<u64> {
    if (0..=u64::MAX as i128).contains(&wide) { Some(wide as u64) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_add_overflow() {
        assert_eq!(ContextAddress(4).checked_add(4), Some(ContextAddress(8)));
        assert_eq!(ContextAddress(u64::MAX).checked_add(1), None);
    }

    #[test]
    fn offset_from_underflow() {
        assert_eq!(FileAddress(0x20).offset_from(FileAddress(0x8)), Some(0x18));
        assert_eq!(FileAddress(0x8).offset_from(FileAddress(0x20)), None);
    }

    #[test]
    fn slide_round_trips() {
        let slide = Slide(0x1000);
        let context = slide.checked_apply(VmAddress(0x100000000)).unwrap();
        assert_eq!(context, ContextAddress(0x100001000));
        assert_eq!(slide.checked_unapply(context), Some(VmAddress(0x100000000)));
    }

    #[test]
    fn negative_slide_saturates_at_zero() {
        assert_eq!(Slide(-0x2000).checked_apply(VmAddress(0x1000)), None);
        assert_eq!(
            Slide(-0x1000).checked_apply(VmAddress(0x1000)),
            Some(ContextAddress(0))
        );
    }
}
