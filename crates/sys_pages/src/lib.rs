//! Aligned anonymous page mappings.
//!
//! The collector carves managed cells out of fixed-size heap blocks and
//! resolves an arbitrary cell pointer to its owning block by masking off the
//! low address bits. That only works when every block is naturally aligned
//! to its own size, which general-purpose allocators do not guarantee; this
//! crate provides the small OS-specific layer that does.

use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Maps `len` bytes of zeroed anonymous memory whose base address is a
/// multiple of `align`.
///
/// `align` must be a power of two and a multiple of the system page size;
/// `len` must be a multiple of `align`.
///
/// # Errors
///
/// Returns the OS error if the mapping cannot be created.
///
/// # Panics
///
/// Panics if `align` is not a power of two, is smaller than the system page
/// size, or does not divide `len`.
pub fn map_aligned(len: usize, align: usize) -> io::Result<NonNull<u8>> {
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    assert!(align >= page_size(), "alignment below system page size");
    assert!(len > 0 && len % align == 0, "length must be a multiple of alignment");
    os::map_aligned(len, align)
}

/// Releases a mapping previously returned by [`map_aligned`].
///
/// # Safety
///
/// `ptr` must have been returned by [`map_aligned`] with the same `len`, and
/// must not be used afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    // SAFETY: forwarded to the caller.
    unsafe { os::unmap(ptr, len) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_aligned() {
        let align = 16 * 1024;
        let ptr = map_aligned(align, align).expect("map_aligned failed");
        assert_eq!(ptr.as_ptr() as usize % align, 0);
        unsafe { unmap(ptr, align) };
    }

    #[test]
    fn mapping_is_zeroed_and_writable() {
        let align = 16 * 1024;
        let ptr = map_aligned(align, align).expect("map_aligned failed");
        unsafe {
            assert_eq!(ptr.as_ptr().read(), 0);
            assert_eq!(ptr.as_ptr().add(align - 1).read(), 0);
            ptr.as_ptr().write(0xAB);
            assert_eq!(ptr.as_ptr().read(), 0xAB);
            unmap(ptr, align);
        }
    }

    #[test]
    fn multiple_blocks_do_not_overlap() {
        let align = 16 * 1024;
        let a = map_aligned(align, align).expect("map_aligned failed");
        let b = map_aligned(align, align).expect("map_aligned failed");
        let (a_addr, b_addr) = (a.as_ptr() as usize, b.as_ptr() as usize);
        assert!(a_addr + align <= b_addr || b_addr + align <= a_addr);
        unsafe {
            unmap(a, align);
            unmap(b, align);
        }
    }
}
