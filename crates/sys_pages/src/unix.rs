use std::io::{self, Error};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Maps an over-sized anonymous region, then trims the head and tail so the
/// surviving range is exactly `len` bytes starting on an `align` boundary.
pub fn map_aligned(len: usize, align: usize) -> io::Result<NonNull<u8>> {
    let padded = len + align;
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            padded,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }

    let base = raw as usize;
    let aligned = (base + align - 1) & !(align - 1);
    let head = aligned - base;
    let tail = padded - head - len;

    // SAFETY: both sub-ranges lie inside the mapping we just created and do
    // not overlap the [aligned, aligned + len) range we are keeping.
    unsafe {
        if head > 0 {
            libc::munmap(raw, head);
        }
        if tail > 0 {
            libc::munmap((aligned + len) as *mut libc::c_void, tail);
        }
    }

    // SAFETY: aligned is derived from a successful non-null mapping.
    Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
}

/// # Safety
///
/// `ptr`/`len` must describe a live mapping produced by [`map_aligned`].
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    // SAFETY: forwarded to the caller.
    unsafe {
        libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len);
    }
}
