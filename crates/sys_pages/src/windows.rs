use std::io::{self, Error};
use std::mem;
use std::ptr::{self, NonNull};

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity (typically 64 KiB).
///
/// `VirtualAlloc` places reservations on this boundary, so any alignment up
/// to the granularity comes for free.
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub fn map_aligned(len: usize, align: usize) -> io::Result<NonNull<u8>> {
    assert!(
        align <= allocation_granularity(),
        "alignment above the allocation granularity is not supported"
    );

    // Reservations are granularity-aligned, which satisfies any block
    // alignment the collector asks for.
    let raw = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
    if raw.is_null() {
        return Err(Error::last_os_error());
    }
    debug_assert_eq!(raw as usize % align, 0);

    // SAFETY: raw was checked non-null above.
    Ok(unsafe { NonNull::new_unchecked(raw.cast::<u8>()) })
}

/// # Safety
///
/// `ptr` must describe a live mapping produced by [`map_aligned`].
pub unsafe fn unmap(ptr: NonNull<u8>, _len: usize) {
    // MEM_RELEASE requires dwSize to be 0.
    unsafe {
        VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE);
    }
}
