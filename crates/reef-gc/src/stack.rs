//! Native stack and register capture for conservative root scanning.
//!
//! The gatherer needs every pointer-sized word the running thread could be
//! holding a cell reference in: callee-saved registers are captured into a
//! stack-local array, then the stack is walked word by word from that array's
//! address down to the thread's stack bottom.

/// Bounds of the current thread's stack region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackBounds {
    /// Highest address of the region; the stack grows down from here.
    pub bottom: usize,
    /// Lowest address of the region.
    #[allow(dead_code)]
    pub top: usize,
}

#[cfg(miri)]
pub(crate) fn get_stack_bounds() -> StackBounds {
    // Miri has no observable stack region; an empty range disables scanning.
    StackBounds { bottom: 0, top: 0 }
}

#[cfg(all(target_os = "linux", not(miri)))]
pub(crate) fn get_stack_bounds() -> StackBounds {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    // SAFETY: attr is initialized by pthread_getattr_np before any use and
    // destroyed on every path.
    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        let ret = pthread_getattr_np(pthread_self(), &raw mut attr);
        assert!(ret == 0, "pthread_getattr_np failed");

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        if ret != 0 {
            pthread_attr_destroy(&raw mut attr);
            panic!("pthread_attr_getstack failed");
        }
        pthread_attr_destroy(&raw mut attr);

        StackBounds {
            bottom: stackaddr as usize + stacksize,
            top: stackaddr as usize,
        }
    }
}

#[cfg(all(not(target_os = "linux"), not(miri)))]
pub(crate) fn get_stack_bounds() -> StackBounds {
    unimplemented!("stack bounds retrieval only implemented for Linux")
}

/// Reads the x86_64 callee-saved registers into an array the caller keeps on
/// its stack. Must stay inlined so the reads happen in the scanning frame.
#[cfg(all(target_arch = "x86_64", not(miri)))]
#[inline(always)]
fn capture_registers() -> [usize; 6] {
    let mut regs = [0usize; 6];
    // SAFETY: reads registers into locals, no memory effects.
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
        );
    }
    regs
}

/// No direct register access on this target (or under Miri); an oversized
/// array pressures the compiler into spilling whatever it was holding in
/// registers somewhere the stack walk will see.
#[cfg(any(not(target_arch = "x86_64"), miri))]
#[inline(always)]
fn capture_registers() -> [usize; 32] {
    [0usize; 32]
}

/// Captures callee-saved registers, then hands every candidate word to
/// `scan_word(word, address, is_register)`.
///
/// `#[inline(never)]` keeps the captured registers in a frame below every
/// caller frame being scanned.
///
/// # Safety
///
/// Must be called on the thread whose stack the current heap scans; the
/// closure reads raw stack memory of that thread.
#[inline(never)]
pub(crate) unsafe fn spill_registers_and_scan<F>(mut scan_word: F)
where
    F: FnMut(usize, usize, bool),
{
    let regs = capture_registers();
    std::hint::black_box(&regs);
    for &word in &regs {
        scan_word(word, 0, true);
    }

    // The register array's address approximates the current stack pointer;
    // everything between it and the stack bottom belongs to caller frames.
    let sp = std::ptr::addr_of!(regs) as usize;
    // SAFETY: forwarded from the caller.
    unsafe { scan_stack_words(sp, &mut scan_word) };
}

/// Walks `[sp, stack bottom)` one aligned word at a time.
///
/// # Safety
///
/// `sp` must lie within the calling thread's stack.
unsafe fn scan_stack_words<F>(sp: usize, scan_word: &mut F)
where
    F: FnMut(usize, usize, bool),
{
    let bounds = get_stack_bounds();
    let mut current = sp & !(std::mem::align_of::<usize>() - 1);
    while current < bounds.bottom {
        // SAFETY: [current, bottom) is this thread's own mapped stack.
        let word = unsafe { std::ptr::read_volatile(current as *const usize) };
        scan_word(word, current, false);
        current += std::mem::size_of::<usize>();
    }
}
