//! The boundary with the host OS: a SIGSEGV/SIGBUS handler that adapts a
//! hardware fault into a [`FaultDescription`](crate::FaultDescription) and
//! applies the handler's resolution.
//!
//! The subsystem is single-threaded by design: the handler runs on the one
//! guest-execution thread, suspended mid-access, so its reads and writes of
//! the published session state are sequenced with the executor's own. The
//! raw pointers installed here must stay valid until [`uninstall`].

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use tandem_cpu::CpuContext;
use tandem_mem::FastmemArena;

use crate::{
    cache::CodeCache,
    fault::{handle_fault, FaultDescription, FaultOutcome, FaultReason},
};

// `libc` does not export this `si_code` constant for Linux targets, so we
// provide the fixed ABI value (`<asm-generic/siginfo.h>`: SEGV_ACCERR == 2).
const SEGV_ACCERR: libc::c_int = 2;

static ARENA: AtomicPtr<FastmemArena> = AtomicPtr::new(ptr::null_mut());
static CACHE: AtomicPtr<CodeCache> = AtomicPtr::new(ptr::null_mut());
static CURRENT: AtomicPtr<CpuContext> = AtomicPtr::new(ptr::null_mut());

struct SavedAction(UnsafeCell<MaybeUninit<libc::sigaction>>);

// Written once during `install`, read only inside the handler.
unsafe impl Sync for SavedAction {}

static SAVED_SEGV: SavedAction = SavedAction(UnsafeCell::new(MaybeUninit::uninit()));
static SAVED_BUS: SavedAction = SavedAction(UnsafeCell::new(MaybeUninit::uninit()));

/// Register the fault handler and publish the session state it operates on.
///
/// # Safety
///
/// `arena` and `cache` must outlive the installation. Must not be called
/// twice without an intervening [`uninstall`].
pub unsafe fn install(arena: *mut FastmemArena, cache: *const CodeCache) {
    ARENA.store(arena, Ordering::SeqCst);
    CACHE.store(cache as *mut CodeCache, Ordering::SeqCst);

    let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) = on_fault;
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_SIGINFO;
    libc::sigemptyset(&mut action.sa_mask);

    libc::sigaction(libc::SIGSEGV, &action, (*SAVED_SEGV.0.get()).as_mut_ptr());
    libc::sigaction(libc::SIGBUS, &action, (*SAVED_BUS.0.get()).as_mut_ptr());
}

/// Restore the previously registered handlers and retract the session state.
///
/// # Safety
///
/// Must only be called after [`install`].
pub unsafe fn uninstall() {
    libc::sigaction(libc::SIGSEGV, (*SAVED_SEGV.0.get()).as_ptr(), ptr::null_mut());
    libc::sigaction(libc::SIGBUS, (*SAVED_BUS.0.get()).as_ptr(), ptr::null_mut());
    ARENA.store(ptr::null_mut(), Ordering::SeqCst);
    CACHE.store(ptr::null_mut(), Ordering::SeqCst);
    CURRENT.store(ptr::null_mut(), Ordering::SeqCst);
}

/// Publish the context of the CPU entering the executor. The two CPUs run
/// cooperatively, so at most one context is current at a time.
pub(crate) fn set_current(ctx: *mut CpuContext) {
    CURRENT.store(ctx, Ordering::SeqCst);
}

pub(crate) fn clear_current() {
    CURRENT.store(ptr::null_mut(), Ordering::SeqCst);
}

#[cfg(target_os = "linux")]
unsafe fn fault_addr_of(info: *mut libc::siginfo_t) -> usize {
    (*info).si_addr() as usize
}

#[cfg(not(target_os = "linux"))]
unsafe fn fault_addr_of(info: *mut libc::siginfo_t) -> usize {
    (*info).si_addr as usize
}

extern "C" fn on_fault(sig: libc::c_int, info: *mut libc::siginfo_t, _uctx: *mut libc::c_void) {
    let arena = ARENA.load(Ordering::SeqCst);
    let cache = CACHE.load(Ordering::SeqCst);
    let ctx = CURRENT.load(Ordering::SeqCst);

    if !arena.is_null() && !cache.is_null() && !ctx.is_null() {
        let reason = match unsafe { (*info).si_code } {
            SEGV_ACCERR if sig == libc::SIGSEGV => FaultReason::Permission,
            _ => FaultReason::Unbacked,
        };
        let mut desc = FaultDescription {
            pc: unsafe { (*ctx).cache_pc.load(Ordering::Relaxed) },
            fault_addr: unsafe { fault_addr_of(info) },
            reason,
            ctx: unsafe { &mut *ctx },
        };
        match handle_fault(&mut desc, unsafe { &mut *arena }, unsafe { &*cache }) {
            // Returning resumes the interrupted access: it retries against
            // the fresh mapping, or completes into the bounce page and
            // replays through the patched site.
            FaultOutcome::Mapped | FaultOutcome::Demoted => return,
            FaultOutcome::NotOurs => {}
        }
    }

    // Not a fastmem fault. Reinstate the previous handler and return; the
    // access re-raises and the fault surfaces through the normal fatal path.
    let saved = match sig {
        libc::SIGBUS => &SAVED_BUS,
        _ => &SAVED_SEGV,
    };
    unsafe {
        libc::sigaction(sig, (*saved.0.get()).as_ptr(), ptr::null_mut());
    }
}
