//! Synchronous recovery from a hardware fault raised by emitted code.

use tracing::trace;

use tandem_cpu::{CpuContext, Replay, S0};
use tandem_mem::{FastmemArena, FASTMEM_WINDOW_SIZE, HOST_PAGE_SIZE};

use crate::{cache::CodeCache, patch};

/// Why the host rejected the access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultReason {
    /// The target page has no backing yet.
    Unbacked,
    /// The target page is backed but the access violates its protection.
    Permission,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The region was backed; resuming retries the access against the fresh
    /// mapping.
    Mapped,
    /// The site was patched to the slow path; resuming replays it.
    Demoted,
    /// The fault did not originate from emitted code. The caller must treat
    /// it as fatal.
    NotOurs,
}

/// Everything the OS boundary hands over for one fault event: the emitted-op
/// program counter, the faulting host address, the fault reason, and a
/// mutable handle to the interrupted CPU's register context.
pub struct FaultDescription<'a> {
    pub pc: usize,
    pub fault_addr: usize,
    pub reason: FaultReason,
    pub ctx: &'a mut CpuContext,
}

/// Handle one fault to completion. Every path either prepares the context to
/// resume or reports the fault as foreign; the handler never leaves the
/// interrupted CPU suspended.
pub fn handle_fault(
    desc: &mut FaultDescription,
    arena: &mut FastmemArena,
    cache: &CodeCache,
) -> FaultOutcome {
    if !cache.contains(desc.pc) {
        return FaultOutcome::NotOurs;
    }

    let cpu = desc.ctx.cpu;
    let window = arena.window_base(cpu) as usize;
    if desc.fault_addr < window || desc.fault_addr >= window + FASTMEM_WINDOW_SIZE {
        return FaultOutcome::NotOurs;
    }

    // The full guest address of the in-flight access lives in S0, per the
    // operand contract of emitted access sites.
    let guest_addr = desc.ctx.reg(S0);

    if desc.reason == FaultReason::Unbacked && arena.map_at_address(cpu, guest_addr) {
        trace!("fault at {:#x}: backed {:08x} for {}", desc.pc, guest_addr, cpu);
        return FaultOutcome::Mapped;
    }

    // The region cannot be mapped: demote the site for good, then arm the
    // replay so the interrupted access completes harmlessly and re-dispatches
    // one slot back, at the freshly written slow-path call.
    patch::rewrite(cache, desc.pc, cpu);

    let page = (desc.fault_addr - window) as u32 & !(HOST_PAGE_SIZE as u32 - 1);
    let bounce_page = if arena.covers_window_offset(cpu, page) {
        None
    }
    else {
        arena.map_bounce(cpu, page);
        Some(page)
    };
    desc.ctx.replay.set(Some(Replay { resume_pc: desc.pc - 4, bounce_page }));
    FaultOutcome::Demoted
}
