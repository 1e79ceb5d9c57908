//! In-place demotion of a faulting fastmem access to its slow-path form.

use tracing::debug;

use tandem_cpu::{mem::CpuId, S0, S1};

use crate::{
    cache::CodeCache,
    emit::{self, AccessShape, OpSize},
    runtime::{SLOW_LOAD, SLOW_STORE},
};

/// Permanently rewrite the fastmem access at `pc` into a call to the matching
/// slow-path accessor, preserving the site's slot layout so surrounding
/// offsets stay valid. Any word at `pc` outside the closed shape set is a
/// fatal internal-consistency error: the compiler and this table must always
/// agree.
pub fn rewrite(cache: &CodeCache, pc: usize, cpu: CpuId) {
    let word = cache.read(pc);
    let shape = match AccessShape::decode(word) {
        Some(shape) => shape,
        None => panic!("not a fastmem access shape at {pc:#x}: {word:#010x}"),
    };
    assert!(
        shape.size != OpSize::X,
        "doubleword accesses are never emitted at fastmem sites"
    );

    // The slot before the access holds the address-masking guard; the
    // rewritten sequence starts there.
    let guard_pc = pc - 4;
    assert!(cache.contains(guard_pc), "fastmem site at the cache base has no guard slot");
    debug_assert_eq!(emit::opcode(cache.read(guard_pc)), emit::OP_MASK_ADDR);

    debug!(
        "rewriting mem access {:#x} {:08x} ({} {} {})",
        pc,
        word,
        shape.load,
        shape.signed,
        shape.size.bits()
    );

    let size_index = shape.size as usize;
    let mut seq = [emit::nop(); 5];
    let len;
    if shape.load {
        seq[0] = emit::call(SLOW_LOAD[cpu.index()][size_index].id());
        if shape.size == OpSize::W {
            seq[1] = emit::mov_reg(shape.rd, S0);
            // Pad over the rotation sequence the fast path reserved.
            len = 5;
        }
        else {
            seq[1] = if shape.signed {
                emit::sbfx(shape.rd, S0, shape.size.bits())
            }
            else {
                emit::ubfx(shape.rd, S0, shape.size.bits())
            };
            len = 2;
        }
    }
    else {
        seq[0] = emit::mov_reg(S1, shape.rd);
        seq[1] = emit::call(SLOW_STORE[cpu.index()][size_index].id());
        len = 2;
    }

    unsafe { cache.patch(guard_pc, &seq[..len]) };
    cache.flush(guard_pc, guard_pc + len * 4);
}
