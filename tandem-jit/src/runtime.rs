//! The runtime half of the compiler/runtime contract: the dispatch loop that
//! executes emitted code, and the slow-path accessor thunks reachable through
//! `Call` slots.

use tandem_cpu::{mem::CpuId, Bus, CpuContext, GUEST_REGS, S0, S1};
use tandem_mem::FastmemArena;

use crate::{
    cache::CodeCache,
    emit::{self, AccessShape, OpSize},
    signal,
};

/// Identifies one runtime helper. The discriminant is the immediate of a
/// `Call` slot, so the patcher and the compiler can select thunks by
/// (CPU, direction, size) without touching the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum RuntimeFn {
    Load9B = 0,
    Load9H = 1,
    Load9W = 2,
    Load7B = 3,
    Load7H = 4,
    Load7W = 5,
    Store9B = 6,
    Store9H = 7,
    Store9W = 8,
    Store7B = 9,
    Store7H = 10,
    Store7W = 11,
    Block9Ld = 12,
    Block9LdPre = 13,
    Block9St = 14,
    Block9StPre = 15,
    Block7Ld = 16,
    Block7LdPre = 17,
    Block7St = 18,
    Block7StPre = 19,
}

impl RuntimeFn {
    #[inline]
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<RuntimeFn> {
        use RuntimeFn::*;
        Some(match id {
            0 => Load9B,
            1 => Load9H,
            2 => Load9W,
            3 => Load7B,
            4 => Load7H,
            5 => Load7W,
            6 => Store9B,
            7 => Store9H,
            8 => Store9W,
            9 => Store7B,
            10 => Store7H,
            11 => Store7W,
            12 => Block9Ld,
            13 => Block9LdPre,
            14 => Block9St,
            15 => Block9StPre,
            16 => Block7Ld,
            17 => Block7LdPre,
            18 => Block7St,
            19 => Block7StPre,
            _ => return None,
        })
    }

    pub fn cpu(self) -> CpuId {
        use RuntimeFn::*;
        match self {
            Load9B | Load9H | Load9W | Store9B | Store9H | Store9W | Block9Ld | Block9LdPre
            | Block9St | Block9StPre => CpuId::Arm9,
            _ => CpuId::Arm7,
        }
    }
}

/// Slow-path load accessors indexed by `[cpu][size]` with size 0/1/2 for
/// byte/half/word, mirroring the patcher's selection table.
pub const SLOW_LOAD: [[RuntimeFn; 3]; 2] = [
    [RuntimeFn::Load9B, RuntimeFn::Load9H, RuntimeFn::Load9W],
    [RuntimeFn::Load7B, RuntimeFn::Load7H, RuntimeFn::Load7W],
];

pub const SLOW_STORE: [[RuntimeFn; 3]; 2] = [
    [RuntimeFn::Store9B, RuntimeFn::Store9H, RuntimeFn::Store9W],
    [RuntimeFn::Store7B, RuntimeFn::Store7H, RuntimeFn::Store7W],
];

pub fn block_transfer_fn(cpu: CpuId, preinc: bool, store: bool) -> RuntimeFn {
    use RuntimeFn::*;
    match (cpu, preinc, store) {
        (CpuId::Arm9, false, false) => Block9Ld,
        (CpuId::Arm9, true, false) => Block9LdPre,
        (CpuId::Arm9, false, true) => Block9St,
        (CpuId::Arm9, true, true) => Block9StPre,
        (CpuId::Arm7, false, false) => Block7Ld,
        (CpuId::Arm7, true, false) => Block7LdPre,
        (CpuId::Arm7, false, true) => Block7St,
        (CpuId::Arm7, true, true) => Block7StPre,
    }
}

/// Execute emitted code starting at `entry` until its `Ret` slot.
///
/// The slot address is published to the context before every dispatch, and
/// fastmem access ops dereference the CPU's window directly: this is the
/// surface the host fault interception observes. After each access the
/// pending replay slot is honoured, which is how a demotion performed inside
/// the fault handler redirects the interrupted access to its patched form.
pub fn run(
    ctx: &mut CpuContext,
    bus: &mut dyn Bus,
    arena: &FastmemArena,
    cache: &CodeCache,
    entry: usize,
) {
    signal::set_current(ctx);
    let mut pc = entry;
    loop {
        // Published before the dispatch so the fault handler can locate the
        // site; SeqCst keeps the store ordered before the access itself.
        ctx.cache_pc.store(pc, std::sync::atomic::Ordering::SeqCst);
        let word = cache.read(pc);
        match emit::opcode(word) {
            emit::OP_NOP => {}
            emit::OP_RET => break,
            emit::OP_MASK_ADDR => {
                let align = (1u32 << emit::size2(word)) - 1;
                let value = ctx.reg(emit::rn(word)) & !align & tandem_mem::FASTMEM_ADDR_MASK;
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_AND_IMM => {
                let value = ctx.reg(emit::rn(word)) & emit::imm8(word);
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_LSL_IMM => {
                let value = ctx.reg(emit::rn(word)) << emit::imm5(word);
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_LSR_IMM => {
                let value = ctx.reg(emit::rn(word)) >> emit::imm5(word);
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_ASR_IMM => {
                let value = (ctx.reg(emit::rn(word)) as i32) >> emit::imm5(word);
                ctx.set_reg(emit::rd(word), value as u32);
            }
            emit::OP_ROR_IMM => {
                let value = ctx.reg(emit::rn(word)).rotate_right(emit::imm5(word));
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_ROR_REG => {
                let amount = ctx.reg(emit::rn(word)) & 31;
                let value = ctx.reg(emit::rd(word)).rotate_right(amount);
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_ADD_IMM => {
                let value = ctx.reg(emit::rn(word)).wrapping_add(emit::imm14(word));
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_SUB_IMM => {
                let value = ctx.reg(emit::rn(word)).wrapping_sub(emit::imm14(word));
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_ADD_REG => {
                let value = ctx.reg(emit::rn(word)).wrapping_add(ctx.reg(emit::rm(word)));
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_SUB_REG => {
                let value = ctx.reg(emit::rn(word)).wrapping_sub(ctx.reg(emit::rm(word)));
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_MOV_REG => {
                let value = ctx.reg(emit::rn(word));
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_MOV_IMM => {
                let value = cache.read(pc + 4);
                ctx.set_reg(emit::rd(word), value);
                pc += 8;
                continue;
            }
            emit::OP_SBFX => {
                let value = ctx.reg(emit::rn(word));
                let value = match emit::imm8(word) {
                    8 => value as u8 as i8 as i32 as u32,
                    _ => value as u16 as i16 as i32 as u32,
                };
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_UBFX => {
                let value = ctx.reg(emit::rn(word));
                let value = match emit::imm8(word) {
                    8 => value & 0xFF,
                    _ => value & 0xFFFF,
                };
                ctx.set_reg(emit::rd(word), value);
            }
            emit::OP_CALL => {
                let f = RuntimeFn::from_id(emit::imm16(word))
                    .unwrap_or_else(|| panic!("unknown runtime fn in call at {pc:#x}"));
                debug_assert_eq!(f.cpu(), ctx.cpu);
                dispatch(f, ctx, bus);
            }
            _ => {
                if let Some(shape) = AccessShape::decode(word) {
                    execute_access(shape, ctx, arena);
                    if let Some(replay) = ctx.replay.take() {
                        if let Some(page) = replay.bounce_page {
                            arena.unmap_bounce(ctx.cpu, page);
                        }
                        pc = replay.resume_pc;
                        continue;
                    }
                }
                else {
                    panic!("unknown emitted op {:#010x} at {pc:#x}", word);
                }
            }
        }
        pc += 4;
    }
    signal::clear_current();
}

/// Perform one fastmem access: a direct dereference of the window at the
/// masked offset staged in S1.
fn execute_access(shape: AccessShape, ctx: &mut CpuContext, arena: &FastmemArena) {
    let offset = ctx.reg(S1) as usize;
    let ptr = unsafe { arena.window_base(ctx.cpu).add(offset) };
    if shape.load {
        let value = unsafe {
            match shape.size {
                OpSize::B => {
                    let v = ptr.read_volatile() as u32;
                    if shape.signed { v as u8 as i8 as i32 as u32 } else { v }
                }
                OpSize::H => {
                    let v = ptr.cast::<u16>().read_volatile() as u32;
                    if shape.signed { v as u16 as i16 as i32 as u32 } else { v }
                }
                OpSize::W => ptr.cast::<u32>().read_volatile(),
                OpSize::X => unreachable!("doubleword accesses are never emitted"),
            }
        };
        ctx.set_reg(shape.rd, value);
    }
    else {
        let value = ctx.reg(shape.rd);
        unsafe {
            match shape.size {
                OpSize::B => ptr.write_volatile(value as u8),
                OpSize::H => ptr.cast::<u16>().write_volatile(value as u16),
                OpSize::W => ptr.cast::<u32>().write_volatile(value),
                OpSize::X => unreachable!("doubleword accesses are never emitted"),
            }
        }
    }
}

fn dispatch(f: RuntimeFn, ctx: &mut CpuContext, bus: &mut dyn Bus) {
    use RuntimeFn::*;

    let cpu = f.cpu();
    let addr = ctx.reg(S0);
    match f {
        Load9B | Load7B => {
            let value = bus.read8(cpu, addr) as u32;
            ctx.set_reg(S0, value);
        }
        Load9H | Load7H => {
            let value = bus.read16(cpu, addr & !1) as u32;
            ctx.set_reg(S0, value);
        }
        Load9W | Load7W => {
            // Misaligned word reads rotate, same as the fast path's emitted
            // rotation sequence.
            let value = bus.read32(cpu, addr & !3);
            ctx.set_reg(S0, value.rotate_right((addr & 3) * 8));
        }
        Store9B | Store7B => bus.write8(cpu, addr, ctx.reg(S1) as u8),
        Store9H | Store7H => bus.write16(cpu, addr & !1, ctx.reg(S1) as u16),
        Store9W | Store7W => bus.write32(cpu, addr & !3, ctx.reg(S1)),
        Block9Ld | Block7Ld => block_transfer(ctx, bus, cpu, false, false),
        Block9LdPre | Block7LdPre => block_transfer(ctx, bus, cpu, true, false),
        Block9St | Block7St => block_transfer(ctx, bus, cpu, false, true),
        Block9StPre | Block7StPre => block_transfer(ctx, bus, cpu, true, true),
    }
}

/// Move the registers named by the S1 mask between the guest register file
/// and the bus, as one batched transfer of ascending registers at ascending
/// addresses.
fn block_transfer(ctx: &mut CpuContext, bus: &mut dyn Bus, cpu: CpuId, preinc: bool, store: bool) {
    let mask = ctx.reg(S1) as u16;
    let count = mask.count_ones() as usize;
    let base = ctx.reg(S0) & !3;
    let start = if preinc { base.wrapping_add(4) } else { base };

    let mut words = [0u32; GUEST_REGS];
    if store {
        let mut slot = 0;
        for reg in 0..GUEST_REGS as u8 {
            if mask & (1 << reg) != 0 {
                words[slot] = ctx.reg(reg);
                slot += 1;
            }
        }
        bus.write_block(cpu, start, &words[..count]);
    }
    else {
        bus.read_block(cpu, start, &mut words[..count]);
        let mut slot = 0;
        for reg in 0..GUEST_REGS as u8 {
            if mask & (1 << reg) != 0 {
                ctx.set_reg(reg, words[slot]);
                slot += 1;
            }
        }
    }
}
