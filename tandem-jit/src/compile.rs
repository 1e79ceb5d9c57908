use hashbrown::HashMap;
use tracing::trace;

use tandem_cpu::{
    instr::{BlockTransfer, MemAccess, MemInstr, MemKind, MemOp, Offset, ShiftKind},
    mem::{classify::collapse_mirror, is_mappable, CpuId, MemConfig, RegionTag},
    Bus, S0, S1, S2, S3,
};
use tandem_mem::{FastmemArena, FASTMEM_ADDR_MASK, FASTMEM_WINDOW_SIZE};

use crate::{
    cache::CodeCache,
    emit::{self, OpSize},
    runtime::{block_transfer_fn, SLOW_LOAD, SLOW_STORE},
};

pub struct JitConfig {
    /// Fold side-effect-free PC-relative loads into compile-time constants.
    pub literal_optimisations: bool,

    /// Emit direct window dereferences for accesses whose hinted region is
    /// mappable. With this off every access calls the slow path.
    pub fastmem: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self { literal_optimisations: true, fastmem: true }
    }
}

/// A literal resolved at compile time, kept for reuse by later compiles of
/// the same source location until the underlying address is written.
#[derive(Clone, Copy, Debug)]
pub struct LiteralCacheEntry {
    /// Mirror-collapsed backing coordinate of the folded address.
    pub guest_addr: u32,
    pub value: u32,
}

/// The load/store compiler and its persistent state: the code cache it emits
/// into and the literal bookkeeping shared across compiles.
pub struct Jit {
    pub cfg: JitConfig,
    pub cache: CodeCache,
    literal_values: HashMap<(CpuId, u32), LiteralCacheEntry>,
    invalid_literals: Vec<u32>,
}

impl Jit {
    pub fn new(cfg: JitConfig, cache_words: usize) -> Jit {
        Jit {
            cfg,
            cache: CodeCache::new(cache_words),
            literal_values: HashMap::new(),
            invalid_literals: Vec::new(),
        }
    }

    /// External notification that guest memory was written. Drops any cached
    /// literal for the address and marks it so the next compile of a fold
    /// site re-reads the live value.
    pub fn notify_write(&mut self, mem_cfg: &MemConfig, cpu: CpuId, addr: u32) {
        let key = collapse_mirror(mem_cfg, cpu, addr);
        self.literal_values.retain(|_, entry| entry.guest_addr != key);
        if !self.invalid_literals.contains(&key) {
            self.invalid_literals.push(key);
        }
    }

    /// Emit the code for one decoded guest memory instruction into the open
    /// block.
    pub fn compile_mem_instr(
        &mut self,
        arena: &FastmemArena,
        bus: &mut dyn Bus,
        cpu: CpuId,
        instr: &MemInstr,
    ) {
        match instr.kind {
            MemKind::Single(access) => self.compile_single(arena, bus, cpu, instr, access),
            MemKind::Block(transfer) => self.compile_block(arena, bus, cpu, instr, transfer),
        }
    }

    /// Close the open block.
    pub fn end_block(&self) -> usize {
        self.cache.push(emit::ret())
    }

    fn compile_single(
        &mut self,
        arena: &FastmemArena,
        bus: &mut dyn Bus,
        cpu: CpuId,
        instr: &MemInstr,
        access: MemAccess,
    ) {
        let pc_base = if instr.thumb { instr.pc & !2 } else { instr.pc };

        if let Offset::Imm(imm) = access.offset {
            let foldable = self.cfg.literal_optimisations
                && access.rn == 15
                && access.rd != 15
                && !access
                    .flags
                    .intersects(MemOp::STORE | MemOp::POST | MemOp::WRITEBACK);
            if foldable {
                let addr = if access.flags.contains(MemOp::SUBTRACT_OFFSET) {
                    pc_base.wrapping_sub(imm)
                }
                else {
                    pc_base.wrapping_add(imm)
                };
                if self.compile_load_literal(arena.config(), bus, cpu, instr, access, addr) {
                    return;
                }
            }
        }

        let rn_src = if access.rn == 15 {
            self.emit_mov_imm(S3, pc_base);
            S3
        }
        else {
            access.rn
        };

        // Compute the access address into S0. Post-indexed forms access the
        // old base and update the base register in place; pre-indexed
        // writeback copies the computed address back.
        if access.flags.contains(MemOp::POST) {
            self.cache.push(emit::mov_reg(S0, rn_src));
            self.emit_offset_apply(access.rn, rn_src, access.offset, access.flags);
        }
        else {
            self.emit_offset_apply(S0, rn_src, access.offset, access.flags);
            if access.flags.contains(MemOp::WRITEBACK) {
                self.cache.push(emit::mov_reg(access.rn, S0));
            }
        }

        let size = OpSize::from_bits(access.size);
        let store = access.flags.contains(MemOp::STORE);
        let signed = access.flags.contains(MemOp::SIGN_EXTEND);

        // Take a chance at fastmem only when the hinted region has stable
        // backing and the instruction cannot be skipped: demotion is
        // permanent, so a conditional access must never be the trigger.
        let fast = self.cfg.fastmem
            && instr.always_executes()
            && is_mappable(instr.hint)
            && hint_in_window(arena.config(), instr.hint);

        if fast {
            self.cache.push(emit::mask_addr(S1, S0, size));
            if store {
                self.cache.push(emit::fm_store(size, access.rd));
            }
            else {
                self.cache.push(emit::fm_load(size, signed, access.rd));
                if size == OpSize::W {
                    // Reproduce the guest's misaligned-word rotation.
                    self.cache.push(emit::and_imm(S0, S0, 3));
                    self.cache.push(emit::lsl_imm(S0, S0, 3));
                    self.cache.push(emit::ror_reg(access.rd, S0));
                }
            }
        }
        else if store {
            self.cache.push(emit::mov_reg(S1, access.rd));
            self.cache.push(emit::call(SLOW_STORE[cpu.index()][size as usize].id()));
        }
        else {
            self.cache.push(emit::call(SLOW_LOAD[cpu.index()][size as usize].id()));
            if size == OpSize::W {
                self.cache.push(emit::mov_reg(access.rd, S0));
            }
            else if signed {
                self.cache.push(emit::sbfx(access.rd, S0, size.bits()));
            }
            else {
                self.cache.push(emit::ubfx(access.rd, S0, size.bits()));
            }
        }
    }

    /// Try to resolve a PC-relative load at compile time. Returns false when
    /// the address is on the invalidation list (consuming the entry, so the
    /// emitted runtime access re-reads the live value once).
    fn compile_load_literal(
        &mut self,
        mem_cfg: &MemConfig,
        bus: &mut dyn Bus,
        cpu: CpuId,
        instr: &MemInstr,
        access: MemAccess,
        addr: u32,
    ) -> bool {
        let key = collapse_mirror(mem_cfg, cpu, addr);
        if let Some(index) = self.invalid_literals.iter().position(|&a| a == key) {
            self.invalid_literals.swap_remove(index);
            return false;
        }

        let signed = access.flags.contains(MemOp::SIGN_EXTEND);
        let cached = self
            .literal_values
            .get(&(cpu, instr.pc))
            .filter(|entry| entry.guest_addr == key)
            .map(|entry| entry.value);
        let value = match cached {
            Some(value) => value,
            None => match access.size {
                32 => bus.read32(cpu, addr & !3).rotate_right((addr & 3) * 8),
                16 => {
                    let v = bus.read16(cpu, addr & !1) as u32;
                    if signed { v as u16 as i16 as i32 as u32 } else { v }
                }
                _ => {
                    let v = bus.read8(cpu, addr) as u32;
                    if signed { v as u8 as i8 as i32 as u32 } else { v }
                }
            },
        };

        trace!("folded literal {:08x} -> {:08x} at {:08x}", addr, value, instr.pc);
        self.emit_mov_imm(access.rd, value);

        if instr.always_executes() {
            self.literal_values
                .insert((cpu, instr.pc), LiteralCacheEntry { guest_addr: key, value });
        }
        true
    }

    fn compile_block(
        &mut self,
        arena: &FastmemArena,
        bus: &mut dyn Bus,
        cpu: CpuId,
        instr: &MemInstr,
        transfer: BlockTransfer,
    ) {
        let count = transfer.regs.count_ones();
        if count == 0 {
            // TODO: an empty register list transfers r15 on the real CPU.
            return;
        }

        if count == 1 {
            // Single-register lists reduce to the ordinary access path.
            let rd = transfer.regs.trailing_zeros() as u8;
            let mut flags = MemOp::empty();
            if transfer.store {
                flags |= MemOp::STORE;
            }
            if transfer.decrement {
                flags |= MemOp::SUBTRACT_OFFSET;
            }
            let access = MemAccess {
                size: 32,
                rd,
                rn: transfer.rn,
                offset: Offset::Imm(if transfer.preinc { 4 } else { 0 }),
                flags,
            };
            self.compile_single(arena, bus, cpu, instr, access);
        }
        else {
            // Multi-register transfers always go through the batched slow
            // path.
            let mut preinc = transfer.preinc;
            if transfer.decrement {
                self.cache.push(emit::sub_imm(S0, transfer.rn, 4 * count));
                preinc = !preinc;
            }
            else {
                self.cache.push(emit::mov_reg(S0, transfer.rn));
            }
            self.emit_mov_imm(S1, transfer.regs as u32);
            self.cache
                .push(emit::call(block_transfer_fn(cpu, preinc, transfer.store).id()));
        }

        // Base writeback. A load list containing the base suppresses it
        // unless, on the primary CPU, the base is the sole register or a
        // higher-numbered register is also transferred; the secondary CPU
        // always suppresses it.
        let mut writeback = transfer.writeback;
        if !transfer.store && writeback && (transfer.regs >> transfer.rn) & 1 == 1 {
            writeback = match cpu {
                CpuId::Arm9 => {
                    let higher = transfer.regs as u32 & !((2u32 << transfer.rn) - 1);
                    count == 1 || higher != 0
                }
                CpuId::Arm7 => false,
            };
        }
        if writeback {
            if transfer.decrement {
                self.cache.push(emit::sub_imm(transfer.rn, transfer.rn, 4 * count));
            }
            else {
                self.cache.push(emit::add_imm(transfer.rn, transfer.rn, 4 * count));
            }
        }
    }

    fn emit_mov_imm(&mut self, rd: u8, value: u32) {
        self.cache.push(emit::mov_imm(rd));
        self.cache.push(value);
    }

    /// Emit `dest = rn ± offset`, staging shifted register offsets through a
    /// scratch register.
    fn emit_offset_apply(&mut self, dest: u8, rn: u8, offset: Offset, flags: MemOp) {
        let subtract = flags.contains(MemOp::SUBTRACT_OFFSET);
        match offset {
            Offset::Imm(0) => {
                if dest != rn {
                    self.cache.push(emit::mov_reg(dest, rn));
                }
            }
            Offset::Imm(imm) => {
                let word = if subtract {
                    emit::sub_imm(dest, rn, imm)
                }
                else {
                    emit::add_imm(dest, rn, imm)
                };
                self.cache.push(word);
            }
            Offset::Reg { rm, shift, amount } => {
                let rm_eff = if amount != 0 {
                    let code = match shift {
                        ShiftKind::Lsl => emit::OP_LSL_IMM,
                        ShiftKind::Lsr => emit::OP_LSR_IMM,
                        ShiftKind::Asr => emit::OP_ASR_IMM,
                        ShiftKind::Ror => emit::OP_ROR_IMM,
                    };
                    self.cache.push(emit::shift_imm(code, S2, rm, amount));
                    S2
                }
                else {
                    rm
                };
                let word = if subtract {
                    emit::sub_reg(dest, rn, rm_eff)
                }
                else {
                    emit::add_reg(dest, rn, rm_eff)
                };
                self.cache.push(word);
            }
        }
    }
}

/// Whether a region's span is guaranteed to survive the low-28-bit address
/// masking of the fast path. Only a relocated DTCM can escape the window;
/// its accesses compile to the slow path instead of risking an alias.
fn hint_in_window(cfg: &MemConfig, hint: RegionTag) -> bool {
    match hint {
        RegionTag::Dtcm => {
            cfg.dtcm_base & !FASTMEM_ADDR_MASK == 0
                && cfg.dtcm_base as u64 + cfg.dtcm_size as u64 <= FASTMEM_WINDOW_SIZE as u64
        }
        _ => true,
    }
}
