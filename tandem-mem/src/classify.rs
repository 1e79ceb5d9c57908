use crate::{
    CpuId, MemConfig, ARM7_WRAM_OFFSET, ARM7_WRAM_SIZE, DTCM_OFFSET, MAIN_RAM_OFFSET,
    MAIN_RAM_SIZE, SHARED_WRAM_OFFSET,
};

/// Semantic classification of a guest address. Recomputed on demand, never
/// cached across configuration changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionTag {
    Itcm,
    Dtcm,
    Bios9,
    MainRam,
    Swram9,
    Swram7,
    Io9,
    Vram,
    Bios7,
    Wram7,
    Io7,
    Wifi,
    Vwram,
    Other,
}

impl RegionTag {
    pub const COUNT: usize = 14;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Classify a guest address for the given CPU. Total and deterministic over
/// all 32-bit inputs.
pub fn classify(cfg: &MemConfig, cpu: CpuId, addr: u32) -> RegionTag {
    match cpu {
        CpuId::Arm9 => classify_arm9(cfg, addr),
        CpuId::Arm7 => classify_arm7(cfg, addr),
    }
}

fn classify_arm9(cfg: &MemConfig, addr: u32) -> RegionTag {
    if addr < cfg.itcm_size {
        RegionTag::Itcm
    }
    else if addr >= cfg.dtcm_base && addr < cfg.dtcm_base.wrapping_add(cfg.dtcm_size) {
        RegionTag::Dtcm
    }
    else if addr & 0xFFFF_F000 == 0xFFFF_0000 {
        RegionTag::Bios9
    }
    else {
        match addr & 0xFF00_0000 {
            0x0200_0000 => RegionTag::MainRam,
            0x0300_0000 => RegionTag::Swram9,
            0x0400_0000 => RegionTag::Io9,
            0x0600_0000 => RegionTag::Vram,
            _ => RegionTag::Other,
        }
    }
}

fn classify_arm7(cfg: &MemConfig, addr: u32) -> RegionTag {
    if addr < 0x4000 {
        RegionTag::Bios7
    }
    else {
        match addr & 0xFF80_0000 {
            0x0200_0000 | 0x0280_0000 => RegionTag::MainRam,
            0x0300_0000 => {
                if cfg.swram7.is_some() {
                    RegionTag::Swram7
                }
                else {
                    RegionTag::Wram7
                }
            }
            0x0380_0000 => RegionTag::Wram7,
            0x0400_0000 => RegionTag::Io7,
            0x0480_0000 => RegionTag::Wifi,
            0x0600_0000 | 0x0680_0000 => RegionTag::Vwram,
            _ => RegionTag::Other,
        }
    }
}

/// Whether a region can be put behind fastmem. Only regions with stable,
/// side-effect-free backing memory qualify; everything else (I/O, VRAM, BIOS,
/// the wireless controller) stays on the slow path because of side effects,
/// sub-bank dispatch, or a layout the arena cannot cheaply mirror.
pub fn is_mappable(region: RegionTag) -> bool {
    matches!(
        region,
        RegionTag::MainRam
            | RegionTag::Dtcm
            | RegionTag::Wram7
            | RegionTag::Swram9
            | RegionTag::Swram7
    )
}

/// Fold a mappable-region address to its canonical coordinate in the physical
/// backing store, so that mirror aliases of the same byte compare equal. Used
/// as the key for literal invalidation tracking. Addresses outside the
/// mappable regions pass through unchanged.
pub fn collapse_mirror(cfg: &MemConfig, cpu: CpuId, addr: u32) -> u32 {
    match classify(cfg, cpu, addr) {
        RegionTag::MainRam => MAIN_RAM_OFFSET + (addr & (MAIN_RAM_SIZE - 1)),
        RegionTag::Dtcm => DTCM_OFFSET + (addr - cfg.dtcm_base),
        RegionTag::Wram7 => ARM7_WRAM_OFFSET + (addr & (ARM7_WRAM_SIZE - 1)),
        RegionTag::Swram9 => match cfg.swram9 {
            Some(bank) => SHARED_WRAM_OFFSET + bank.offset + (addr & (bank.size - 1)),
            None => addr,
        },
        RegionTag::Swram7 => match cfg.swram7 {
            Some(bank) => SHARED_WRAM_OFFSET + bank.offset + (addr & (bank.size - 1)),
            None => addr,
        },
        _ => addr,
    }
}
