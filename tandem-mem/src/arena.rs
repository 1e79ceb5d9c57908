use tracing::debug;

use crate::{
    align_down,
    classify::{classify, RegionTag},
    host, CpuId, MemConfig, SwramBank, ARM7_WRAM_OFFSET, ARM7_WRAM_SIZE, BACKING_TOTAL_SIZE,
    BOUNCE_OFFSET, DTCM_OFFSET, DTCM_SIZE, FASTMEM_ADDR_MASK, FASTMEM_WINDOW_SIZE,
    HOST_PAGE_SIZE, MAIN_RAM_OFFSET, MAIN_RAM_SIZE, SHARED_WRAM_OFFSET, SHARED_WRAM_SIZE,
};

/// One active aliasing of a physical backing sub-range into a CPU's fastmem
/// window. `start` is the guest address of the mirror the mapping serves;
/// multiple mappings may alias the same physical range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub start: u32,
    pub size: u32,
    pub offset: u32,
    pub cpu: CpuId,
}

impl Mapping {
    #[inline]
    fn contains(&self, addr: u32) -> bool {
        addr.wrapping_sub(self.start) < self.size
    }
}

/// Owns the physical backing store, the two per-CPU fastmem windows, and the
/// table of installed mappings. All mutation of the host mapping state
/// funnels through [`FastmemArena::map_at_address`] and the reconfiguration
/// entry points.
pub struct FastmemArena {
    cfg: MemConfig,
    backing: host::Backing,
    direct: host::View,
    windows: [host::Reservation; 2],
    mappings: [Vec<Mapping>; RegionTag::COUNT],
}

impl FastmemArena {
    /// Allocates the backing store, reserves both fastmem windows, and maps
    /// the direct view used for ordinary guest-memory access. Failure of any
    /// host call is fatal; the process cannot run without the arena.
    pub fn init(cfg: MemConfig) -> FastmemArena {
        let backing = host::Backing::create(BACKING_TOTAL_SIZE as usize)
            .expect("failed to allocate the fastmem backing store");
        let direct =
            host::View::map(&backing).expect("failed to map the direct guest-memory view");
        let windows = [
            host::Reservation::reserve(FASTMEM_WINDOW_SIZE)
                .expect("failed to reserve the arm9 fastmem window"),
            host::Reservation::reserve(FASTMEM_WINDOW_SIZE)
                .expect("failed to reserve the arm7 fastmem window"),
        ];

        debug!(
            "fastmem arena: backing {:#x} bytes, windows at {:p}/{:p}",
            backing.size(),
            windows[0].base(),
            windows[1].base(),
        );

        FastmemArena {
            cfg,
            backing,
            direct,
            windows,
            mappings: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Fastmem mappings deliberately survive a guest soft-reset; the memory
    /// content is reinitialised through the direct view by the caller.
    pub fn reset(&mut self) {}

    #[inline]
    pub fn config(&self) -> &MemConfig {
        &self.cfg
    }

    #[inline]
    pub fn window_base(&self, cpu: CpuId) -> *mut u8 {
        self.windows[cpu.index()].base()
    }

    pub fn mappings(&self, region: RegionTag) -> &[Mapping] {
        &self.mappings[region.index()]
    }

    /// Whether an installed mapping of this CPU covers the guest address.
    pub fn is_backed(&self, cpu: CpuId, addr: u32) -> bool {
        self.mappings
            .iter()
            .flatten()
            .any(|m| m.cpu == cpu && m.contains(addr))
    }

    /// Whether an installed mapping of this CPU covers the given offset into
    /// its fastmem window.
    pub fn covers_window_offset(&self, cpu: CpuId, offset: u32) -> bool {
        self.mappings.iter().flatten().any(|m| {
            m.cpu == cpu && offset.wrapping_sub(m.start & FASTMEM_ADDR_MASK) < m.size
        })
    }

    /// Try to back the region containing `addr` for `cpu`. Returns false when
    /// the region cannot be put behind fastmem (the caller must demote the
    /// access to the slow path instead).
    pub fn map_at_address(&mut self, cpu: CpuId, addr: u32) -> bool {
        let region = classify(&self.cfg, cpu, addr);

        let (mirror_start, mirror_size, mem_offset) = match region {
            RegionTag::MainRam => {
                (align_down(addr, MAIN_RAM_SIZE), MAIN_RAM_SIZE, MAIN_RAM_OFFSET)
            }
            RegionTag::Wram7 => {
                (align_down(addr, ARM7_WRAM_SIZE), ARM7_WRAM_SIZE, ARM7_WRAM_OFFSET)
            }
            RegionTag::Swram9 => match self.cfg.swram9 {
                Some(bank) => bank_mirror(addr, bank),
                None => return false,
            },
            RegionTag::Swram7 => match self.cfg.swram7 {
                Some(bank) => bank_mirror(addr, bank),
                None => return false,
            },
            RegionTag::Dtcm => (self.cfg.dtcm_base, self.cfg.dtcm_size, DTCM_OFFSET),
            _ => return false,
        };

        // Every window install lands at `start & FASTMEM_ADDR_MASK`, so the
        // mirror range must sit entirely inside the low 28 bits. The only
        // region that can escape is a relocated DTCM; refuse it and let the
        // access demote.
        if mirror_start & !FASTMEM_ADDR_MASK != 0
            || mirror_start as u64 + mirror_size as u64 > FASTMEM_WINDOW_SIZE as u64
        {
            return false;
        }

        if cpu == CpuId::Arm9 && region != RegionTag::Dtcm {
            self.install_split_around_dtcm(region, mirror_start, mirror_size, mem_offset)
        }
        else {
            debug!(
                "{} mapped region {:?} {:08x} size: {:x}",
                cpu, region, mirror_start, mirror_size
            );
            self.install(cpu, region, mirror_start, mem_offset, mirror_size);
            true
        }
    }

    /// Install a mapping on the primary CPU, splitting or shortening the
    /// mirror range so that no byte of the current DTCM window is covered.
    fn install_split_around_dtcm(
        &mut self,
        region: RegionTag,
        mirror_start: u32,
        mirror_size: u32,
        mem_offset: u32,
    ) -> bool {
        let mirror_end = mirror_start + mirror_size;
        let dtcm_start = self.cfg.dtcm_base;
        let dtcm_end = self.cfg.dtcm_base.wrapping_add(self.cfg.dtcm_size);

        // Strict inequalities: a DTCM boundary that coincides with a mirror
        // boundary must not produce a zero-length mapping.
        let start_inside = dtcm_start > mirror_start && dtcm_start < mirror_end;
        let end_inside = dtcm_end > mirror_start && dtcm_end < mirror_end;

        if self.cfg.dtcm_size != 0 && dtcm_start <= mirror_start && dtcm_end >= mirror_end {
            // DTCM swallows the whole mirror; classification already routes
            // these addresses to the DTCM window, nothing left to map.
            return false;
        }

        match (start_inside, end_inside) {
            (true, true) => {
                debug!(
                    "arm9 mapped region split into two by DTCM({:08x}-{:08x}) {:?} {:08x} size: {:x}",
                    dtcm_start, dtcm_end, region, mirror_start, mirror_size
                );
                self.install(
                    CpuId::Arm9,
                    region,
                    mirror_start,
                    mem_offset,
                    dtcm_start - mirror_start,
                );
                self.install(
                    CpuId::Arm9,
                    region,
                    dtcm_end,
                    mem_offset + (dtcm_end - mirror_start),
                    mirror_end - dtcm_end,
                );
            }
            (true, false) => {
                debug!(
                    "arm9 mapped region shortened on the right by DTCM({:08x}-{:08x}) {:?} {:08x} size: {:x}",
                    dtcm_start, dtcm_end, region, mirror_start, mirror_size
                );
                self.install(
                    CpuId::Arm9,
                    region,
                    mirror_start,
                    mem_offset,
                    dtcm_start - mirror_start,
                );
            }
            (false, true) => {
                debug!(
                    "arm9 mapped region shortened on the left by DTCM({:08x}-{:08x}) {:?} {:08x} size: {:x}",
                    dtcm_start, dtcm_end, region, mirror_start, mirror_size
                );
                self.install(
                    CpuId::Arm9,
                    region,
                    dtcm_end,
                    mem_offset + (dtcm_end - mirror_start),
                    mirror_end - dtcm_end,
                );
            }
            (false, false) => {
                debug!(
                    "arm9 mapped region {:?} {:08x} size: {:x}",
                    region, mirror_start, mirror_size
                );
                self.install(CpuId::Arm9, region, mirror_start, mem_offset, mirror_size);
            }
        }
        true
    }

    fn install(&mut self, cpu: CpuId, region: RegionTag, start: u32, offset: u32, size: u32) {
        let at = unsafe {
            self.windows[cpu.index()]
                .base()
                .add((start & FASTMEM_ADDR_MASK) as usize)
        };
        // Classification said this range is mappable, so the host call must
        // succeed.
        unsafe { host::map_fixed(at, &self.backing, offset as usize, size as usize) }
            .expect("failed to install a fastmem mapping");
        self.mappings[region.index()].push(Mapping { start, size, offset, cpu });
    }

    /// Relocate the DTCM window. Every primary-CPU mapping overlapping either
    /// the old or the new span is torn down so that a stale alias can never
    /// serve the relocated scratchpad; the next touch re-faults and re-maps.
    pub fn set_dtcm(&mut self, base: u32, size: u32) {
        assert!(
            base as usize % HOST_PAGE_SIZE == 0 && (size == 0 || size.is_power_of_two()),
            "invalid dtcm window: {base:08x}+{size:x}"
        );
        let (old_base, old_size) = (self.cfg.dtcm_base, self.cfg.dtcm_size);
        let windows = &self.windows;
        for list in &mut self.mappings {
            list.retain(|m| {
                if m.cpu != CpuId::Arm9
                    || (!overlaps(m.start, m.size, old_base, old_size)
                        && !overlaps(m.start, m.size, base, size))
                {
                    return true;
                }
                let at = unsafe {
                    windows[CpuId::Arm9.index()]
                        .base()
                        .add((m.start & FASTMEM_ADDR_MASK) as usize)
                };
                unsafe { host::unmap_fixed(at, m.size as usize) }
                    .expect("failed to tear down a fastmem mapping");
                false
            });
        }
        self.cfg.dtcm_base = base;
        self.cfg.dtcm_size = size;
        debug!("dtcm moved to {:08x} size: {:x}", base, size);
    }

    /// Change the shared-WRAM bank assigned to a CPU. Mappings of the 0x03
    /// banked window for that CPU are torn down because their classification
    /// (and physical target) changes with the bank.
    pub fn set_swram(&mut self, cpu: CpuId, bank: Option<SwramBank>) {
        if let Some(bank) = bank {
            assert!(
                bank.size.is_power_of_two()
                    && bank.offset + bank.size <= SHARED_WRAM_SIZE
                    && bank.size as usize % HOST_PAGE_SIZE == 0,
                "invalid shared WRAM bank: {bank:?}"
            );
        }

        let windows = &self.windows;
        for region in [RegionTag::Swram9, RegionTag::Swram7, RegionTag::Wram7] {
            self.mappings[region.index()].retain(|m| {
                let banked_window = m.start & 0xFF80_0000 == 0x0300_0000;
                if m.cpu != cpu || !banked_window {
                    return true;
                }
                let at = unsafe {
                    windows[cpu.index()]
                        .base()
                        .add((m.start & FASTMEM_ADDR_MASK) as usize)
                };
                unsafe { host::unmap_fixed(at, m.size as usize) }
                    .expect("failed to tear down a fastmem mapping");
                false
            });
        }

        match cpu {
            CpuId::Arm9 => self.cfg.swram9 = bank,
            CpuId::Arm7 => self.cfg.swram7 = bank,
        }
        debug!("{} swram bank now {:x?}", cpu, bank);
    }

    /// Alias the scratch bounce page over one window page so that a faulted
    /// access that has just been demoted can complete harmlessly before the
    /// patched site replays it through the slow path.
    pub fn map_bounce(&self, cpu: CpuId, page: u32) {
        debug_assert_eq!(page as usize % HOST_PAGE_SIZE, 0);
        debug_assert!((page as usize) < FASTMEM_WINDOW_SIZE);
        let at = unsafe { self.windows[cpu.index()].base().add(page as usize) };
        unsafe { host::map_fixed(at, &self.backing, BOUNCE_OFFSET as usize, HOST_PAGE_SIZE) }
            .expect("failed to map the bounce page");
    }

    pub fn unmap_bounce(&self, cpu: CpuId, page: u32) {
        debug_assert_eq!(page as usize % HOST_PAGE_SIZE, 0);
        let at = unsafe { self.windows[cpu.index()].base().add(page as usize) };
        unsafe { host::unmap_fixed(at, HOST_PAGE_SIZE) }
            .expect("failed to unmap the bounce page");
    }

    /// The whole physical backing store (minus the bounce page), addressed by
    /// the same coordinates `collapse_mirror` produces.
    pub fn backing(&mut self) -> &mut [u8] {
        self.section(0, BOUNCE_OFFSET)
    }

    pub fn main_ram(&mut self) -> &mut [u8] {
        self.section(MAIN_RAM_OFFSET, MAIN_RAM_SIZE)
    }

    pub fn swram(&mut self) -> &mut [u8] {
        self.section(SHARED_WRAM_OFFSET, SHARED_WRAM_SIZE)
    }

    pub fn wram7(&mut self) -> &mut [u8] {
        self.section(ARM7_WRAM_OFFSET, ARM7_WRAM_SIZE)
    }

    pub fn dtcm(&mut self) -> &mut [u8] {
        self.section(DTCM_OFFSET, DTCM_SIZE)
    }

    fn section(&mut self, offset: u32, size: u32) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.direct.base().add(offset as usize), size as usize)
        }
    }
}

fn bank_mirror(addr: u32, bank: SwramBank) -> (u32, u32, u32) {
    (align_down(addr, bank.size), bank.size, SHARED_WRAM_OFFSET + bank.offset)
}

fn overlaps(a_start: u32, a_size: u32, b_start: u32, b_size: u32) -> bool {
    let a_end = a_start as u64 + a_size as u64;
    let b_end = b_start as u64 + b_size as u64;
    (a_start as u64) < b_end && (b_start as u64) < a_end
}
