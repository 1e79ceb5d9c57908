use std::cell::{Cell, UnsafeCell};

use crate::emit;

/// Arena of fixed-size instruction slots holding the generated code.
///
/// Slots are append-only during compilation; the only mutation of live slots
/// is the patcher's bounded in-place rewrite, which goes through the unsafe
/// [`CodeCache::patch`] seam and is followed by an explicit [`CodeCache::flush`]
/// barrier. The executor re-fetches every slot through a volatile read, so a
/// rewrite performed while the executing thread is suspended inside the
/// fault handler is visible to the next dispatch.
pub struct CodeCache {
    slots: Box<[UnsafeCell<u32>]>,
    len: Cell<usize>,
}

impl CodeCache {
    pub fn new(capacity_words: usize) -> CodeCache {
        let slots = (0..capacity_words).map(|_| UnsafeCell::new(emit::nop())).collect();
        CodeCache { slots, len: Cell::new(0) }
    }

    /// Host address of the first slot.
    #[inline]
    pub fn base(&self) -> usize {
        self.slots.as_ptr() as usize
    }

    /// Host address one past the last emitted slot.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.base() + self.len.get() * 4
    }

    /// Whether a host program counter points into the emitted region.
    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.base() && pc < self.cursor()
    }

    /// Append one instruction word, returning its slot address.
    pub fn push(&self, word: u32) -> usize {
        let index = self.len.get();
        assert!(index < self.slots.len(), "code cache exhausted");
        unsafe { self.slots[index].get().write_volatile(word) };
        self.len.set(index + 1);
        self.base() + index * 4
    }

    pub fn read(&self, pc: usize) -> u32 {
        let index = self.index_of(pc);
        unsafe { self.slots[index].get().read_volatile() }
    }

    /// Overwrite `words.len()` consecutive slots starting at `pc`.
    ///
    /// # Safety
    ///
    /// `pc..pc + 4 * words.len()` must lie within the emitted region, and the
    /// caller must only replace a recognized site shape with a sequence of
    /// identical length (surrounding slot offsets stay valid). A
    /// [`CodeCache::flush`] of the range must follow before execution resumes.
    pub unsafe fn patch(&self, pc: usize, words: &[u32]) {
        let index = self.index_of(pc);
        assert!(index + words.len() <= self.len.get(), "patch escapes the emitted region");
        for (i, &word) in words.iter().enumerate() {
            self.slots[index + i].get().write_volatile(word);
        }
    }

    /// Make an in-place rewrite of `start..end` visible to subsequent
    /// instruction fetches. On a host executing the cache natively this is
    /// the instruction-cache flush; the portable runtime needs only the
    /// ordering barrier, since every dispatch re-reads its slot.
    pub fn flush(&self, start: usize, end: usize) {
        debug_assert!(start >= self.base() && end <= self.cursor());
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        tracing::trace!("icache flush {:#x}..{:#x}", start, end);
    }

    /// Borrow the emitted words, for inspection in tests and debug dumps.
    pub fn words(&self, start: usize, count: usize) -> Vec<u32> {
        (0..count).map(|i| self.read(start + i * 4)).collect()
    }

    #[inline]
    fn index_of(&self, pc: usize) -> usize {
        debug_assert_eq!(pc % 4, self.base() % 4);
        assert!(self.contains(pc), "pc {pc:#x} outside the code cache");
        (pc - self.base()) / 4
    }
}
