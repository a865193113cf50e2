//! Translation buffers: a fixed-capacity associative
//! map from virtual page to physical page, one instance each for
//! instruction and data streams.
//!
//! A genuinely cached, invalidatable address-translation structure, since
//! the Alpha has a real MMU to model. The round-robin replacement and
//! last-match memoization follow the architecture's own description.

use crate::cpu::registers::ProcessorMode;

pub const TB_ENTRIES: usize = 32;

/// Granularity hint from a PTE: selects the page size and
/// derives `(match_mask, keep_mask)` — the mask applied to the stored
/// virtual tag, and the mask of low bits passed through from the virtual
/// address into the physical result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Kb8 = 0,
    Kb64 = 1,
    Kb512 = 2,
    Mb4 = 3,
}

impl Granularity {
    pub fn from_hint(hint: u8) -> Self {
        match hint & 0b11 {
            0 => Granularity::Kb8,
            1 => Granularity::Kb64,
            2 => Granularity::Kb512,
            _ => Granularity::Mb4,
        }
    }

    /// `(match_mask, keep_mask)`: match_mask selects the bits that must
    /// agree with the stored tag; keep_mask selects the low bits of the
    /// virtual address passed straight through to the physical result.
    pub fn masks(self) -> (u64, u64) {
        // The granularity hint multiplies the base 8 KiB page by 8^hint,
        // i.e. three extra low bits per step (8 KiB / 64 KiB / 512 KiB / 4 MiB).
        let keep_bits: u32 = match self {
            Granularity::Kb8 => 13,
            Granularity::Kb64 => 16,
            Granularity::Kb512 => 19,
            Granularity::Mb4 => 22,
        };
        let keep_mask = (1u64 << keep_bits) - 1;
        (!keep_mask, keep_mask)
    }
}

/// Per-mode read/write access permission matrix: indexed by
/// `[kernel, executive, supervisor, user]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessMatrix {
    pub read: [bool; 4],
    pub write: [bool; 4],
}

impl AccessMatrix {
    pub fn allows(&self, mode: ProcessorMode, write: bool) -> bool {
        let slot = mode as usize;
        if write {
            self.write[slot]
        } else {
            self.read[slot]
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FaultBits {
    pub on_read: bool,
    pub on_write: bool,
    pub on_execute: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TbEntry {
    pub valid: bool,
    pub virt_tag: u64,
    pub phys_base: u64,
    pub match_mask: u64,
    pub keep_mask: u64,
    pub asn: u32,
    pub asm_bit: bool,
    pub access: AccessMatrix,
    pub fault: FaultBits,
}

impl Default for TbEntry {
    fn default() -> Self {
        TbEntry {
            valid: false,
            virt_tag: 0,
            phys_base: 0,
            match_mask: !0,
            keep_mask: 0,
            asn: 0,
            asm_bit: false,
            access: AccessMatrix::default(),
            fault: FaultBits::default(),
        }
    }
}

/// A looked-up translation, combining the matched entry's physical base with
/// the low bits of the queried virtual address.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    pub physical: u64,
    pub asm_bit: bool,
    pub access: AccessMatrix,
    pub fault: FaultBits,
}

/// One miss result: which of the two architectural miss traps applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Miss {
    /// Instruction-stream miss.
    Itb,
    /// Single data miss (short-format PTE fetch).
    DtbSingle,
    /// Double (VPTE) data miss.
    DtbDouble,
}

pub struct TranslationBuffer {
    entries: [TbEntry; TB_ENTRIES],
    next_slot: usize,
    /// Last-match memoization, one slot per {read, write}: lookup starts
    /// from the last-found index before falling back to a full scan.
    last_match: [usize; 2],
    is_instruction_buffer: bool,
}

impl TranslationBuffer {
    pub fn new(is_instruction_buffer: bool) -> Self {
        TranslationBuffer {
            entries: [TbEntry::default(); TB_ENTRIES],
            next_slot: 0,
            last_match: [0, 0],
            is_instruction_buffer,
        }
    }

    fn memo_slot(write: bool) -> usize {
        if write {
            1
        } else {
            0
        }
    }

    /// Lookup: linear scan with ASN match or ASM-bit
    /// override, starting from the last-found index.
    pub fn lookup(&mut self, virt: u64, asn: u32, write: bool) -> Option<Translation> {
        let memo = Self::memo_slot(write);
        let start = self.last_match[memo];
        for offset in 0..TB_ENTRIES {
            let idx = (start + offset) % TB_ENTRIES;
            let entry = &self.entries[idx];
            if !entry.valid {
                continue;
            }
            if (virt & entry.match_mask) != entry.virt_tag {
                continue;
            }
            if entry.asn != asn && !entry.asm_bit {
                continue;
            }
            self.last_match[memo] = idx;
            let physical = (entry.phys_base & !entry.keep_mask) | (virt & entry.keep_mask);
            return Some(Translation { physical, asm_bit: entry.asm_bit, access: entry.access, fault: entry.fault });
        }
        None
    }

    pub fn miss_kind(&self, is_write: bool) -> Miss {
        if self.is_instruction_buffer {
            Miss::Itb
        } else if is_write {
            // A real implementation distinguishes single vs double (VPTE)
            // misses by whether the PTE itself is already mapped; we model
            // the common case (PTE present, single miss) and let the PAL
            // VPTE path escalate to DtbDouble when it re-faults, matching
            // the superpage-bypass branch.
            Miss::DtbSingle
        } else {
            Miss::DtbSingle
        }
    }

    /// Insert: round-robin unless an entry already matches
    /// the same virtual tag, splitting the incoming PTE into its physical
    /// base, permission vector, fault vector, and ASM bit.
    pub fn insert(
        &mut self,
        virt: u64,
        phys_base: u64,
        granularity: Granularity,
        asn: u32,
        asm_bit: bool,
        access: AccessMatrix,
        fault: FaultBits,
    ) {
        let (match_mask, keep_mask) = granularity.masks();
        let tag = virt & match_mask;
        let existing = self.entries.iter().position(|e| e.valid && e.virt_tag == tag && e.match_mask == match_mask);
        let slot = existing.unwrap_or_else(|| {
            let s = self.next_slot;
            self.next_slot = (self.next_slot + 1) % TB_ENTRIES;
            s
        });
        self.entries[slot] =
            TbEntry { valid: true, virt_tag: tag, phys_base: phys_base & !keep_mask, match_mask, keep_mask, asn, asm_bit, access, fault };
    }

    /// Invalidate a single entry covering `virt`.
    pub fn invalidate_single(&mut self, virt: u64) {
        for entry in self.entries.iter_mut() {
            if entry.valid && (virt & entry.match_mask) == entry.virt_tag {
                entry.valid = false;
            }
        }
    }

    /// TBIA: invalidate every entry. Idempotent.
    pub fn invalidate_all(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.valid = false;
        }
        self.last_match = [0, 0];
    }

    /// TBIAP: invalidate only process-local entries (ASM bit clear).
    pub fn invalidate_process_local(&mut self) {
        for entry in self.entries.iter_mut() {
            if !entry.asm_bit {
                entry.valid = false;
            }
        }
    }
}

/// Superpage shortcut: fixed virtual-prefix windows that
/// bypass the TB entirely when SPE is enabled in kernel mode. The three
/// windows correspond to the architecture's superpage 0/1/2 regions, each
/// mapping a stripe of PA directly from VA with no ASN dependence.
pub struct SuperpageWindow {
    pub va_prefix: u64,
    pub va_prefix_mask: u64,
    pub pa_mask: u64,
}

pub const SUPERPAGE_WINDOWS: [SuperpageWindow; 3] = [
    // SPE bit 0: va[43] set, va[42:41] == 2 -> direct-mapped low 1 TB.
    SuperpageWindow { va_prefix: 0xFFFF_FC00_0000_0000, va_prefix_mask: 0xFFFF_FE00_0000_0000, pa_mask: 0x0000_01FF_FFFF_FFFF },
    // SPE bit 1: va[42:41] == 1 -> direct-mapped low 4 GB (legacy superpage).
    SuperpageWindow { va_prefix: 0xFFFF_F800_0000_0000, va_prefix_mask: 0xFFFF_FF00_0000_0000, pa_mask: 0x0000_0000_FFFF_FFFF },
    // SPE bit 2: va[42:41] == 0 with va[40] set -> second 4 GB stripe.
    SuperpageWindow { va_prefix: 0xFFFF_F900_0000_0000, va_prefix_mask: 0xFFFF_FF00_0000_0000, pa_mask: 0x0000_0000_FFFF_FFFF },
];

pub fn superpage_translate(spe: u8, mode: ProcessorMode, virt: u64) -> Option<u64> {
    if mode != ProcessorMode::Kernel {
        return None;
    }
    for (bit, window) in SUPERPAGE_WINDOWS.iter().enumerate() {
        if spe & (1 << bit) == 0 {
            continue;
        }
        if (virt & window.va_prefix_mask) == window.va_prefix {
            return Some(virt & window.pa_mask);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_access() -> AccessMatrix {
        AccessMatrix { read: [true; 4], write: [true; 4] }
    }

    #[test]
    fn insert_then_lookup_returns_physical_or_with_keep_bits() {
        let mut tb = TranslationBuffer::new(true);
        tb.insert(0x10000, 0x4000_0000, Granularity::Kb8, 0, false, full_access(), FaultBits::default());
        let t = tb.lookup(0x10123, 0, false).expect("should hit");
        assert_eq!(t.physical, 0x4000_0123);
    }

    #[test]
    fn miss_outside_covered_range() {
        let mut tb = TranslationBuffer::new(true);
        tb.insert(0x10000, 0x4000_0000, Granularity::Kb8, 0, false, full_access(), FaultBits::default());
        assert!(tb.lookup(0x20000, 0, false).is_none());
    }

    #[test]
    fn asn_mismatch_misses_unless_asm_set() {
        let mut tb = TranslationBuffer::new(false);
        tb.insert(0x10000, 0x4000_0000, Granularity::Kb8, 5, false, full_access(), FaultBits::default());
        assert!(tb.lookup(0x10000, 6, false).is_none());
        tb.invalidate_all();
        tb.insert(0x10000, 0x4000_0000, Granularity::Kb8, 5, true, full_access(), FaultBits::default());
        assert!(tb.lookup(0x10000, 6, false).is_some());
    }

    #[test]
    fn tbia_is_idempotent() {
        let mut tb = TranslationBuffer::new(true);
        tb.insert(0x10000, 0x4000_0000, Granularity::Kb8, 0, false, full_access(), FaultBits::default());
        tb.invalidate_all();
        let snapshot = tb.lookup(0x10000, 0, false).is_none();
        tb.invalidate_all();
        assert_eq!(tb.lookup(0x10000, 0, false).is_none(), snapshot);
    }

    #[test]
    fn invalidate_process_local_keeps_asm_entries() {
        let mut tb = TranslationBuffer::new(true);
        tb.insert(0x10000, 0x4000_0000, Granularity::Kb8, 0, true, full_access(), FaultBits::default());
        tb.insert(0x20000, 0x5000_0000, Granularity::Kb8, 0, false, full_access(), FaultBits::default());
        tb.invalidate_process_local();
        assert!(tb.lookup(0x10000, 0, false).is_some());
        assert!(tb.lookup(0x20000, 0, false).is_none());
    }

    #[test]
    fn superpage_bypasses_asn() {
        let virt = 0xFFFF_FC00_1234_5678;
        let pa = superpage_translate(0b001, ProcessorMode::Kernel, virt).unwrap();
        assert_eq!(pa, virt & 0x0000_01FF_FFFF_FFFF);
        assert!(superpage_translate(0b001, ProcessorMode::User, virt).is_none());
    }
}
