//! CPU context data model: program counter, integer and
//! floating register files (each with a PALshadow bank), the internal
//! processor registers (IPRs), the delayed-IRQ timers, and the
//! wait-for-start flag secondary processors idle on.
//!
//! Holds the Alpha's 32+32 (shadowed) integer and floating register files,
//! plus the much larger IPR set the architecture enumerates in place of a
//! single status word.

use bitflags::bitflags;

/// Register 31 (integer) and register 31 (floating) are hardwired to zero
/// on every read; that invariant is enforced at the accessor,
/// not by special-casing every instruction.
pub const ZERO_REGISTER: usize = 31;

#[derive(Debug, Clone, Default)]
pub struct IntegerRegisterFile {
    primary: [u64; 32],
    shadow: [u64; 32],
}

impl IntegerRegisterFile {
    pub fn read(&self, index: usize, use_shadow: bool) -> u64 {
        if index == ZERO_REGISTER {
            return 0;
        }
        if use_shadow && is_shadowed(index) {
            self.shadow[index]
        } else {
            self.primary[index]
        }
    }

    pub fn write(&mut self, index: usize, use_shadow: bool, value: u64) {
        if index == ZERO_REGISTER {
            return;
        }
        if use_shadow && is_shadowed(index) {
            self.shadow[index] = value;
        } else {
            self.primary[index] = value;
        }
    }

    /// Raw primary/shadow banks, for save-file framing.
    pub fn raw(&self) -> ([u64; 32], [u64; 32]) {
        (self.primary, self.shadow)
    }

    pub fn load_raw(&mut self, primary: [u64; 32], shadow: [u64; 32]) {
        self.primary = primary;
        self.shadow = shadow;
    }
}

/// Only r8..r14 and r25 have PALshadow counterparts on the 21264; the rest
/// of the "32 + 32" register budget is headroom for simplicity of
/// modeling (a flat shadow bank), but we gate shadow access to the
/// architectural set so PALshadow-enable behaves correctly.
fn is_shadowed(index: usize) -> bool {
    (8..=14).contains(&index) || index == 25
}

#[derive(Debug, Clone, Default)]
pub struct FloatRegisterFile {
    primary: [u64; 32],
}

impl FloatRegisterFile {
    pub fn read(&self, index: usize) -> u64 {
        if index == ZERO_REGISTER {
            0
        } else {
            self.primary[index]
        }
    }

    pub fn write(&mut self, index: usize, value: u64) {
        if index == ZERO_REGISTER {
            return;
        }
        self.primary[index] = value;
    }

    pub fn raw(&self) -> [u64; 32] {
        self.primary
    }

    pub fn load_raw(&mut self, primary: [u64; 32]) {
        self.primary = primary;
    }
}

bitflags! {
    /// Floating-point control register.
    /// Bit positions follow the architecture's summary/trap-enable layout
    /// (the `FPCR_SUM`/`FPCR_INED`/... macros of a reference implementation,
    /// reproduced here as named bits rather than copied preprocessor text).
    #[derive(Default)]
    pub struct Fpcr: u64 {
        /// Summary bit: set whenever any enabled-or-not exception below fires.
        const SUM  = 1 << 63;
        const INE  = 1 << 62; // inexact result occurred
        const UNF  = 1 << 61; // underflow occurred
        const OVF  = 1 << 60; // overflow occurred
        const DZE  = 1 << 59; // division by zero occurred
        const INV  = 1 << 58; // invalid operation occurred
        const IOV  = 1 << 57; // integer overflow occurred
        const INED = 1 << 56; // inexact trap disable
        const UNFD = 1 << 55; // underflow trap disable
        const UNDZ = 1 << 54; // underflow results flushed to zero
        const DNZ  = 1 << 53; // denormal operands flushed to zero
    }
}

/// Rounding modes selected by an instruction's `RND` field, or by FPCR when
/// the instruction specifies "dynamic".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    Chopped,
    Minus,
    Normal,
    Dynamic,
    Plus,
}

impl RoundingMode {
    pub fn from_field(field: u32) -> Self {
        match field & 0b11 {
            0b00 => RoundingMode::Chopped,
            0b01 => RoundingMode::Dynamic,
            0b10 => RoundingMode::Minus,
            0b11 => RoundingMode::Normal,
            _ => unreachable!(),
        }
    }
}

/// Processor mode, used to index the TB's per-mode access-permission matrix
/// and the IPR current-mode field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorMode {
    Kernel = 0,
    Executive = 1,
    Supervisor = 2,
    User = 3,
}

impl ProcessorMode {
    pub fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => ProcessorMode::Kernel,
            1 => ProcessorMode::Executive,
            2 => ProcessorMode::Supervisor,
            _ => ProcessorMode::User,
        }
    }
}

/// Internal processor registers. Field names follow the architecture's
/// IPR mnemonics as used by a reference implementation's `cpu_defs.hpp`
/// and `AlphaCPU.hpp`.
#[derive(Debug, Clone)]
pub struct InternalProcessorRegisters {
    pub pal_base: u64,
    pub exc_addr: u64,
    pub fault_va: u64,
    pub exc_sum: u64,
    pub mm_stat: u64,
    pub i_ctl: u64,
    pub dc_ctl: u64,
    pub va_ctl: u64,
    pub alt_cm: u64,
    pub fpcr: Fpcr,
    pub asn: u32,
    pub asn0: u32,
    pub asn1: u32,
    pub current_mode: ProcessorMode,
    /// Current interrupt priority level (0-31), as last installed by
    /// MTPR_IPL. Selects the row of `IPL_IER_MASK` that was loaded into
    /// the six enable fields below.
    pub ipl: u8,
    /// Per-level interrupt enables: external, software-low, correctable,
    /// performance-counter, serial, AST.
    pub eien: u8,
    pub slen: u8,
    pub cren: u8,
    pub pcen: u8,
    pub sien: u16,
    pub asten: u8,
    /// Pending interrupt request words: one bit per external IRQ line plus
    /// software interrupt request bits.
    pub eir: u8,
    pub sir: u8,
    /// AST request/enable nibbles, one bit per mode.
    pub astrr: u8,
    pub asten_nibble: u8,
    pub palshadow_enable: bool,
    /// Superpage-enable nibbles for I_CTL/M_CTL.
    pub spe: u8,
    pub fpen: bool,
    pub ppcen: bool,
}

impl Default for InternalProcessorRegisters {
    fn default() -> Self {
        let mut iprs = InternalProcessorRegisters {
            pal_base: 0,
            exc_addr: 0,
            fault_va: 0,
            exc_sum: 0,
            mm_stat: 0,
            i_ctl: 0,
            dc_ctl: 0,
            va_ctl: 0,
            alt_cm: 0,
            fpcr: Fpcr::empty(),
            asn: 0,
            asn0: 0,
            asn1: 0,
            current_mode: ProcessorMode::Kernel,
            ipl: 0,
            eien: 0,
            slen: 0,
            cren: 0,
            pcen: 0,
            sien: 0,
            asten: 0,
            eir: 0,
            sir: 0,
            astrr: 0,
            asten_nibble: 0,
            palshadow_enable: true,
            spe: 0,
            fpen: true,
            ppcen: false,
        };
        // Reset enters at IPL 31: everything masked except the single
        // highest-priority external line, matching a freshly reset CPU.
        iprs.set_ipl(31);
        iprs
    }
}

/// IPL (0-31) to six interrupt-enable masks {external, software-low,
/// correctable, perf-counter, serial, AST}, the table MTPR_IPL loads into
/// the IPR enable fields. Reproduced verbatim from a reference
/// implementation's `ipl_ier_mask[32][6]` ("table of IER masks in PALcode
/// at offset 0d00H").
#[rustfmt::skip]
pub const IPL_IER_MASK: [[u16; 6]; 32] = [
    [0x3f, 0, 1, 3, 0xfffe, 1], [0x3f, 0, 1, 3, 0xfffc, 1],
    [0x3f, 0, 1, 3, 0xfff8, 0], [0x3f, 0, 1, 3, 0xfff0, 0],
    [0x3f, 0, 1, 3, 0xffe0, 0], [0x3f, 0, 1, 3, 0xffc0, 0],
    [0x3f, 0, 1, 3, 0xff80, 0], [0x3f, 0, 1, 3, 0xff00, 0],
    [0x3f, 0, 1, 3, 0xfe00, 0], [0x3f, 0, 1, 3, 0xfc00, 0],
    [0x3f, 0, 1, 3, 0xf800, 0], [0x3f, 0, 1, 3, 0xf000, 0],
    [0x3f, 0, 1, 3, 0xe000, 0], [0x3f, 0, 1, 3, 0xc000, 0],
    [0x3f, 0, 1, 3, 0x8000, 0], [0x3f, 0, 1, 3, 0, 0],
    [0x3f, 0, 1, 3, 0, 0],      [0x3f, 0, 1, 3, 0, 0],
    [0x3f, 0, 1, 3, 0, 0],      [0x3f, 0, 1, 3, 0, 0],
    [0x3f, 0, 1, 3, 0, 0],      [0x3d, 0, 1, 3, 0, 0],
    [0x31, 0, 1, 3, 0, 0],      [0x31, 0, 1, 3, 0, 0],
    [0x31, 0, 1, 3, 0, 0],      [0x31, 0, 1, 3, 0, 0],
    [0x31, 0, 1, 3, 0, 0],      [0x31, 0, 1, 3, 0, 0],
    [0x31, 0, 1, 3, 0, 0],      [0x31, 0, 1, 0, 0, 0],
    [0x31, 0, 1, 3, 0, 0],      [0x10, 0, 1, 3, 0, 0],
];

impl InternalProcessorRegisters {
    /// Installs IPL `level` (masked to the 5-bit range) and reloads the
    /// six interrupt-enable fields from `IPL_IER_MASK`'s corresponding
    /// row, exactly as MTPR_IPL does.
    pub fn set_ipl(&mut self, level: u8) {
        let level = (level & 0x1f) as usize;
        self.ipl = level as u8;
        let row = IPL_IER_MASK[level];
        self.eien = row[0] as u8;
        self.slen = row[1] as u8;
        self.cren = row[2] as u8;
        self.pcen = row[3] as u8;
        self.sien = row[4];
        self.asten = row[5] as u8;
    }
}

/// The six delayed-IRQ timers (one per external IRQ line), plus the
/// "must recheck interrupts" flag the tick loop tests.
#[derive(Debug, Clone, Default)]
pub struct DelayedIrqTimers {
    pub remaining: [u32; 6],
    pub must_recheck: bool,
}

impl DelayedIrqTimers {
    /// Advance every non-zero timer by one tick; a timer reaching zero sets
    /// the corresponding external-interrupt-request bit and the recheck
    /// flag.
    pub fn tick(&mut self, eir: &mut u8) {
        for (line, remaining) in self.remaining.iter_mut().enumerate() {
            if *remaining > 0 {
                *remaining -= 1;
                if *remaining == 0 {
                    *eir |= 1 << line;
                    self.must_recheck = true;
                }
            }
        }
    }

    pub fn arm(&mut self, line: usize, delay: u32) {
        if line < self.remaining.len() {
            self.remaining[line] = delay;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_31_always_reads_zero() {
        let mut regs = IntegerRegisterFile::default();
        regs.write(31, false, 0xFFFF_FFFF_FFFF_FFFF);
        assert_eq!(regs.read(31, false), 0);
    }

    #[test]
    fn shadow_bank_is_only_used_for_shadowed_registers() {
        let mut regs = IntegerRegisterFile::default();
        regs.write(8, false, 1);
        regs.write(8, true, 2);
        assert_eq!(regs.read(8, false), 1);
        assert_eq!(regs.read(8, true), 2);
        // r1 has no shadow counterpart; both reads see the same slot.
        regs.write(1, false, 5);
        assert_eq!(regs.read(1, true), 5);
    }

    #[test]
    fn delayed_irq_timer_fires_once_and_sets_recheck() {
        let mut timers = DelayedIrqTimers::default();
        let mut eir = 0u8;
        timers.arm(2, 2);
        timers.tick(&mut eir);
        assert_eq!(eir, 0);
        assert!(!timers.must_recheck);
        timers.tick(&mut eir);
        assert_eq!(eir, 0b100);
        assert!(timers.must_recheck);
    }

    #[test]
    fn set_ipl_loads_the_matching_ipl_ier_mask_row() {
        let mut iprs = InternalProcessorRegisters::default();
        iprs.set_ipl(0);
        assert_eq!(iprs.ipl, 0);
        assert_eq!(iprs.eien, 0x3f);
        assert_eq!(iprs.sien, 0xfffe);
        assert_eq!(iprs.asten, 1);

        iprs.set_ipl(31);
        assert_eq!(iprs.ipl, 31);
        assert_eq!(iprs.eien, 0x10);
        assert_eq!(iprs.sien, 0);
        assert_eq!(iprs.asten, 0);
    }

    #[test]
    fn default_iprs_reset_at_ipl_31() {
        let iprs = InternalProcessorRegisters::default();
        assert_eq!(iprs.ipl, 31);
        assert_eq!(iprs.eien, 0x10);
    }
}
