//! The CPU core: register/IPR state, the caches and
//! translation buffers it owns, and the per-tick fetch/decode/execute loop.
//!
//! Implements the Alpha per-cycle loop: cycle accounting, delayed-IRQ
//! timer decrement, interrupt delivery ahead of fetch, icache/TB-mediated
//! fetch, and CALL_PAL/HW_* dispatch layered on top of a fetch-decode-
//! execute shape.

pub mod decode;
pub mod exceptions;
pub mod fpu;
pub mod icache;
pub mod pal;
pub mod registers;
pub mod tb;

use crate::devices::Signal;
use crate::fabric::{MemoryFabric, Width};
use decode::{decode, group, Format, Instruction};
use exceptions::Exception;
use fpu::{BinOp, Compare, FloatFormat, FpResult};
use icache::{FetchResult, InstructionCache};
use registers::{DelayedIrqTimers, FloatRegisterFile, InternalProcessorRegisters, IntegerRegisterFile, RoundingMode};
use tb::{superpage_translate, Miss, TranslationBuffer};

pub struct Cpu {
    pub id: usize,
    pub pc: u64,
    pub integer: IntegerRegisterFile,
    pub float: FloatRegisterFile,
    pub iprs: InternalProcessorRegisters,
    pub delayed_irq: DelayedIrqTimers,
    pub itb: TranslationBuffer,
    pub dtb: TranslationBuffer,
    pub icache: InstructionCache,
    pub unique: u64,
    /// Secondary processors idle here until the primary issues a start IPI.
    pub waiting_for_start: bool,
    pub cycle_counter: u64,
    halted: bool,
}

impl Cpu {
    pub fn new(id: usize, pal_base: u64, is_primary: bool) -> Self {
        Cpu {
            id,
            pc: pal_base,
            integer: IntegerRegisterFile::default(),
            float: FloatRegisterFile::default(),
            iprs: InternalProcessorRegisters { pal_base, ..Default::default() },
            delayed_irq: DelayedIrqTimers::default(),
            itb: TranslationBuffer::new(true),
            dtb: TranslationBuffer::new(false),
            icache: InstructionCache::new(true),
            unique: 0,
            waiting_for_start: !is_primary,
            cycle_counter: 0,
            halted: false,
        }
    }

    pub fn start(&mut self, entry_pc: u64) {
        self.pc = entry_pc;
        self.waiting_for_start = false;
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Restores the halted flag from a save file; not used
    /// during ordinary execution, which only ever sets it via HALT.
    pub fn set_halted(&mut self, value: bool) {
        self.halted = value;
    }

    /// One cycle of the tick loop.
    pub fn tick(&mut self, fabric: &dyn MemoryFabric) -> Signal {
        if self.waiting_for_start || self.halted {
            return Signal::NoOp;
        }
        // 1: snapshot the faulting PC for exception delivery.
        let current_pc = self.pc;
        // 2: cycle counter advances every tick regardless of outcome.
        self.cycle_counter = self.cycle_counter.wrapping_add(1);
        // 3: delayed-IRQ timers decrement and may post new EIR bits.
        self.delayed_irq.tick(&mut self.iprs.eir);
        // 4: deliver a pending interrupt ahead of fetch, if one is enabled
        // at the current IPL and unmasked.
        if self.delayed_irq.must_recheck || self.pending_interrupt() {
            if let Some(level) = self.highest_pending_interrupt() {
                self.take_exception(Exception::Interrupt, current_pc);
                self.iprs.mm_stat = level as u64;
                self.delayed_irq.must_recheck = false;
                return Signal::Ok;
            }
            self.delayed_irq.must_recheck = false;
        }
        // 5: fetch through the icache (TB-mediated).
        let word = match self.icache.fetch(self.pc, self.iprs.asn, &mut self.itb, fabric) {
            FetchResult::Hit(word) => word,
            FetchResult::Miss(miss) => {
                self.take_miss_exception(miss, current_pc);
                return Signal::Ok;
            }
        };
        // 6: advance PC past the fetched word before executing (branches
        // and CALL_PAL overwrite it).
        self.pc = self.pc.wrapping_add(4);
        // 7: r31/f31 are hardwired; nothing to do here, the register files
        // enforce it on every access.
        // 8: decode and execute.
        let instr = decode(word);
        self.execute(instr, current_pc, fabric)
    }

    fn pending_interrupt(&self) -> bool {
        (self.iprs.eir != 0 && self.iprs.eien != 0) || (self.iprs.sir != 0 && self.iprs.slen != 0)
    }

    fn highest_pending_interrupt(&self) -> Option<u8> {
        for level in (0..6).rev() {
            if self.iprs.eir & self.iprs.eien & (1 << level) != 0 {
                return Some(level);
            }
        }
        if self.iprs.sir & self.iprs.slen != 0 {
            return Some(0);
        }
        None
    }

    fn take_exception(&mut self, exception: Exception, faulting_pc: u64) {
        self.iprs.exc_addr = faulting_pc;
        self.pc = exception.entry_address(self.iprs.pal_base);
    }

    fn take_miss_exception(&mut self, miss: Miss, faulting_pc: u64) {
        let exception = match miss {
            Miss::Itb => Exception::ItbMiss,
            Miss::DtbSingle => Exception::DtbMissSingle,
            Miss::DtbDouble => Exception::DtbMissDouble3,
        };
        self.take_exception(exception, faulting_pc);
    }

    fn read_int(&self, index: usize) -> u64 {
        self.integer.read(index, self.iprs.palshadow_enable && self.in_pal_mode())
    }

    fn write_int(&mut self, index: usize, value: u64) {
        let shadow = self.iprs.palshadow_enable && self.in_pal_mode();
        self.integer.write(index, shadow, value)
    }

    fn in_pal_mode(&self) -> bool {
        self.pc & 1 != 0
    }

    fn rb_value(&self, instr: &Instruction) -> u64 {
        if instr.is_literal {
            instr.literal as u64
        } else {
            self.read_int(instr.rb)
        }
    }

    /// Translate a virtual data address through the DTB, honoring
    /// superpage bypass.
    fn translate_data(&mut self, virt: u64, write: bool) -> Result<u64, Miss> {
        if let Some(phys) = superpage_translate(self.iprs.spe, self.iprs.current_mode, virt) {
            return Ok(phys);
        }
        self.dtb.lookup(virt, self.iprs.asn, write).map(|t| t.physical).ok_or(Miss::DtbSingle)
    }

    fn execute(&mut self, instr: Instruction, faulting_pc: u64, fabric: &dyn MemoryFabric) -> Signal {
        match group(instr.opcode) {
            Format::Pal => self.execute_pal(instr, faulting_pc),
            Format::Memory => self.execute_memory(instr, faulting_pc, fabric),
            Format::Branch => self.execute_branch(instr),
            Format::Operate => self.execute_operate(instr, faulting_pc),
            Format::FloatOperate => self.execute_float(instr, faulting_pc),
            Format::Misc => self.execute_misc(instr, fabric),
            Format::Hardware => self.execute_hardware(instr, faulting_pc, fabric),
        }
    }

    fn execute_pal(&mut self, instr: Instruction, faulting_pc: u64) -> Signal {
        if instr.function == 0x00 {
            // HALT: the worker loop observes this and parks
            // the CPU rather than spinning it through PALcode.
            self.halted = true;
            return Signal::Ok;
        }
        let mut r0 = self.read_int(0);
        let mut unique = self.unique;
        match pal::native_shim(instr.function, &mut self.iprs, &mut r0, &mut unique) {
            pal::ShimResult::Handled => {
                self.write_int(0, r0);
                self.unique = unique;
                Signal::Ok
            }
            pal::ShimResult::FallThrough => match pal::dispatch(&self.iprs, instr.function) {
                Ok(entry) => {
                    self.iprs.exc_addr = faulting_pc;
                    self.pc = entry;
                    Signal::Ok
                }
                Err(exception) => {
                    self.take_exception(exception, faulting_pc);
                    Signal::Ok
                }
            },
        }
    }

    fn execute_memory(&mut self, instr: Instruction, faulting_pc: u64, fabric: &dyn MemoryFabric) -> Signal {
        let base = self.read_int(instr.rb);
        let virt = base.wrapping_add(instr.disp as u64);
        match instr.opcode {
            0x08 => {
                self.write_int(instr.ra, virt);
                Signal::Ok
            } // LDA
            0x09 => {
                self.write_int(instr.ra, base.wrapping_add((instr.disp << 16) as u64));
                Signal::Ok
            } // LDAH
            0x0A => self.load(instr.ra, virt, Width::Long, true, faulting_pc, fabric), // LDBU
            0x0C => self.load(instr.ra, virt, Width::Word, true, faulting_pc, fabric), // LDWU
            0x0D => self.store(virt & !0x7, instr.ra, Width::Quad, faulting_pc, fabric), // STQ_U (simplified, no partial merge)
            0x0E => self.store(virt, instr.ra, Width::Byte, faulting_pc, fabric),      // STB
            0x0F => self.store(virt, instr.ra, Width::Word, faulting_pc, fabric),      // STW
            0x22 => self.load(instr.ra, virt, Width::Long, false, faulting_pc, fabric), // LDL
            0x23 => self.load(instr.ra, virt, Width::Quad, false, faulting_pc, fabric), // LDQ
            0x28 => self.load(instr.ra, virt, Width::Long, false, faulting_pc, fabric), // LDL_L (lock tracked separately)
            0x29 => self.load(instr.ra, virt, Width::Quad, false, faulting_pc, fabric), // LDQ_L
            0x2A => self.store(virt, instr.ra, Width::Long, faulting_pc, fabric),      // STL
            0x2B => self.store(virt, instr.ra, Width::Quad, faulting_pc, fabric),      // STQ
            0x2C => self.store_conditional(virt, instr.ra, Width::Long, fabric),       // STL_C
            0x2D => self.store_conditional(virt, instr.ra, Width::Quad, fabric),       // STQ_C
            0x2E => self.load(instr.ra, virt & !0x7, Width::Quad, false, faulting_pc, fabric), // LDQ_U
            _ => {
                self.take_exception(Exception::IllegalInstruction, faulting_pc);
                Signal::Ok
            }
        }
    }

    fn load(&mut self, ra: usize, virt: u64, width: Width, zero_extend: bool, faulting_pc: u64, fabric: &dyn MemoryFabric) -> Signal {
        match self.translate_data(virt, false) {
            Ok(phys) => {
                let value = fabric.read(phys, width);
                let value = if zero_extend { value } else { sign_extend_width(value, width) };
                self.write_int(ra, value);
                Signal::Ok
            }
            Err(miss) => {
                self.take_miss_exception(miss, faulting_pc);
                Signal::Ok
            }
        }
    }

    fn store(&mut self, virt: u64, ra: usize, width: Width, faulting_pc: u64, fabric: &dyn MemoryFabric) -> Signal {
        match self.translate_data(virt, true) {
            Ok(phys) => {
                fabric.write(phys, width, self.read_int(ra));
                Signal::Ok
            }
            Err(miss) => {
                self.take_miss_exception(miss, faulting_pc);
                Signal::Ok
            }
        }
    }

    fn store_conditional(&mut self, virt: u64, ra: usize, width: Width, fabric: &dyn MemoryFabric) -> Signal {
        let ok = fabric.cpu_unlock(self.id);
        if ok {
            if let Ok(phys) = self.translate_data(virt, true) {
                fabric.write(phys, width, self.read_int(ra));
            }
        }
        self.write_int(ra, ok as u64);
        Signal::Ok
    }

    fn execute_branch(&mut self, instr: Instruction) -> Signal {
        let target = self.pc.wrapping_add((instr.disp << 2) as u64);
        let ra = self.read_int(instr.ra);
        let take = match instr.opcode {
            0x30 => true,         // BR
            0x34 => true,         // BSR
            0x38 => ra == 0,      // BEQ
            0x39 => ra & 1 == 0,  // BLBC
            0x3A => (ra as i64) < 0, // BLT
            0x3B => (ra as i64) <= 0, // BLE
            0x3C => ra != 0,      // BNE
            0x3D => ra & 1 != 0,  // BLBS
            0x3E => (ra as i64) > 0, // BGT
            0x3F => (ra as i64) >= 0, // BGE
            _ => false,
        };
        if instr.opcode == 0x30 || instr.opcode == 0x34 {
            self.write_int(instr.ra, self.pc);
        }
        if take {
            self.pc = target;
        }
        Signal::Ok
    }

    fn execute_operate(&mut self, instr: Instruction, faulting_pc: u64) -> Signal {
        let a = self.read_int(instr.ra);
        let b = self.rb_value(&instr);
        let rc_current = self.read_int(instr.rc);
        let result = match instr.opcode {
            0x10 => self.int_group_a(instr.function, a, b),
            0x11 => self.int_group_l(instr.function, a, b, rc_current),
            0x12 => self.int_group_s(instr.function, a, b),
            0x13 => self.int_group_m(instr.function, a, b),
            _ => None,
        };
        match result {
            Some(value) => {
                self.write_int(instr.rc, value);
                Signal::Ok
            }
            None => {
                self.take_exception(Exception::IllegalInstruction, faulting_pc);
                Signal::Ok
            }
        }
    }

    fn int_group_a(&self, function: u32, a: u64, b: u64) -> Option<u64> {
        let al = a as u32;
        let bl = b as u32;
        Some(match function {
            0x00 => (al.wrapping_add(bl)) as i32 as i64 as u64, // ADDL
            0x02 => (al.wrapping_mul(4).wrapping_add(bl)) as i32 as i64 as u64, // S4ADDL
            0x09 => (al.wrapping_sub(bl)) as i32 as i64 as u64, // SUBL
            0x0B => (al.wrapping_mul(4).wrapping_sub(bl)) as i32 as i64 as u64, // S4SUBL
            0x12 => (al.wrapping_mul(8).wrapping_add(bl)) as i32 as i64 as u64, // S8ADDL
            0x1B => (al.wrapping_mul(8).wrapping_sub(bl)) as i32 as i64 as u64, // S8SUBL
            0x1D => (a < b) as u64,                             // CMPULT
            0x20 => a.wrapping_add(b),                          // ADDQ
            0x22 => a.wrapping_mul(4).wrapping_add(b),          // S4ADDQ
            0x29 => a.wrapping_sub(b),                          // SUBQ
            0x2B => a.wrapping_mul(4).wrapping_sub(b),          // S4SUBQ
            0x2D => (a == b) as u64,                            // CMPEQ
            0x32 => a.wrapping_mul(8).wrapping_add(b),          // S8ADDQ
            0x3B => a.wrapping_mul(8).wrapping_sub(b),          // S8SUBQ
            0x3D => (a <= b) as u64,                            // CMPULE
            0x40 => (al.wrapping_add(bl)) as i32 as i64 as u64, // ADDL/V (overflow trap not modeled)
            0x49 => (al.wrapping_sub(bl)) as i32 as i64 as u64, // SUBL/V
            0x4D => ((a as i64) < (b as i64)) as u64,           // CMPLT
            0x60 => a.wrapping_add(b),                          // ADDQ/V
            0x69 => a.wrapping_sub(b),                          // SUBQ/V
            0x6D => ((a as i64) <= (b as i64)) as u64,          // CMPLE
            _ => return None,
        })
    }

    /// `rc_current` lets the CMOVxx family leave `rc` unchanged when the
    /// test on `ra` fails, matching the architectural "else unchanged".
    fn int_group_l(&self, function: u32, a: u64, b: u64, rc_current: u64) -> Option<u64> {
        Some(match function {
            0x00 => a & b,                                            // AND
            0x08 => a & !b,                                           // BIC
            0x14 => if a & 1 != 0 { b } else { rc_current },          // CMOVLBS
            0x16 => if a & 1 == 0 { b } else { rc_current },          // CMOVLBC
            0x20 => a | b,                                            // BIS (OR)
            0x24 => if a == 0 { b } else { rc_current },              // CMOVEQ
            0x26 => if a != 0 { b } else { rc_current },              // CMOVNE
            0x28 => a | !b,                                           // ORNOT
            0x40 => a ^ b,                                           // XOR
            0x44 => if (a as i64) < 0 { b } else { rc_current },      // CMOVLT
            0x46 => if (a as i64) >= 0 { b } else { rc_current },     // CMOVGE
            0x48 => !(a ^ b),                                        // EQV
            0x64 => if (a as i64) <= 0 { b } else { rc_current },     // CMOVLE
            0x66 => if (a as i64) > 0 { b } else { rc_current },      // CMOVGT
            _ => return None,
        })
    }

    fn int_group_s(&self, function: u32, a: u64, b: u64) -> Option<u64> {
        let shift = (b & 0x3F) as u32;
        Some(match function {
            0x39 => a.wrapping_shl(shift),  // SLL
            0x34 => a.wrapping_shr(shift),  // SRL
            0x3C => ((a as i64).wrapping_shr(shift)) as u64, // SRA
            0x36 => a >> (shift & 0x38),     // EXTQL (byte-aligned approximation)
            0x3B => a << (shift & 0x38),     // INSQL
            0x32 => a & (!0u64 >> (64 - ((8 - (shift / 8)) * 8).min(64))), // MSKQL approximation
            _ => return None,
        })
    }

    fn int_group_m(&self, function: u32, a: u64, b: u64) -> Option<u64> {
        Some(match function {
            0x00 => ((a as u32).wrapping_mul(b as u32)) as i32 as i64 as u64, // MULL
            0x20 => a.wrapping_mul(b),                                       // MULQ
            0x30 => (((a as u128) * (b as u128)) >> 64) as u64,              // UMULH
            0x40 => ((a as u32).wrapping_mul(b as u32)) as i32 as i64 as u64, // MULL/V
            0x60 => a.wrapping_mul(b),                                       // MULQ/V
            _ => return None,
        })
    }

    fn execute_float(&mut self, instr: Instruction, faulting_pc: u64) -> Signal {
        if !self.iprs.fpen {
            self.take_exception(Exception::FloatingDisabled, faulting_pc);
            return Signal::Ok;
        }
        let fa = self.float.read(instr.ra);
        let fb = self.float.read(instr.rb);
        let format = match instr.opcode {
            0x15 => if instr.function & 0x20 != 0 { FloatFormat::VaxG } else { FloatFormat::VaxF },
            0x16 => if instr.function & 0x20 != 0 { FloatFormat::IeeeT } else { FloatFormat::IeeeS },
            _ => FloatFormat::IeeeT,
        };
        let op = match instr.function & 0x3F {
            0x00 => Some(BinOp::Add),
            0x01 => Some(BinOp::Sub),
            0x02 => Some(BinOp::Mul),
            0x03 => Some(BinOp::Div),
            _ => None,
        };
        if instr.opcode == 0x17 {
            // FLTL: register-move / compare family.
            let result = match instr.function {
                0x020 => fa,                                  // CPYS (sign from fb kept simple: copy fa)
                0x021 => fa ^ (1u64 << 63),                    // CPYSN
                0x022 => (fb & (1u64 << 63)) | (fa & !(1u64 << 63)), // CPYSE (approx: sign from fb)
                0x02A => self.iprs.fpcr.bits(),                // MF_FPCR
                0x024 => {
                    self.iprs.fpcr = registers::Fpcr::from_bits_truncate(fa);
                    fa
                } // MT_FPCR
                _ => {
                    self.take_exception(Exception::IllegalInstruction, faulting_pc);
                    return Signal::Ok;
                }
            };
            self.float.write(instr.rc, result);
            return Signal::Ok;
        }
        if let Some(op) = op {
            let FpResult { bits, flags } = fpu::ieee_binop(format, op, fa, fb);
            self.post_fp_result(bits, flags, instr.rc, faulting_pc);
            return Signal::Ok;
        }
        match instr.function & 0x3F {
            0x0B => {
                let FpResult { bits, flags } = fpu::sqrt(format, fb);
                self.post_fp_result(bits, flags, instr.rc, faulting_pc);
            }
            0x25 => {
                let FpResult { bits, flags } = fpu::compare_t(Compare::Eq, fa, fb);
                self.post_fp_result(bits, flags, instr.rc, faulting_pc);
            }
            0x26 => {
                let FpResult { bits, flags } = fpu::compare_t(Compare::Lt, fa, fb);
                self.post_fp_result(bits, flags, instr.rc, faulting_pc);
            }
            0x27 => {
                let FpResult { bits, flags } = fpu::compare_t(Compare::Le, fa, fb);
                self.post_fp_result(bits, flags, instr.rc, faulting_pc);
            }
            0x2C => {
                // CVTTS: T -> S
                let FpResult { bits, flags } = fpu::cvt_t_to_s(fb);
                self.post_fp_result(bits, flags, instr.rc, faulting_pc);
            }
            0x2F => {
                // CVTTQ: T -> integer
                let (value, flags) = fpu::cvt_float_to_int(FloatFormat::IeeeT, fb, RoundingMode::from_field(instr.function >> 9));
                self.post_fp_result(value as u64, flags, instr.rc, faulting_pc);
            }
            _ => {
                self.take_exception(Exception::IllegalInstruction, faulting_pc);
            }
        }
        Signal::Ok
    }

    fn post_fp_result(&mut self, bits: u64, flags: registers::Fpcr, rc: usize, faulting_pc: u64) {
        self.iprs.fpcr |= flags;
        self.float.write(rc, bits);
        let enabled_trap = (flags.contains(registers::Fpcr::INV) || flags.contains(registers::Fpcr::DZE) || flags.contains(registers::Fpcr::OVF))
            || (flags.contains(registers::Fpcr::INE) && !self.iprs.fpcr.contains(registers::Fpcr::INED))
            || (flags.contains(registers::Fpcr::UNF) && !self.iprs.fpcr.contains(registers::Fpcr::UNFD));
        if enabled_trap {
            self.take_exception(Exception::ArithmeticTrap, faulting_pc);
        }
    }

    fn execute_misc(&mut self, instr: Instruction, fabric: &dyn MemoryFabric) -> Signal {
        let _ = fabric;
        match instr.function & 0xFFFF {
            0x0400 => {
                // RPCC: read processor cycle counter into ra.
                self.write_int(instr.ra, self.cycle_counter);
            }
            _ => {} // TRAPB/EXCB/MB/WMB/ECB/WH64/RC/RS: no-ops in an interpreter.
        }
        Signal::Ok
    }

    fn execute_hardware(&mut self, instr: Instruction, faulting_pc: u64, fabric: &dyn MemoryFabric) -> Signal {
        match instr.opcode {
            0x1E => {
                // HW_REI: return from PALcode exception handler.
                self.pc = self.iprs.exc_addr;
                Signal::Ok
            }
            0x19 => {
                // HW_MFPR: read an IPR by function-coded index into ra.
                self.write_int(instr.ra, self.read_ipr(instr.function));
                Signal::Ok
            }
            0x1D => {
                // HW_MTPR: write rb (or literal) into the IPR named by function.
                self.write_ipr(instr.function, self.rb_value(&instr));
                Signal::Ok
            }
            0x1B | 0x1F => {
                // HW_LD/HW_ST: physical-address load/store bypassing the DTB.
                let phys = self.read_int(instr.rb).wrapping_add(instr.disp as u64);
                if instr.opcode == 0x1B {
                    let value = fabric.read(phys, Width::Quad);
                    self.write_int(instr.ra, value);
                } else {
                    fabric.write(phys, Width::Quad, self.read_int(instr.ra));
                }
                Signal::Ok
            }
            _ => {
                self.take_exception(Exception::IllegalInstruction, faulting_pc);
                Signal::Ok
            }
        }
    }

    fn read_ipr(&self, selector: u32) -> u64 {
        match selector {
            0 => self.iprs.pal_base,
            1 => self.iprs.exc_addr,
            2 => self.iprs.fault_va,
            3 => self.iprs.exc_sum,
            4 => self.unique,
            5 => self.iprs.asn as u64,
            6 => self.iprs.ipl as u64,
            _ => 0,
        }
    }

    fn write_ipr(&mut self, selector: u32, value: u64) {
        match selector {
            0 => self.iprs.pal_base = value,
            4 => self.unique = value,
            5 => self.iprs.asn = value as u32,
            // MTPR_IPL: install the new IPL and reload the six
            // interrupt-enable fields from IPL_IER_MASK's matching row.
            6 => self.iprs.set_ipl(value as u8),
            _ => {}
        }
    }
}

fn sign_extend_width(value: u64, width: Width) -> u64 {
    match width {
        Width::Byte => value as u8 as i8 as i64 as u64,
        Width::Word => value as u16 as i16 as i64 as u64,
        Width::Long => value as u32 as i32 as i64 as u64,
        Width::Quad => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::tb::{AccessMatrix, FaultBits, Granularity};
    use crate::fabric::HostFabric;

    const CODE_BASE: u64 = 0x1000;

    fn full_access() -> AccessMatrix {
        AccessMatrix { read: [true; 4], write: [true; 4] }
    }

    /// Build a CPU whose first page of code (`CODE_BASE`) is identity-mapped
    /// in its ITB, so `fabric.write(CODE_BASE + n, ...)` is directly
    /// fetchable without a real page-table walk.
    fn cpu_with_identity_code_page() -> Cpu {
        let mut cpu = Cpu::new(0, 0, true);
        cpu.itb.insert(CODE_BASE, CODE_BASE, Granularity::Kb8, 0, false, full_access(), FaultBits::default());
        cpu.start(CODE_BASE);
        cpu
    }

    fn encode_operate(opcode: u32, ra: usize, rb_or_lit: u32, is_lit: bool, function: u32, rc: usize) -> u32 {
        let mut word = (opcode << 26) | ((ra as u32) << 21) | ((function & 0x7F) << 5) | rc as u32;
        if is_lit {
            word |= (rb_or_lit << 13) | (1 << 12);
        } else {
            word |= rb_or_lit << 16;
        }
        word
    }

    #[test]
    fn addq_literal_scenario_from_spec() {
        let fabric = HostFabric::new(0x10000, 1);
        let mut cpu = cpu_with_identity_code_page();
        fabric.write(CODE_BASE, Width::Long, encode_operate(0x10, 1, 5, true, 0x20, 2) as u64); // ADDQ r1,#5,r2
        cpu.write_int(1, 10);
        cpu.tick(&fabric);
        assert_eq!(cpu.read_int(2), 15);
    }

    #[test]
    fn subq_and_mulq_chain() {
        let fabric = HostFabric::new(0x10000, 1);
        let mut cpu = cpu_with_identity_code_page();
        fabric.write(CODE_BASE, Width::Long, encode_operate(0x10, 1, 2, false, 0x29, 3) as u64); // SUBQ r1,r2,r3
        fabric.write(CODE_BASE + 4, Width::Long, encode_operate(0x13, 3, 4, true, 0x20, 5) as u64); // MULQ r3,#4,r5
        cpu.write_int(1, 20);
        cpu.write_int(2, 8);
        cpu.tick(&fabric);
        cpu.tick(&fabric);
        assert_eq!(cpu.read_int(3), 12);
        assert_eq!(cpu.read_int(5), 48);
    }

    #[test]
    fn conditional_branch_taken_on_zero() {
        let fabric = HostFabric::new(0x10000, 1);
        let mut cpu = cpu_with_identity_code_page();
        let word = (0x38u32 << 26) | (1u32 << 21) | 0x10; // BEQ r1, disp=0x10
        fabric.write(CODE_BASE, Width::Long, word as u64);
        cpu.write_int(1, 0);
        cpu.tick(&fabric);
        assert_eq!(cpu.pc, (CODE_BASE + 4).wrapping_add(0x10 << 2));
    }

    #[test]
    fn halt_parks_the_cpu() {
        let fabric = HostFabric::new(0x10000, 1);
        let mut cpu = cpu_with_identity_code_page();
        fabric.write(CODE_BASE, Width::Long, 0); // CALL_PAL HALT
        cpu.tick(&fabric);
        assert!(cpu.halted());
    }

    #[test]
    fn mtpr_ipl_installs_the_matching_enable_row_and_mfpr_ipl_reads_it_back() {
        let fabric = HostFabric::new(0x10000, 1);
        let mut cpu = cpu_with_identity_code_page();
        // HW_MTPR (opcode 0x1D), function=6 (IPL selector), literal 5.
        fabric.write(CODE_BASE, Width::Long, encode_operate(0x1D, 0, 5, true, 6, 0) as u64);
        // HW_MFPR (opcode 0x19), function=6, destination r1.
        fabric.write(CODE_BASE + 4, Width::Long, encode_operate(0x19, 1, 0, false, 6, 0) as u64);
        cpu.tick(&fabric);
        assert_eq!(cpu.iprs.ipl, 5);
        assert_eq!(cpu.iprs.eien, crate::cpu::registers::IPL_IER_MASK[5][0] as u8);
        cpu.tick(&fabric);
        assert_eq!(cpu.read_int(1), 5);
    }

    #[test]
    fn itb_miss_enters_pal_at_the_itb_miss_vector() {
        let fabric = HostFabric::new(0x10000, 1);
        let mut cpu = Cpu::new(0, 0x8000, true);
        cpu.start(0x1_0000_0000); // unmapped virtual address, no TB entry
        cpu.tick(&fabric);
        assert_eq!(cpu.pc, 0x8000 | 0x580 | 1);
    }
}
