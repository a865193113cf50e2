//! CALL_PAL dispatch: legality check for the function code,
//! the entry-address formula, and the small set of "native" PALcode shims
//! that are implemented directly in Rust instead of by interpreting a
//! PALcode ROM image, grounded on `DO_CALL_PAL` and the `vmspal_call_*`
//! routines of a reference implementation's `cpu_misc.hpp` /
//! `AlphaCPU_vmspal.cpp`.
//!
//! Real PALcode is ordinary code loaded at `pal_base` and fetched/executed
//! like any other instruction stream; the shims below exist purely as a
//! fast path for the handful of calls simple enough to execute natively
//! when `pal_base == 0x8000` (the native-PALcode convention the architecture
//! uses), exactly mirroring the reference implementation's `pal_vms` fast
//! path. Any function code not recognized by a native shim still gets a
//! legal vector address computed and is left to execute from PALcode
//! memory.

use crate::cpu::exceptions::Exception;
use crate::cpu::registers::{InternalProcessorRegisters, ProcessorMode};

pub const NATIVE_PAL_BASE: u64 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PalCallKind {
    /// function < 0x40: privileged, kernel-mode only.
    Privileged,
    /// function in [0x80, 0xbf]: unprivileged, callable from any mode.
    Unprivileged,
    /// Anything else, or a privileged call issued outside kernel mode.
    Illegal,
}

pub fn classify(function: u32, mode: ProcessorMode) -> PalCallKind {
    if function < 0x40 {
        if mode == ProcessorMode::Kernel {
            PalCallKind::Privileged
        } else {
            PalCallKind::Illegal
        }
    } else if (0x80..=0xbf).contains(&function) {
        PalCallKind::Unprivileged
    } else {
        PalCallKind::Illegal
    }
}

/// Compute the PALcode entry address for a CALL_PAL of `function`:
/// `pal_base | (1 << 13) | ((function & 0x80) << 5) | ((function & 0x3F) << 6) | 1`,
/// matching a reference implementation's
/// `state.pal_base | (1 << 13) | ((function & 0x80) << 5) | ((function & 0x3f) << 6) | 1`.
/// The `(function & 0x80) << 5` term is what separates the privileged
/// (0x00-0x3F) and unprivileged (0x80-0xBF) dispatch regions; without it
/// function 0x00 and function 0x80 alias to the same vector.
pub fn call_pal_entry(pal_base: u64, function: u32) -> u64 {
    pal_base | (1 << 13) | (((function & 0x80) << 5) as u64) | (((function & 0x3F) << 6) as u64) | 1
}

pub fn dispatch(iprs: &InternalProcessorRegisters, function: u32) -> Result<u64, Exception> {
    match classify(function, iprs.current_mode) {
        PalCallKind::Illegal => Err(Exception::IllegalInstruction),
        _ => Ok(call_pal_entry(iprs.pal_base, function)),
    }
}

/// Outcome of a native PALcode shim: either it fully handled the call (no
/// PALcode vector entry needed), or it must fall through to the generic
/// vector-entry path.
pub enum ShimResult {
    Handled,
    FallThrough,
}

/// Native shims for the handful of PAL function codes simple enough to not
/// need a full PALcode ROM image, when running under `NATIVE_PAL_BASE`.
/// `r0` is the argument/return register value, `unique` is
/// the per-thread UNIQUE value RDUNIQUE/WRUNIQUE manipulate.
pub fn native_shim(
    function: u32,
    iprs: &mut InternalProcessorRegisters,
    r0: &mut u64,
    unique: &mut u64,
) -> ShimResult {
    if iprs.pal_base != NATIVE_PAL_BASE {
        return ShimResult::FallThrough;
    }
    match function {
        0x00 => ShimResult::FallThrough, // HALT: handled by the worker loop
        0x01 => ShimResult::Handled,     // CFLUSH: no cacheable PALcode state to flush natively
        0x02 => ShimResult::Handled,     // DRAINA: no in-flight aborts in an interpreter
        0x09 => ShimResult::Handled,     // CSERVE: console service, no-op without a console
        0x86 => ShimResult::Handled,     // IMB: instruction-stream memory barrier, no-op (no pipeline)
        0x9E => {
            *r0 = *unique;
            ShimResult::Handled
        } // RDUNIQUE
        0x9F => {
            *unique = *r0;
            ShimResult::Handled
        } // WRUNIQUE
        _ => ShimResult::FallThrough,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_call_from_user_mode_is_illegal() {
        assert_eq!(classify(0x05, ProcessorMode::User), PalCallKind::Illegal);
        assert_eq!(classify(0x05, ProcessorMode::Kernel), PalCallKind::Privileged);
    }

    #[test]
    fn unprivileged_range_is_callable_from_any_mode() {
        assert_eq!(classify(0x83, ProcessorMode::User), PalCallKind::Unprivileged);
    }

    #[test]
    fn gap_between_ranges_is_illegal() {
        assert_eq!(classify(0x50, ProcessorMode::Kernel), PalCallKind::Illegal);
    }

    #[test]
    fn rdunique_wrunique_round_trip() {
        let mut iprs = InternalProcessorRegisters { pal_base: NATIVE_PAL_BASE, ..Default::default() };
        let mut unique = 0x1234u64;
        let mut r0 = 0u64;
        native_shim(0x9E, &mut iprs, &mut r0, &mut unique);
        assert_eq!(r0, 0x1234);
        r0 = 0xBEEF;
        native_shim(0x9F, &mut iprs, &mut r0, &mut unique);
        assert_eq!(unique, 0xBEEF);
    }
}
