//! Concurrency/resource model: one OS thread per CPU context,
//! an atomic external-IRQ line word per CPU that I/O code asserts into and
//! the owning worker drains every tick, and cooperative shutdown via a
//! stop flag plus a join of every spawned thread.
//!
//! Each CPU context runs in one worker thread, driving `clock_cycle`/
//! interrupt service inline from its own loop rather than a single shared
//! run loop. The storage channel's "command sequencer" and "busmaster
//! engine" are *not* separate OS threads here: the MMIO path is effectively
//! called from the CPU worker's thread, not from a third party, since the
//! access is always initiated by an instruction the CPU worker is
//! executing. That is exactly `storage::Channel::accept_command`/
//! `run_dma_transfer`, invoked synchronously from the fabric `write()` call
//! the CPU worker's memory instruction already makes — so giving them
//! their own OS threads would add a rendezvous the architecture doesn't
//! call for. See DESIGN.md.

use crate::cpu::Cpu;
use crate::fabric::HostFabric;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

/// One atomic external-IRQ word per CPU.
pub struct IrqLines {
    lines: Vec<AtomicU8>,
}

impl IrqLines {
    pub fn new(cpu_count: usize) -> Self {
        IrqLines { lines: (0..cpu_count).map(|_| AtomicU8::new(0)).collect() }
    }

    pub fn assert(&self, cpu: usize, level: u8) {
        if let Some(line) = self.lines.get(cpu) {
            line.fetch_or(1 << level, Ordering::SeqCst);
        }
    }

    pub fn deassert(&self, cpu: usize, level: u8) {
        if let Some(line) = self.lines.get(cpu) {
            line.fetch_and(!(1 << level), Ordering::SeqCst);
        }
    }

    /// Drains every asserted line for `cpu`, returning the bits that were
    /// set. Called once per tick by that CPU's own worker.
    fn take(&self, cpu: usize) -> u8 {
        self.lines[cpu].swap(0, Ordering::SeqCst)
    }
}

/// Per-worker liveness, observed by the driver's health check.
struct WorkerHealth {
    dead: AtomicBool,
}

impl WorkerHealth {
    fn new() -> Self {
        WorkerHealth { dead: AtomicBool::new(false) }
    }
}

/// Drives every CPU's worker thread and the cooperative shutdown protocol.
pub struct WorkerPool {
    stop: Arc<AtomicBool>,
    health: Vec<Arc<WorkerHealth>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns one worker per CPU. `cpus[i]` ticks against `fabric`, draining
    /// `irq_lines` into its EIR every cycle before calling `Cpu::tick`
    ///. `calibration_period` is the
    /// number of ticks between wall-clock calibration samples.
    pub fn spawn(
        cpus: Vec<Cpu>,
        fabric: Arc<HostFabric>,
        irq_lines: Arc<IrqLines>,
        target_clock_hz: u64,
        calibration_period: u64,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let start_barrier = Arc::new(Barrier::new(cpus.len().max(1)));
        let mut health = Vec::with_capacity(cpus.len());
        let mut handles = Vec::with_capacity(cpus.len());

        for mut cpu in cpus {
            let fabric = fabric.clone();
            let irq_lines = irq_lines.clone();
            let stop = stop.clone();
            let barrier = start_barrier.clone();
            let worker_health = Arc::new(WorkerHealth::new());
            health.push(worker_health.clone());
            let handle = std::thread::Builder::new()
                .name(format!("cpu{}", cpu.id))
                .spawn(move || {
                    barrier.wait();
                    run_cpu_worker(&mut cpu, fabric.as_ref(), irq_lines.as_ref(), &stop, target_clock_hz, calibration_period, &worker_health);
                })
                .expect("failed to spawn CPU worker thread");
            handles.push(handle);
        }

        WorkerPool { stop, health, handles }
    }

    /// Cooperative shutdown: set the stop flag, then join
    /// every worker. CPU workers poll the flag once per tick, so this is
    /// bounded by one tick's worth of latency per worker, not a hang.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles {
            let _ = handle.join();
        }
    }

    /// True if any worker's top-level catch flagged it dead.
    pub fn any_worker_died(&self) -> bool {
        self.health.iter().any(|h| h.dead.load(Ordering::SeqCst))
    }
}

fn run_cpu_worker(
    cpu: &mut Cpu,
    fabric: &HostFabric,
    irq_lines: &IrqLines,
    stop: &AtomicBool,
    target_clock_hz: u64,
    calibration_period: u64,
    health: &WorkerHealth,
) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut calibration_start = std::time::Instant::now();
        let mut ticks_since_calibration: u64 = 0;
        while !stop.load(Ordering::Relaxed) {
            let external = irq_lines.take(cpu.id);
            if external != 0 {
                cpu.iprs.eir |= external;
                cpu.delayed_irq.must_recheck = true;
            }
            cpu.tick(fabric);
            ticks_since_calibration += 1;
            if ticks_since_calibration >= calibration_period.max(1) {
                let elapsed = calibration_start.elapsed();
                let wanted = std::time::Duration::from_secs_f64(ticks_since_calibration as f64 / target_clock_hz.max(1) as f64);
                if elapsed < wanted {
                    std::thread::sleep(wanted - elapsed);
                }
                calibration_start = std::time::Instant::now();
                ticks_since_calibration = 0;
            }
        }
    }));
    if result.is_err() {
        health.dead.store(true, Ordering::SeqCst);
        log::error!("cpu{} worker terminated on a caught panic", cpu.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpu;

    #[test]
    fn irq_lines_assert_and_drain() {
        let lines = IrqLines::new(2);
        lines.assert(0, 3);
        lines.assert(0, 1);
        assert_eq!(lines.take(0), 0b1010);
        assert_eq!(lines.take(0), 0);
        assert_eq!(lines.take(1), 0);
    }

    #[test]
    fn deassert_clears_only_the_named_level() {
        let lines = IrqLines::new(1);
        lines.assert(0, 2);
        lines.assert(0, 4);
        lines.deassert(0, 2);
        assert_eq!(lines.take(0), 1 << 4);
    }

    #[test]
    fn a_halted_cpu_worker_shuts_down_cleanly() {
        let fabric = Arc::new(HostFabric::new(0x1000, 1));
        let irq_lines = Arc::new(IrqLines::new(1));
        let mut cpu = Cpu::new(0, 0x8000_0000, true);
        cpu.start(0x8000_0000);
        let pool = WorkerPool::spawn(vec![cpu], fabric, irq_lines, 1_000_000, 10_000);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!pool.any_worker_died());
        pool.shutdown();
    }
}
