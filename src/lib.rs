//! Crate shape: one library (every component of the
//! emulator core) plus a thin binary that wires a `System` together from a
//! `MachineConfig`, drives it, and hosts the terminal debugger.
//!
//! Assembles "N CPUs, one host-RAM-backed fabric, one storage controller,
//! one PCI function" into a single handle: build the hardware graph, then
//! hand it to a run loop, scaled to a multi-processor machine.

pub mod config;
pub mod cpu;
pub mod debugger;
pub mod devices;
pub mod error;
pub mod fabric;
pub mod persistence;
pub mod storage;
pub mod worker;

use config::{DeviceConfig, MachineConfig};
use cpu::Cpu;
use devices::pci::PciConfigSpace;
use error::{EmulatorError, Result};
use fabric::{HostFabric, MemoryFabric, Width};
use storage::ata::AtaDrive;
use storage::atapi::AtapiDevice;
use storage::media::ImageFile;
use storage::scsi::ScsiTarget;
use storage::{Controller, DriveSlot};
use worker::{IrqLines, WorkerPool};

use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

/// The assembled machine: CPUs, the host-RAM-backed fabric, the storage
/// controller wired onto it, and the one PCI function
/// describes. Built once from a validated `MachineConfig` and then either
/// run headless (`run`) or stepped under the terminal debugger
/// (`run_under_debugger`).
pub struct System {
    pub fabric: Arc<HostFabric>,
    pub controller: Arc<Mutex<Controller>>,
    pub pci_ide: Mutex<PciConfigSpace>,
    pub irq_lines: Arc<IrqLines>,
    pub config: MachineConfig,
    cpus: Vec<Cpu>,
    workers: Option<WorkerPool>,
}

fn open_image(device: &DeviceConfig) -> Result<Box<dyn storage::media::MediaBackend>> {
    let file = OpenOptions::new().read(true).write(!device.read_only).open(&device.image_path)?;
    let size = file.metadata()?.len();
    let block_size = if device.atapi { 2048 } else { 512 };
    Ok(Box::new(ImageFile::new(file, size, block_size, device.read_only, device.atapi)))
}

fn build_drive(device: &DeviceConfig) -> Result<DriveSlot> {
    let media = open_image(device)?;
    if device.atapi {
        Ok(DriveSlot::Atapi(AtapiDevice::new(ScsiTarget::new(media))))
    } else {
        Ok(DriveSlot::Ata(AtaDrive::new(media)))
    }
}

impl System {
    pub fn new(config: MachineConfig) -> Result<Self> {
        config.validate()?;
        let fabric = Arc::new(HostFabric::new(config.ram_bytes, config.cpu_count));

        let rom = std::fs::read(&config.rom_path)?;
        for (i, byte) in rom.iter().enumerate() {
            fabric.write(config.pal_base + i as u64, Width::Byte, *byte as u64);
        }
        log::info!("loaded {} bytes of PAL/SRM ROM at {:#x}", rom.len(), config.pal_base);

        let mut controller = Controller::default();
        for (index, channel_config) in config.channels.iter().enumerate() {
            if let Some(device) = &channel_config.master {
                controller.channels[index].drives[0] = build_drive(device)?;
            }
            if let Some(device) = &channel_config.slave {
                controller.channels[index].drives[1] = build_drive(device)?;
            }
        }
        let controller = Arc::new(Mutex::new(controller));
        Controller::attach_to_fabric(controller.clone(), &fabric);

        let cpus = (0..config.cpu_count).map(|id| Cpu::new(id, config.pal_base, id == 0)).collect();
        let irq_lines = Arc::new(IrqLines::new(config.cpu_count));

        Ok(System {
            fabric,
            controller,
            pci_ide: Mutex::new(PciConfigSpace::new_ide_function()),
            irq_lines,
            config,
            cpus,
            workers: None,
        })
    }

    /// Releases the primary CPU from its reset/wait-for-start state at
    /// `entry_pc`; secondary
    /// CPUs stay parked until PALcode issues the corresponding start IPI.
    pub fn boot(&mut self, entry_pc: u64) {
        if let Some(primary) = self.cpus.get_mut(0) {
            primary.start(entry_pc);
        }
    }

    /// Spawns one worker thread per CPU and returns
    /// immediately; call `shutdown` to stop them cooperatively.
    pub fn run(&mut self) {
        let cpus = std::mem::take(&mut self.cpus);
        let pool = WorkerPool::spawn(cpus, self.fabric.clone(), self.irq_lines.clone(), self.config.clock_hz, 10_000);
        self.workers = Some(pool);
    }

    /// Single-steps CPU 0 inline, handing control to `driver` after every
    /// tick. Only meaningful for single-CPU configurations: secondary CPUs
    /// never leave their parked worker-pool state while the debugger owns
    /// CPU 0.
    pub fn run_under_debugger(&mut self, mut driver: impl FnMut(&mut Cpu, &HostFabric) -> devices::Signal) {
        let cpu = match self.cpus.get_mut(0) {
            Some(cpu) => cpu,
            None => return,
        };
        loop {
            match driver(cpu, self.fabric.as_ref()) {
                devices::Signal::Quit => break,
                _ => {}
            }
        }
    }

    /// True if any running worker's top-level catch flagged it dead.
    /// False (not an error) when no worker pool is currently running.
    pub fn any_worker_died(&self) -> bool {
        self.workers.as_ref().map(WorkerPool::any_worker_died).unwrap_or(false)
    }

    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(pool) = self.workers.take() {
            let died = pool.any_worker_died();
            pool.shutdown();
            if died {
                return Err(EmulatorError::WorkerDied("cpu"));
            }
        }
        Ok(())
    }

    /// Save-file write: CPU contexts, controller state, the
    /// PCI function, then each disk's framed section, in that order.
    pub fn save(&self, w: &mut impl std::io::Write) -> Result<()> {
        persistence::save_cpus(w, &self.cpus)?;
        let controller = self.controller.lock().unwrap();
        persistence::save_controller(w, &controller)?;
        let pci = self.pci_ide.lock().unwrap();
        persistence::save_pci(w, std::slice::from_ref(&*pci))?;
        persistence::save_disks(w, &controller)?;
        Ok(())
    }

    pub fn restore(&mut self, r: &mut impl std::io::Read) -> Result<()> {
        persistence::restore_cpus(r, &mut self.cpus)?;
        let mut controller = self.controller.lock().unwrap();
        persistence::restore_controller(r, &mut controller)?;
        let mut pci = self.pci_ide.lock().unwrap();
        let mut functions = [PciConfigSpace::new_ide_function()];
        persistence::restore_pci(r, &mut functions)?;
        *pci = functions.into_iter().next().unwrap();
        let disk_count = controller.channels.iter().map(|c| c.drives.len()).sum();
        persistence::skip_disks(r, disk_count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_minimal_rom(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("rom.bin");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&[0u8; 16]).unwrap();
        path
    }

    #[test]
    fn system_boots_and_runs_headless_briefly() {
        let dir = std::env::temp_dir().join(format!("ev68core-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let rom_path = write_minimal_rom(&dir);
        let config = MachineConfig::from_toml_str(&format!(
            "ram_bytes = 65536\nrom_path = \"{}\"\n",
            rom_path.display()
        ))
        .unwrap();
        let mut system = System::new(config).unwrap();
        system.boot(0x8000_0000);
        system.run();
        std::thread::sleep(std::time::Duration::from_millis(2));
        system.shutdown().unwrap();
    }
}
