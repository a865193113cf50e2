//! Legacy ATA/ATAPI storage controller: wires the
//! register file, command sequencer, packet state machine and busmaster DMA
//! engine together behind the six legacy I/O regions a real ALi M1543C
//! south-bridge exposes, and implements `devices::Device` so each region can
//! attach to the fabric at its fixed port base.
//!
//! Grounded on `AliM1543C_ide.hpp`/`.cpp`'s channel/drive/busmaster split
//! and on the `devices::Device` attachment convention defined in
//! `devices/mod.rs`.

pub mod ata;
pub mod atapi;
pub mod busmaster;
pub mod media;
pub mod registers;
pub mod scsi;

use crate::devices::Device;
use crate::fabric::{HostFabric, MemoryFabric, Width};
use ata::{AtaDrive, Outcome};
use atapi::AtapiDevice;
use registers::{BusmasterCommand, BusmasterRegisters, BusmasterStatus, ChannelRegisters, DeviceControl, Status};
use std::sync::{Arc, Mutex};

pub const PRIMARY_COMMAND_BASE: u64 = 0x1F0;
pub const PRIMARY_CONTROL_BASE: u64 = 0x3F6;
pub const SECONDARY_COMMAND_BASE: u64 = 0x170;
pub const SECONDARY_CONTROL_BASE: u64 = 0x376;
pub const PRIMARY_BUSMASTER_BASE: u64 = 0xF000;
pub const SECONDARY_BUSMASTER_BASE: u64 = 0xF008;

pub enum DriveSlot {
    Empty,
    Ata(AtaDrive),
    Atapi(AtapiDevice),
}

#[derive(Default)]
pub struct Channel {
    pub regs: ChannelRegisters,
    pub busmaster: BusmasterRegisters,
    pub drives: [DriveSlot; 2],
}

impl Default for DriveSlot {
    fn default() -> Self {
        DriveSlot::Empty
    }
}

fn identify_packet_device(regs: &mut ChannelRegisters) {
    let mut words = [0u16; 256];
    words[0] = 0x8580;
    let model = b"ALPHASYS VIRTUAL CD-ROM                ";
    for (i, chunk) in model.chunks(2).take(20).enumerate() {
        let hi = chunk[0] as u16;
        let lo = *chunk.get(1).unwrap_or(&b' ') as u16;
        words[27 + i] = (hi << 8) | lo;
    }
    let mut buf = vec![0u8; 512];
    for (i, word) in words.iter().enumerate() {
        buf[2 * i] = (*word & 0xFF) as u8;
        buf[2 * i + 1] = (*word >> 8) as u8;
    }
    regs.pio_buffer = buf;
    regs.pio_cursor = 0;
    let mut status = regs.selected().status_flags();
    status.remove(Status::BSY);
    status.insert(Status::DRQ | Status::DRDY);
    regs.selected_mut().set_status(status);
    regs.interrupt_pending = true;
}

impl Channel {
    /// Runs when the host writes the command register. DMA commands only latch their parameters
    /// here; the transfer itself runs off the busmaster command-register
    /// write.
    ///
    /// Indexes `self.drives` directly rather than going through a
    /// `&mut self` helper method, so the borrow checker sees `self.regs`
    /// and `self.drives[selected]` as the disjoint fields they are instead
    /// of one opaque `&mut self` borrow spanning the whole match.
    fn accept_command(&mut self, opcode: u8) {
        self.regs.start_command(opcode);
        let selected = self.regs.selected;
        let regs = &mut self.regs;
        let busmaster = &self.busmaster;
        match &mut self.drives[selected] {
            DriveSlot::Empty => {
                let mut status = regs.selected().status_flags();
                status.remove(Status::BSY);
                status.insert(Status::ERR);
                regs.selected_mut().set_status(status);
            }
            DriveSlot::Ata(drive) => match drive.execute(opcode, regs, busmaster) {
                Outcome::Done { .. } => {}
                Outcome::StartDma { .. } => {
                    let mut status = regs.selected().status_flags();
                    status.remove(Status::BSY);
                    status.insert(Status::DRQ | Status::DRDY);
                    regs.selected_mut().set_status(status);
                }
                Outcome::EnterPacket => {
                    // A non-ATAPI drive only sees CMD_PACKET if the guest
                    // mis-addressed it after a stale IDENTIFY; abort rather
                    // than pretend to be a packet device.
                    let mut status = regs.selected().status_flags();
                    status.remove(Status::BSY);
                    status.insert(Status::DRDY | Status::ERR);
                    regs.selected_mut().set_status(status);
                    regs.interrupt_pending = true;
                }
            },
            DriveSlot::Atapi(device) => match opcode {
                ata::CMD_PACKET => {
                    let dma_bit = regs.selected().features & 0x01 != 0;
                    device.begin_packet(regs, dma_bit);
                }
                ata::CMD_IDENTIFY_PACKET_DEVICE => identify_packet_device(regs),
                ata::CMD_DEVICE_RESET => {
                    let mut status = regs.selected().status_flags();
                    status.remove(Status::BSY);
                    status.insert(Status::DRDY);
                    regs.selected_mut().set_status(status);
                    regs.interrupt_pending = true;
                }
                _ => {
                    let mut status = regs.selected().status_flags();
                    status.remove(Status::BSY);
                    status.insert(Status::DRDY | Status::ERR);
                    regs.selected_mut().set_status(status);
                    regs.interrupt_pending = true;
                }
            },
        }
    }

    /// After every data-port access: when the PIO buffer drains, advance
    /// whichever state machine owns the transfer.
    fn maybe_complete_pio(&mut self) {
        if self.regs.pio_cursor < self.regs.pio_buffer.len() {
            return;
        }
        let current_command = self.regs.selected().current_command;
        let selected = self.regs.selected;
        let regs = &mut self.regs;
        match &mut self.drives[selected] {
            DriveSlot::Ata(drive) => {
                if current_command == ata::CMD_WRITE_SECTORS
                    || current_command == ata::CMD_WRITE_SECTORS_NORETRY
                    || current_command == ata::CMD_WRITE_MULTIPLE
                {
                    drive.commit_pio_write(regs);
                }
            }
            DriveSlot::Atapi(device) => {
                let _ = device.on_pio_drained(regs);
            }
            DriveSlot::Empty => {}
        }
    }

    /// Busmaster command-register write: walks the PRD chain
    /// against whichever drive has a pending DMA command, then posts the
    /// completion back into the busmaster status register and raises the
    /// channel interrupt.
    fn run_dma_transfer(&mut self, fabric: &dyn MemoryFabric) {
        let table_base = self.busmaster.prd_pointer;
        let device_to_host = self.busmaster.command.contains(BusmasterCommand::READ_FROM_DEVICE);
        let selected = self.regs.selected;
        let regs = &mut self.regs;
        let outcome = match &mut self.drives[selected] {
            DriveSlot::Ata(drive) => {
                let len = drive.dma_buffer_len();
                let mut buf = vec![0u8; len];
                let code = if device_to_host {
                    let lba = drive.dma_lba();
                    let block_size = drive.media.block_size() as u64;
                    if drive.media.seek_byte(lba * block_size).is_err() || drive.media.read_bytes(&mut buf).is_err() {
                        None
                    } else {
                        Some(busmaster::run_prd_chain(fabric, table_base, &mut buf, true))
                    }
                } else {
                    let code = busmaster::run_prd_chain(fabric, table_base, &mut buf, false);
                    let lba = drive.dma_lba();
                    let block_size = drive.media.block_size() as u64;
                    if drive.media.seek_byte(lba * block_size).is_ok() {
                        let _ = drive.media.write_bytes(&buf);
                    }
                    Some(code)
                };
                code.map(|code| {
                    drive.finish_dma(regs);
                    code
                })
            }
            DriveSlot::Atapi(device) => {
                let mut buf = std::mem::take(&mut regs.pio_buffer);
                let code = busmaster::run_prd_chain(fabric, table_base, &mut buf, true);
                device.finish_dma_transfer(regs);
                Some(code)
            }
            DriveSlot::Empty => None,
        };
        match outcome {
            Some(Ok(busmaster::CompletionCode::Exact)) => {
                self.busmaster.status.insert(BusmasterStatus::INTERRUPT);
                self.busmaster.status.remove(BusmasterStatus::ACTIVE | BusmasterStatus::ERROR);
            }
            Some(Ok(busmaster::CompletionCode::ChainShorter)) => {
                // Chain exhausted before the transfer finished: stop, but no IRQ.
                self.busmaster.status.remove(BusmasterStatus::ACTIVE | BusmasterStatus::ERROR);
            }
            Some(Ok(busmaster::CompletionCode::ChainLonger)) => {
                // Transfer finished before the chain did: raise IRQ, leave ACTIVE set.
                self.busmaster.status.insert(BusmasterStatus::INTERRUPT);
                self.busmaster.status.remove(BusmasterStatus::ERROR);
            }
            Some(Err(_)) => {
                self.busmaster.status.insert(BusmasterStatus::INTERRUPT | BusmasterStatus::ERROR);
                self.busmaster.status.remove(BusmasterStatus::ACTIVE);
            }
            None => {
                self.busmaster.status.remove(BusmasterStatus::ACTIVE);
            }
        }
        self.busmaster.command.remove(BusmasterCommand::START);
    }
}

/// The full controller: two channels, each carrying its own register file,
/// busmaster engine and up to two drives.
#[derive(Default)]
pub struct Controller {
    pub channels: [Channel; 2],
}

impl Controller {
    pub fn attach_to_fabric(controller: Arc<Mutex<Controller>>, fabric: &Arc<HostFabric>) {
        let as_memory_fabric: Arc<dyn MemoryFabric> = fabric.clone();
        fabric.attach(
            PRIMARY_COMMAND_BASE,
            PRIMARY_COMMAND_BASE + 7,
            Box::new(CommandBlockWindow { controller: controller.clone(), channel: 0 }),
        );
        fabric.attach(
            PRIMARY_CONTROL_BASE,
            PRIMARY_CONTROL_BASE + 1,
            Box::new(ControlBlockWindow { controller: controller.clone(), channel: 0 }),
        );
        fabric.attach(
            SECONDARY_COMMAND_BASE,
            SECONDARY_COMMAND_BASE + 7,
            Box::new(CommandBlockWindow { controller: controller.clone(), channel: 1 }),
        );
        fabric.attach(
            SECONDARY_CONTROL_BASE,
            SECONDARY_CONTROL_BASE + 1,
            Box::new(ControlBlockWindow { controller: controller.clone(), channel: 1 }),
        );
        fabric.attach(
            PRIMARY_BUSMASTER_BASE,
            PRIMARY_BUSMASTER_BASE + 7,
            Box::new(BusmasterWindow { controller: controller.clone(), channel: 0, fabric: as_memory_fabric.clone() }),
        );
        fabric.attach(
            SECONDARY_BUSMASTER_BASE,
            SECONDARY_BUSMASTER_BASE + 7,
            Box::new(BusmasterWindow { controller, channel: 1, fabric: as_memory_fabric }),
        );
    }
}

struct CommandBlockWindow {
    controller: Arc<Mutex<Controller>>,
    channel: usize,
}

impl Device for CommandBlockWindow {
    fn read(&mut self, address: u64, width: Width) -> u64 {
        let mut guard = self.controller.lock().unwrap();
        let channel = &mut guard.channels[self.channel];
        match address {
            0 => {
                let value = channel.regs.read_data_word();
                channel.maybe_complete_pio();
                match width {
                    Width::Byte => (value & 0xFF) as u64,
                    _ => value as u64,
                }
            }
            1 => channel.regs.selected().error as u64,
            2 => channel.regs.selected().sector_count as u64,
            3 => channel.regs.selected().sector_number as u64,
            4 => channel.regs.selected().cylinder_low as u64,
            5 => channel.regs.selected().cylinder_high as u64,
            6 => channel.regs.selected().drive_head as u64,
            7 => channel.regs.read_status_ack() as u64,
            _ => 0,
        }
    }

    fn write(&mut self, address: u64, width: Width, value: u64) {
        let mut guard = self.controller.lock().unwrap();
        let channel = &mut guard.channels[self.channel];
        match address {
            0 => {
                let word = if width == Width::Byte { value as u16 & 0xFF } else { value as u16 };
                channel.regs.write_data_word(word);
                channel.maybe_complete_pio();
            }
            1 => channel.regs.selected_mut().features = value as u8,
            2 => channel.regs.selected_mut().sector_count = value as u8,
            3 => channel.regs.selected_mut().sector_number = value as u8,
            4 => channel.regs.selected_mut().cylinder_low = value as u8,
            5 => channel.regs.selected_mut().cylinder_high = value as u8,
            6 => {
                let drive_head = value as u8;
                for dev in channel.regs.devices.iter_mut() {
                    dev.drive_head = (dev.drive_head & 0xF0) | (drive_head & 0x0F);
                }
                channel.regs.selected = ((drive_head >> 4) & 1) as usize;
                channel.regs.devices[channel.regs.selected].drive_head = drive_head;
            }
            7 => channel.accept_command(value as u8),
            _ => {}
        }
    }
}

struct ControlBlockWindow {
    controller: Arc<Mutex<Controller>>,
    channel: usize,
}

impl Device for ControlBlockWindow {
    fn read(&mut self, address: u64, _width: Width) -> u64 {
        let guard = self.controller.lock().unwrap();
        let channel = &guard.channels[self.channel];
        if address == 0 {
            channel.regs.read_alt_status() as u64
        } else {
            0
        }
    }

    fn write(&mut self, address: u64, _width: Width, value: u64) {
        let mut guard = self.controller.lock().unwrap();
        let channel = &mut guard.channels[self.channel];
        if address == 0 {
            channel.regs.device_control = DeviceControl::from_bits_truncate(value as u8);
        }
    }
}

struct BusmasterWindow {
    controller: Arc<Mutex<Controller>>,
    channel: usize,
    fabric: Arc<dyn MemoryFabric>,
}

impl Device for BusmasterWindow {
    fn read(&mut self, address: u64, _width: Width) -> u64 {
        let guard = self.controller.lock().unwrap();
        let bm = &guard.channels[self.channel].busmaster;
        match address {
            0 => bm.command.bits() as u64,
            2 => bm.status.bits() as u64,
            4..=7 => ((bm.prd_pointer >> ((address - 4) * 8)) & 0xFF) as u64,
            _ => 0,
        }
    }

    fn write(&mut self, address: u64, _width: Width, value: u64) {
        let mut guard = self.controller.lock().unwrap();
        let channel = &mut guard.channels[self.channel];
        match address {
            0 => {
                let was_active = channel.busmaster.command.contains(BusmasterCommand::START);
                channel.busmaster.command = BusmasterCommand::from_bits_truncate(value as u8);
                if !was_active && channel.busmaster.command.contains(BusmasterCommand::START) {
                    channel.busmaster.status.insert(BusmasterStatus::ACTIVE);
                    // Re-entrant: `run_dma_transfer` calls back into the
                    // fabric to walk the PRD chain, which is safe because
                    // `HostFabric` releases its device-routing lock before
                    // invoking this very write (see `fabric::routed_device`).
                    channel.run_dma_transfer(self.fabric.as_ref());
                }
            }
            2 => channel.busmaster.write_status_w1c(value as u8),
            4..=7 => {
                let shift = (address - 4) * 8;
                let mask = !(0xFFu32 << shift);
                channel.busmaster.prd_pointer = (channel.busmaster.prd_pointer & mask) | ((value as u32 & 0xFF) << shift);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::media::ImageFile;
    use crate::storage::scsi::ScsiTarget;
    use std::io::Cursor;

    fn fabric_with_controller() -> (Arc<HostFabric>, Arc<Mutex<Controller>>) {
        let fabric = Arc::new(HostFabric::new(0x20000, 1));
        let mut controller = Controller::default();
        let backing = vec![0u8; 300 * 512];
        controller.channels[0].drives[0] = DriveSlot::Ata(AtaDrive::new(Box::new(ImageFile::new(Cursor::new(backing), 300 * 512, 512, false, false))));
        let controller = Arc::new(Mutex::new(controller));
        Controller::attach_to_fabric(controller.clone(), &fabric);
        (fabric, controller)
    }

    #[test]
    fn identify_device_over_legacy_ports_reports_signature() {
        let (fabric, _controller) = fabric_with_controller();
        fabric.write(PRIMARY_COMMAND_BASE + 6, Width::Byte, 0xA0); // select drive 0, LBA
        fabric.write(PRIMARY_COMMAND_BASE + 7, Width::Byte, ata::CMD_IDENTIFY_DEVICE as u64);
        let status = fabric.read(PRIMARY_COMMAND_BASE + 7, Width::Byte);
        assert_eq!(status & Status::DRQ.bits() as u64, Status::DRQ.bits() as u64);
        let word0 = fabric.read(PRIMARY_COMMAND_BASE, Width::Word);
        assert_eq!(word0, 0x0040);
    }

    #[test]
    fn busmaster_read_dma_moves_disk_bytes_into_guest_ram() {
        let (fabric, controller) = fabric_with_controller();
        {
            let mut guard = controller.lock().unwrap();
            if let DriveSlot::Ata(drive) = &mut guard.channels[0].drives[0] {
                drive.media.seek_byte(0).unwrap();
                drive.media.write_bytes(&[0x42; 512]).unwrap();
            }
        }
        fabric.write(PRIMARY_COMMAND_BASE + 6, Width::Byte, 0xE0);
        fabric.write(PRIMARY_COMMAND_BASE + 2, Width::Byte, 1); // sector count
        fabric.write(PRIMARY_COMMAND_BASE + 7, Width::Byte, ata::CMD_READ_DMA as u64);
        // PRD table: one descriptor, 512 bytes, end-of-list, buffer at 0x3000.
        fabric.write(PRIMARY_BUSMASTER_BASE + 4, Width::Long, 0x1000);
        fabric.write(0x1000, Width::Long, 0x3000);
        fabric.write(0x1004, Width::Long, 512 | 0x8000_0000);
        fabric.write(PRIMARY_BUSMASTER_BASE, Width::Byte, (BusmasterCommand::START | BusmasterCommand::READ_FROM_DEVICE).bits() as u64);
        assert_eq!(fabric.read(0x3000, Width::Byte), 0x42);
        let bm_status = fabric.read(PRIMARY_BUSMASTER_BASE + 2, Width::Byte);
        assert_eq!(bm_status & BusmasterStatus::INTERRUPT.bits() as u64, BusmasterStatus::INTERRUPT.bits() as u64);
    }

    #[test]
    fn busmaster_dma_with_a_short_prd_chain_clears_active_without_raising_irq() {
        let (fabric, controller) = fabric_with_controller();
        {
            let mut guard = controller.lock().unwrap();
            if let DriveSlot::Ata(drive) = &mut guard.channels[0].drives[0] {
                drive.media.seek_byte(0).unwrap();
                drive.media.write_bytes(&[0x42; 1024]).unwrap();
            }
        }
        fabric.write(PRIMARY_COMMAND_BASE + 6, Width::Byte, 0xE0);
        fabric.write(PRIMARY_COMMAND_BASE + 2, Width::Byte, 2); // sector count: 1024 bytes wanted
        fabric.write(PRIMARY_COMMAND_BASE + 7, Width::Byte, ata::CMD_READ_DMA as u64);
        // PRD table: one descriptor of only 512 bytes, end-of-list — the chain
        // is exhausted (512) before the requested transfer (1024) finishes.
        fabric.write(PRIMARY_BUSMASTER_BASE + 4, Width::Long, 0x1000);
        fabric.write(0x1000, Width::Long, 0x3000);
        fabric.write(0x1004, Width::Long, 512 | 0x8000_0000);
        fabric.write(PRIMARY_BUSMASTER_BASE, Width::Byte, (BusmasterCommand::START | BusmasterCommand::READ_FROM_DEVICE).bits() as u64);
        let bm_status = fabric.read(PRIMARY_BUSMASTER_BASE + 2, Width::Byte);
        assert_eq!(bm_status & BusmasterStatus::ACTIVE.bits() as u64, 0);
        assert_eq!(bm_status & BusmasterStatus::INTERRUPT.bits() as u64, 0);
    }

    #[test]
    fn atapi_packet_over_legacy_ports_reaches_data_in() {
        let fabric = Arc::new(HostFabric::new(0x20000, 1));
        let mut controller = Controller::default();
        let backing = vec![0x77u8; 2048 * 4];
        let target = ScsiTarget::new(Box::new(ImageFile::new(Cursor::new(backing), 2048 * 4, 2048, true, true)));
        controller.channels[0].drives[0] = DriveSlot::Atapi(AtapiDevice::new(target));
        let controller = Arc::new(Mutex::new(controller));
        Controller::attach_to_fabric(controller.clone(), &fabric);

        fabric.write(PRIMARY_COMMAND_BASE + 6, Width::Byte, 0xA0);
        fabric.write(PRIMARY_COMMAND_BASE + 7, Width::Byte, ata::CMD_PACKET as u64);
        let cdb: [u16; 6] = [0x0028, 0x0000, 0x0000, 0x0000, 0x0002, 0x0000];
        for word in cdb {
            fabric.write(PRIMARY_COMMAND_BASE, Width::Word, word as u64);
        }
        let status = fabric.read(PRIMARY_COMMAND_BASE + 7, Width::Byte);
        assert_eq!(status & Status::DRQ.bits() as u64, Status::DRQ.bits() as u64);
    }
}
