//! ATA command sequencer: decodes the opcode latched into
//! the command register and drives the register file's status/data-port
//! state machine through to completion or to the ATAPI hand-off in
//! `atapi.rs`.
//!
//! Grounded on `AliM1543C_ide.hpp`'s `UpdateCommandBlock`/command-dispatch
//! shape for the opcode set and the "sector_count==0 means 256" convention;
//! PIO buffering itself reuses `registers::ChannelRegisters`'s data-cursor
//! for byte-at-a-time transfers.

use crate::storage::media::{derive_geometry, MediaBackend};
use crate::storage::registers::{BusmasterRegisters, ChannelRegisters, ErrorReg, Status};

pub const CMD_READ_SECTORS: u8 = 0x20;
pub const CMD_READ_SECTORS_NORETRY: u8 = 0x21;
pub const CMD_WRITE_SECTORS: u8 = 0x30;
pub const CMD_WRITE_SECTORS_NORETRY: u8 = 0x31;
pub const CMD_READ_MULTIPLE: u8 = 0xC4;
pub const CMD_WRITE_MULTIPLE: u8 = 0xC5;
pub const CMD_SET_MULTIPLE_MODE: u8 = 0xC6;
pub const CMD_READ_DMA: u8 = 0xC8;
pub const CMD_WRITE_DMA: u8 = 0xCA;
pub const CMD_IDENTIFY_DEVICE: u8 = 0xEC;
pub const CMD_IDENTIFY_PACKET_DEVICE: u8 = 0xA1;
pub const CMD_PACKET: u8 = 0xA0;
pub const CMD_SET_FEATURES: u8 = 0xEF;
pub const CMD_INIT_DEV_PARAMS: u8 = 0x91;
pub const CMD_RECALIBRATE_BASE: u8 = 0x10; // 0x10..=0x1F
pub const CMD_DEVICE_RESET: u8 = 0x08;
pub const CMD_STANDBY_IMMEDIATE: u8 = 0xE0;
pub const CMD_IDLE_IMMEDIATE: u8 = 0xE1;
pub const CMD_FLUSH_CACHE: u8 = 0xE7;

/// What the caller must do after `execute` returns: nothing further, raise
/// the channel's interrupt line, or hand off to the busmaster DMA engine.
pub enum Outcome {
    Done { raise_irq: bool },
    StartDma { write_to_memory: bool },
    EnterPacket,
}

/// A hard disk attached to one side of an ATA channel. CD-ROM drives are
/// represented by `storage::atapi::AtapiDevice` instead; this sequencer only
/// runs non-packet commands, dispatching `CMD_PACKET` back to the caller via
/// `Outcome::EnterPacket`.
pub struct AtaDrive {
    pub media: Box<dyn MediaBackend>,
    pub multiple_sectors: u8,
    current_lba: u64,
    pending_dma_sectors: u32,
}

impl AtaDrive {
    pub fn new(media: Box<dyn MediaBackend>) -> Self {
        AtaDrive { media, multiple_sectors: 1, current_lba: 0, pending_dma_sectors: 0 }
    }

    fn block_size(&self) -> u64 {
        self.media.block_size() as u64
    }

    fn total_blocks(&self) -> u64 {
        self.media.byte_size() / self.block_size()
    }

    /// Read LBA28/CHS addressing out of the device/head + cylinder +
    /// sector-number registers.
    fn read_lba(&self, regs: &ChannelRegisters) -> u64 {
        let dev = regs.selected();
        if dev.drive_head & 0x40 != 0 {
            let low = dev.sector_number as u64;
            let mid = dev.cylinder_low as u64;
            let high = dev.cylinder_high as u64;
            let top = (dev.drive_head & 0x0F) as u64;
            (top << 24) | (high << 16) | (mid << 8) | low
        } else {
            let geometry = derive_geometry(self.total_blocks().max(1));
            let cylinder = ((dev.cylinder_high as u32) << 8 | dev.cylinder_low as u32) as u64;
            let head = (dev.drive_head & 0x0F) as u64;
            let sector = dev.sector_number.max(1) as u64;
            (cylinder * geometry.heads as u64 + head) * geometry.sectors as u64 + (sector - 1)
        }
    }

    fn sector_count_field(regs: &ChannelRegisters) -> u32 {
        let raw = regs.selected().sector_count;
        if raw == 0 {
            256
        } else {
            raw as u32
        }
    }

    pub fn execute(&mut self, opcode: u8, regs: &mut ChannelRegisters, _busmaster: &BusmasterRegisters) -> Outcome {
        match opcode {
            CMD_READ_SECTORS | CMD_READ_SECTORS_NORETRY => self.pio_read(regs, 1),
            CMD_WRITE_SECTORS | CMD_WRITE_SECTORS_NORETRY => self.pio_write(regs, 1),
            CMD_READ_MULTIPLE => {
                let burst = self.multiple_sectors.max(1) as u32;
                self.pio_read(regs, burst)
            }
            CMD_WRITE_MULTIPLE => {
                let burst = self.multiple_sectors.max(1) as u32;
                self.pio_write(regs, burst)
            }
            CMD_SET_MULTIPLE_MODE => {
                self.multiple_sectors = regs.selected().sector_count;
                self.finish(regs)
            }
            CMD_READ_DMA => {
                self.current_lba = self.read_lba(regs);
                self.pending_dma_sectors = Self::sector_count_field(regs);
                Outcome::StartDma { write_to_memory: true }
            }
            CMD_WRITE_DMA => {
                self.current_lba = self.read_lba(regs);
                self.pending_dma_sectors = Self::sector_count_field(regs);
                Outcome::StartDma { write_to_memory: false }
            }
            CMD_IDENTIFY_DEVICE => self.identify(regs, false),
            CMD_IDENTIFY_PACKET_DEVICE => self.identify(regs, true),
            CMD_PACKET => Outcome::EnterPacket,
            CMD_SET_FEATURES | CMD_INIT_DEV_PARAMS => self.finish(regs),
            CMD_DEVICE_RESET => {
                regs.selected_mut().error = 0x01;
                self.finish(regs)
            }
            CMD_STANDBY_IMMEDIATE | CMD_IDLE_IMMEDIATE | CMD_FLUSH_CACHE => self.finish(regs),
            op if (CMD_RECALIBRATE_BASE..=0x1F).contains(&op) => self.finish(regs),
            _ => self.abort(regs),
        }
    }

    /// Runs after a busmaster DMA completion: moves the
    /// device's LBA pointer and clears BSY/sets DRDY.
    pub fn finish_dma(&mut self, regs: &mut ChannelRegisters) {
        self.current_lba += self.pending_dma_sectors as u64;
        let mut status = regs.selected().status_flags();
        status.remove(Status::BSY);
        status.insert(Status::DRDY | Status::DSC);
        regs.selected_mut().set_status(status);
        regs.interrupt_pending = true;
    }

    /// Fills/drains the busmaster's transfer buffer for the drive's pending
    /// DMA command.
    pub fn dma_buffer_len(&self) -> usize {
        self.pending_dma_sectors as usize * self.block_size() as usize
    }

    pub fn dma_lba(&self) -> u64 {
        self.current_lba
    }

    fn pio_read(&mut self, regs: &mut ChannelRegisters, burst: u32) -> Outcome {
        let lba = self.read_lba(regs);
        let count = Self::sector_count_field(regs).min(burst);
        let block = self.block_size();
        if self.media.seek_byte(lba * block).is_err() {
            return self.abort(regs);
        }
        let mut buf = vec![0u8; (count as u64 * block) as usize];
        if self.media.read_bytes(&mut buf).is_err() {
            return self.abort(regs);
        }
        regs.pio_buffer = buf;
        regs.pio_cursor = 0;
        regs.selected_mut().sector_count = regs.selected().sector_count.wrapping_sub(count as u8);
        let mut status = regs.selected().status_flags();
        status.remove(Status::BSY);
        status.insert(Status::DRQ | Status::DRDY | Status::DSC);
        regs.selected_mut().set_status(status);
        regs.interrupt_pending = true;
        Outcome::Done { raise_irq: true }
    }

    fn pio_write(&mut self, regs: &mut ChannelRegisters, burst: u32) -> Outcome {
        let lba = self.read_lba(regs);
        let count = Self::sector_count_field(regs).min(burst);
        let block = self.block_size();
        regs.pio_buffer = vec![0u8; (count as u64 * block) as usize];
        regs.pio_cursor = 0;
        self.current_lba = lba;
        let mut status = regs.selected().status_flags();
        status.remove(Status::BSY);
        status.insert(Status::DRQ | Status::DRDY);
        regs.selected_mut().set_status(status);
        Outcome::Done { raise_irq: false }
    }

    /// Called once the guest has filled the PIO buffer for a write command
    /// (driven by the register layer watching the data-cursor reach the end).
    pub fn commit_pio_write(&mut self, regs: &mut ChannelRegisters) {
        let lba = self.current_lba;
        let block = self.block_size();
        if self.media.seek_byte(lba * block).is_ok() {
            let _ = self.media.write_bytes(&regs.pio_buffer);
        }
        let mut status = regs.selected().status_flags();
        status.insert(Status::DRDY | Status::DSC);
        regs.selected_mut().set_status(status);
        regs.interrupt_pending = true;
    }

    fn identify(&mut self, regs: &mut ChannelRegisters, packet: bool) -> Outcome {
        if packet != self.media.is_cdrom() {
            return self.abort(regs);
        }
        let mut words = [0u16; 256];
        if packet {
            words[0] = 0x8580; // ATAPI, CD-ROM, removable
        } else {
            words[0] = 0x0040;
            let geometry = derive_geometry(self.total_blocks().max(1));
            words[1] = geometry.cylinders as u16;
            words[3] = geometry.heads as u16;
            words[6] = geometry.sectors as u16;
        }
        let model = b"ALPHASYS VIRTUAL DISK                  ";
        for (i, chunk) in model.chunks(2).take(20).enumerate() {
            let hi = chunk[0] as u16;
            let lo = *chunk.get(1).unwrap_or(&b' ') as u16;
            words[27 + i] = (hi << 8) | lo;
        }
        words[47] = 0; // no read/write multiple support advertised beyond 1
        words[49] = 0x0200; // LBA supported
        words[60] = (self.total_blocks() & 0xFFFF) as u16;
        words[61] = ((self.total_blocks() >> 16) & 0xFFFF) as u16;
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
        Outcome::Done { raise_irq: true }
    }

    fn finish(&mut self, regs: &mut ChannelRegisters) -> Outcome {
        let mut status = regs.selected().status_flags();
        status.remove(Status::BSY);
        status.insert(Status::DRDY);
        regs.selected_mut().set_status(status);
        regs.interrupt_pending = true;
        Outcome::Done { raise_irq: true }
    }

    fn abort(&mut self, regs: &mut ChannelRegisters) -> Outcome {
        let mut status = regs.selected().status_flags();
        status.remove(Status::BSY);
        status.insert(Status::DRDY | Status::ERR);
        regs.selected_mut().set_status(status);
        regs.selected_mut().error = ErrorReg::ABRT.bits();
        regs.interrupt_pending = true;
        Outcome::Done { raise_irq: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::media::ImageFile;
    use std::io::Cursor;

    fn drive(blocks: u64) -> AtaDrive {
        let backing = vec![0u8; (blocks * 512) as usize];
        AtaDrive::new(Box::new(ImageFile::new(Cursor::new(backing), blocks * 512, 512, false, false)))
    }

    #[test]
    fn identify_device_reports_total_blocks_and_model() {
        let mut drive = drive(1_048_576);
        let mut regs = ChannelRegisters::default();
        let busmaster = BusmasterRegisters::default();
        match drive.execute(CMD_IDENTIFY_DEVICE, &mut regs, &busmaster) {
            Outcome::Done { raise_irq } => assert!(raise_irq),
            _ => panic!("expected Done"),
        }
        let word60 = u16::from_le_bytes([regs.pio_buffer[120], regs.pio_buffer[121]]);
        let word61 = u16::from_le_bytes([regs.pio_buffer[122], regs.pio_buffer[123]]);
        assert_eq!(word60 as u32 | ((word61 as u32) << 16), 1_048_576);
    }

    #[test]
    fn read_sectors_with_zero_count_means_256() {
        let mut drive = drive(300);
        let mut regs = ChannelRegisters::default();
        regs.selected_mut().drive_head = 0x40;
        regs.selected_mut().sector_count = 0;
        let busmaster = BusmasterRegisters::default();
        match drive.execute(CMD_READ_SECTORS, &mut regs, &busmaster) {
            Outcome::Done { .. } => assert_eq!(regs.pio_buffer.len(), 256 * 512),
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn unknown_opcode_aborts_with_error() {
        let mut drive = drive(16);
        let mut regs = ChannelRegisters::default();
        let busmaster = BusmasterRegisters::default();
        match drive.execute(0x77, &mut regs, &busmaster) {
            Outcome::Done { .. } => {
                assert!(regs.selected().status_flags().contains(Status::ERR));
                assert_eq!(regs.selected().error, ErrorReg::ABRT.bits());
            }
            _ => panic!("expected Done"),
        }
    }
}
