//! ATAPI packet command state machine: the layer between
//! `ata::AtaDrive`'s `CMD_PACKET` hand-off and the SCSI target underneath a
//! CD-ROM drive, walking DP1 (host writes the 12-byte CDB) through DP2
//! (branch on the target's resulting phase), DP34 (bulk transfer), and DI
//! (interrupt, device idle).
//!
//! Grounded on `AliM1543C_ide.cpp`'s packet-phase handling (the
//! `m_iPacketPhase` stepping between CDB receipt and data transfer)
//! translated into an explicit Rust state enum rather than an integer
//! phase counter.

use crate::storage::registers::{ChannelRegisters, Status};
use crate::storage::scsi::{ScsiPhase, ScsiTarget};

const CDB_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketState {
    Idle,
    /// DP1: waiting for the host to write the full 12-byte CDB.
    AwaitingCdb,
    /// DP34: bulk transfer in progress (PIO or DMA).
    Transferring,
    /// DI: transfer complete, status byte pending.
    Done,
}

pub struct AtapiDevice {
    pub target: ScsiTarget,
    state: PacketState,
    cdb: Vec<u8>,
    use_dma: bool,
}

/// What the channel/busmaster driver must do next after feeding the state
/// machine a byte of CDB or a PIO-buffer drain.
pub enum Step {
    NeedMoreCdb,
    PioDataReady,
    /// DP34 selected a DMA transfer: caller must run the busmaster engine
    /// against `len` bytes in the direction given (true = device-to-host).
    StartDma { len: usize, device_to_host: bool },
    /// The target refused a data-out phase. Caller surfaces
    /// CHECK CONDITION/ILLEGAL REQUEST and completes the command.
    UnsupportedDataOut,
    Complete,
}

impl AtapiDevice {
    pub fn new(target: ScsiTarget) -> Self {
        AtapiDevice { target, state: PacketState::Idle, cdb: Vec::new(), use_dma: false }
    }

    /// DP1 entry: the ATA sequencer just accepted
    /// `CMD_PACKET`; `feature_dma_bit` is bit 0 of the Features register,
    /// selecting DMA for the eventual data phase.
    pub fn begin_packet(&mut self, regs: &mut ChannelRegisters, feature_dma_bit: bool) {
        self.state = PacketState::AwaitingCdb;
        self.cdb.clear();
        self.use_dma = feature_dma_bit;
        regs.pio_buffer = vec![0u8; CDB_LEN];
        regs.pio_cursor = 0;
        let mut status = regs.selected().status_flags();
        status.remove(Status::BSY);
        status.insert(Status::DRQ);
        regs.selected_mut().set_status(status);
    }

    /// DP2: called once the host has written all 12 CDB
    /// bytes into `regs.pio_buffer`. Dispatches to the SCSI target and
    /// branches on the resulting phase.
    pub fn dispatch_cdb(&mut self, regs: &mut ChannelRegisters) -> Step {
        if self.state != PacketState::AwaitingCdb {
            return Step::Complete;
        }
        self.cdb = regs.pio_buffer.clone();
        let phase = self.target.push_command(&self.cdb);
        match phase {
            ScsiPhase::DataIn => self.begin_data_in(regs),
            ScsiPhase::DataOut => {
                self.state = PacketState::Done;
                Step::UnsupportedDataOut
            }
            _ => {
                self.finish_status(regs);
                Step::Complete
            }
        }
    }

    fn begin_data_in(&mut self, regs: &mut ChannelRegisters) -> Step {
        let data = self.target.take_data_in();
        self.state = PacketState::Transferring;
        if self.use_dma {
            let len = data.len();
            regs.pio_buffer = data;
            regs.pio_cursor = 0;
            Step::StartDma { len, device_to_host: true }
        } else {
            regs.pio_buffer = data;
            regs.pio_cursor = 0;
            let mut status = regs.selected().status_flags();
            status.remove(Status::BSY);
            status.insert(Status::DRQ | Status::DRDY);
            regs.selected_mut().set_status(status);
            regs.selected_mut().set_byte_count(regs.pio_buffer.len() as u16);
            Step::PioDataReady
        }
    }

    /// Called whenever the channel's shared PIO buffer/cursor drains,
    /// whatever state the packet sequencer happens to be in: routes to
    /// CDB dispatch during DP1/DP2, or to status completion during DP34's
    /// PIO path.
    pub fn on_pio_drained(&mut self, regs: &mut ChannelRegisters) -> Step {
        match self.state {
            PacketState::AwaitingCdb => self.dispatch_cdb(regs),
            PacketState::Transferring => {
                self.finish_status(regs);
                Step::Complete
            }
            _ => Step::Complete,
        }
    }

    /// Called once a DMA-driven DP34 transfer completes.
    pub fn finish_dma_transfer(&mut self, regs: &mut ChannelRegisters) {
        self.finish_status(regs);
    }

    fn finish_status(&mut self, regs: &mut ChannelRegisters) {
        self.state = PacketState::Done;
        let mut status = regs.selected().status_flags();
        status.remove(Status::BSY | Status::DRQ);
        status.insert(Status::DRDY);
        if self.target.status_byte() != 0 {
            status.insert(Status::ERR);
        } else {
            status.remove(Status::ERR);
        }
        regs.selected_mut().set_status(status);
        regs.selected_mut().error = 0;
        regs.interrupt_pending = true;
        self.state = PacketState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::media::ImageFile;
    use std::io::Cursor;

    fn device() -> AtapiDevice {
        let backing = vec![0x11u8; 2048 * 4];
        let target = ScsiTarget::new(Box::new(ImageFile::new(Cursor::new(backing), 2048 * 4, 2048, true, true)));
        AtapiDevice::new(target)
    }

    #[test]
    fn read10_packet_drives_pio_data_in() {
        let mut atapi = device();
        let mut regs = ChannelRegisters::default();
        atapi.begin_packet(&mut regs, false);
        regs.pio_buffer = vec![0x28, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0];
        match atapi.dispatch_cdb(&mut regs) {
            Step::PioDataReady => assert_eq!(regs.pio_buffer.len(), 4096),
            _ => panic!("expected PIO data"),
        }
    }

    #[test]
    fn read10_packet_over_dma_requests_busmaster_transfer() {
        let mut atapi = device();
        let mut regs = ChannelRegisters::default();
        atapi.begin_packet(&mut regs, true);
        regs.pio_buffer = vec![0x28, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0];
        match atapi.dispatch_cdb(&mut regs) {
            Step::StartDma { len, device_to_host } => {
                assert_eq!(len, 4096);
                assert!(device_to_host);
            }
            _ => panic!("expected StartDma"),
        }
    }

    #[test]
    fn unrecognized_command_completes_with_error_status() {
        let mut atapi = device();
        let mut regs = ChannelRegisters::default();
        atapi.begin_packet(&mut regs, false);
        regs.pio_buffer = vec![0xFF; 12];
        match atapi.dispatch_cdb(&mut regs) {
            Step::Complete => assert!(regs.selected().status_flags().contains(Status::ERR)),
            _ => panic!("expected Complete"),
        }
    }
}
