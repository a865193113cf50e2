//! ATA register file and busmaster register file:
//! the PIO-visible scratchpad registers per channel, the composed status
//! byte, and the busmaster command/status/PRD-pointer triple.
//!
//! Grounded on the `AliM1543C_ide` register layout (data/error/sector-
//! count/.../status port numbering) and expressed with `bitflags!` for the
//! hardware control/status words, since this crate already carries that
//! dependency.

use bitflags::bitflags;

bitflags! {
    /// ATA status register bits.
    /// CHK/SERV/DMRD alias BSY/DRQ/DRDY's bit positions when operating in
    /// ATAPI mode.
    #[derive(Default, Clone, Copy)]
    pub struct Status: u8 {
        const ERR  = 1 << 0;
        const IDX  = 1 << 1; // legacy, unused
        const CORR = 1 << 2; // legacy, unused
        const DRQ  = 1 << 3;
        const DSC  = 1 << 4; // seek-complete
        const DF   = 1 << 5; // device fault
        const DRDY = 1 << 6;
        const BSY  = 1 << 7;
    }
}

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct ErrorReg: u8 {
        const AMNF  = 1 << 0;
        const TKONF = 1 << 2;
        const ABRT  = 1 << 2; // ABRT shares the same bit position as TKONF (ATA-5)
        const MCR   = 1 << 3;
        const IDNF  = 1 << 4;
        const MC    = 1 << 5;
        const UNC   = 1 << 6;
        const ICRC  = 1 << 7;
    }
}

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct DeviceControl: u8 {
        const IRQ_DISABLE = 1 << 1;
        const SRST = 1 << 2;
    }
}

/// The per-device scratchpad registers a channel shadows.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegs {
    pub error: u8,
    pub features: u8,
    pub sector_count: u8,
    pub sector_number: u8,
    pub cylinder_low: u8,
    pub cylinder_high: u8,
    pub drive_head: u8,
    pub status: u8,
    /// ATAPI's REASON/BYTE_COUNT alias sector_count/cylinder; kept as separate named accessors below for clarity at
    /// call sites, backed by the same storage.
    pub current_command: u8,
    pub multiple_size: u8,
}

impl DeviceRegs {
    pub fn status_flags(&self) -> Status {
        Status::from_bits_truncate(self.status)
    }

    pub fn set_status(&mut self, flags: Status) {
        self.status = flags.bits();
    }

    pub fn byte_count(&self) -> u16 {
        u16::from_le_bytes([self.cylinder_low, self.cylinder_high])
    }

    pub fn set_byte_count(&mut self, count: u16) {
        let b = count.to_le_bytes();
        self.cylinder_low = b[0];
        self.cylinder_high = b[1];
    }
}

/// One legacy ATA channel's register file: two shadowed devices plus the
/// shared command-port semantics a real ATA channel implements.
pub struct ChannelRegisters {
    pub devices: [DeviceRegs; 2],
    pub selected: usize,
    pub device_control: DeviceControl,
    /// Data-port PIO cursor and backing buffer.
    pub pio_buffer: Vec<u8>,
    pub pio_cursor: usize,
    pub interrupt_pending: bool,
}

impl Default for ChannelRegisters {
    fn default() -> Self {
        ChannelRegisters {
            devices: [DeviceRegs::default(), DeviceRegs::default()],
            selected: 0,
            device_control: DeviceControl::empty(),
            pio_buffer: Vec::new(),
            pio_cursor: 0,
            interrupt_pending: false,
        }
    }
}

impl ChannelRegisters {
    pub fn selected(&self) -> &DeviceRegs {
        &self.devices[self.selected]
    }

    pub fn selected_mut(&mut self) -> &mut DeviceRegs {
        &mut self.devices[self.selected]
    }

    /// Status/Command read: composes the status byte and
    /// acknowledges the pending interrupt.
    pub fn read_status_ack(&mut self) -> u8 {
        self.interrupt_pending = false;
        self.selected().status
    }

    pub fn read_alt_status(&self) -> u8 {
        self.selected().status
    }

    pub fn read_data_word(&mut self) -> u16 {
        let lo = self.read_data_byte();
        let hi = self.read_data_byte();
        u16::from_le_bytes([lo, hi])
    }

    fn read_data_byte(&mut self) -> u8 {
        let byte = self.pio_buffer.get(self.pio_cursor).copied().unwrap_or(0);
        self.pio_cursor += 1;
        self.maybe_finish_transfer();
        byte
    }

    pub fn write_data_word(&mut self, value: u16) {
        for byte in value.to_le_bytes() {
            if self.pio_cursor < self.pio_buffer.len() {
                self.pio_buffer[self.pio_cursor] = byte;
            }
            self.pio_cursor += 1;
        }
        self.maybe_finish_transfer();
    }

    fn maybe_finish_transfer(&mut self) {
        if self.pio_cursor >= self.pio_buffer.len() {
            let mut status = self.selected().status_flags();
            status.remove(Status::DRQ);
            self.selected_mut().set_status(status);
        }
    }

    pub fn start_command(&mut self, opcode: u8) {
        let mut status = self.selected().status_flags();
        status.remove(Status::DRQ);
        status.insert(Status::BSY);
        self.selected_mut().set_status(status);
        self.selected_mut().current_command = opcode;
    }
}

bitflags! {
    /// Busmaster command register: bit 0 starts the transfer,
    /// bit 3 sets its direction. `READ_FROM_DEVICE` set means data flows
    /// device-to-memory (the host issued an ATA READ DMA); clear means
    /// memory-to-device (an ATA WRITE DMA).
    #[derive(Default, Clone, Copy)]
    pub struct BusmasterCommand: u8 {
        const START = 1 << 0;
        const READ_FROM_DEVICE = 1 << 3;
    }
}

bitflags! {
    /// Busmaster status register: write-1-to-clear on interrupt/error/active.
    #[derive(Default, Clone, Copy)]
    pub struct BusmasterStatus: u8 {
        const ACTIVE = 1 << 0;
        const ERROR = 1 << 1;
        const INTERRUPT = 1 << 2;
    }
}

#[derive(Default)]
pub struct BusmasterRegisters {
    pub command: BusmasterCommand,
    pub status: BusmasterStatus,
    pub prd_pointer: u32,
}

impl BusmasterRegisters {
    pub fn write_status_w1c(&mut self, value: u8) {
        let clear = BusmasterStatus::from_bits_truncate(value) & (BusmasterStatus::ERROR | BusmasterStatus::INTERRUPT);
        self.status.remove(clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_port_clears_drq_when_cursor_reaches_end() {
        let mut regs = ChannelRegisters::default();
        regs.pio_buffer = vec![0u8; 4];
        regs.selected_mut().set_status(Status::DRQ | Status::DRDY);
        regs.write_data_word(0x1122);
        assert!(regs.selected().status_flags().contains(Status::DRQ));
        regs.write_data_word(0x3344);
        assert!(!regs.selected().status_flags().contains(Status::DRQ));
    }

    #[test]
    fn status_read_acknowledges_interrupt() {
        let mut regs = ChannelRegisters::default();
        regs.interrupt_pending = true;
        let _ = regs.read_status_ack();
        assert!(!regs.interrupt_pending);
    }

    #[test]
    fn busmaster_status_write_1_clears_only_error_and_interrupt() {
        let mut bm = BusmasterRegisters::default();
        bm.status = BusmasterStatus::ACTIVE | BusmasterStatus::ERROR | BusmasterStatus::INTERRUPT;
        bm.write_status_w1c(0xFF);
        assert_eq!(bm.status, BusmasterStatus::ACTIVE);
    }
}
