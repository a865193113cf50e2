//! Save/restore framing: every section (CPU contexts, the
//! controller, the PCI configuration arrays, each disk) is framed by two
//! 32-bit magic values and a recorded length; on restore the implementation
//! verifies both magics and that the stored length equals the section's
//! current packed size, refusing the file otherwise rather than guessing.
//!
//! Byte-level compatibility with the AXPbox/ES40 C++ struct layout this was
//! distilled from is explicitly out of scope; only the
//! magic/length framing invariant is carried forward. Encoding is a flat
//! little-endian field dump, in the same "plain fixed fields, no external
//! serialization crate" spirit as the rest of this crate's register file.

use crate::cpu::Cpu;
use crate::devices::pci::PciConfigSpace;
use crate::error::{EmulatorError, Result};
use crate::storage::registers::{BusmasterCommand, BusmasterStatus, ChannelRegisters, DeviceControl};
use crate::storage::{Channel, Controller, DriveSlot};
use std::io::{Read, Write};

const CPU_MAGIC: u32 = 0xA1FA_C9E0;
const CONTROLLER_MAGIC: u32 = 0xA1FA_1DE0;
const PCI_MAGIC: u32 = 0xA1FA_9C10;
const DISK_MAGIC: u32 = 0xA1FA_D15C;

fn write_framed(w: &mut impl Write, magic: u32, payload: &[u8]) -> Result<()> {
    w.write_all(&magic.to_le_bytes())?;
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(payload)?;
    w.write_all(&magic.to_le_bytes())?;
    Ok(())
}

fn read_framed(r: &mut impl Read, magic: u32) -> Result<Vec<u8>> {
    let mut head = [0u8; 8];
    r.read_exact(&mut head)?;
    let got_magic = u32::from_le_bytes(head[0..4].try_into().unwrap());
    if got_magic != magic {
        return Err(EmulatorError::IllegalState(format!("bad section magic: expected {magic:#010x}, got {got_magic:#010x}")));
    }
    let len = u32::from_le_bytes(head[4..8].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    let mut tail = [0u8; 4];
    r.read_exact(&mut tail)?;
    if u32::from_le_bytes(tail) != magic {
        return Err(EmulatorError::IllegalState("truncated or corrupt section (trailing magic mismatch)".into()));
    }
    Ok(payload)
}

fn expect_len(payload: &[u8], expected: usize, what: &str) -> Result<()> {
    if payload.len() != expected {
        return Err(EmulatorError::IllegalState(format!("{what}: expected {expected} bytes, got {}", payload.len())));
    }
    Ok(())
}

const CPU_SNAPSHOT_LEN: usize = 8 // pc
    + 32 * 8 * 2 // integer primary + shadow
    + 32 * 8 // float primary
    + 8 // unique
    + 8 // cycle_counter
    + 8 // pal_base
    + 8 // exc_addr
    + 1 // waiting_for_start
    + 1; // halted

fn pack_cpu(cpu: &Cpu) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CPU_SNAPSHOT_LEN);
    buf.extend_from_slice(&cpu.pc.to_le_bytes());
    let (primary, shadow) = cpu.integer.raw();
    for v in primary.iter().chain(shadow.iter()) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    for v in cpu.float.raw().iter() {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf.extend_from_slice(&cpu.unique.to_le_bytes());
    buf.extend_from_slice(&cpu.cycle_counter.to_le_bytes());
    buf.extend_from_slice(&cpu.iprs.pal_base.to_le_bytes());
    buf.extend_from_slice(&cpu.iprs.exc_addr.to_le_bytes());
    buf.push(cpu.waiting_for_start as u8);
    buf.push(cpu.halted() as u8);
    buf
}

fn unpack_cpu(cpu: &mut Cpu, bytes: &[u8]) -> Result<()> {
    expect_len(bytes, CPU_SNAPSHOT_LEN, "CPU snapshot")?;
    let mut cursor = 0usize;
    let mut take_u64 = |bytes: &[u8], cursor: &mut usize| -> u64 {
        let v = u64::from_le_bytes(bytes[*cursor..*cursor + 8].try_into().unwrap());
        *cursor += 8;
        v
    };
    cpu.pc = take_u64(bytes, &mut cursor);
    let mut primary = [0u64; 32];
    let mut shadow = [0u64; 32];
    for slot in primary.iter_mut() {
        *slot = take_u64(bytes, &mut cursor);
    }
    for slot in shadow.iter_mut() {
        *slot = take_u64(bytes, &mut cursor);
    }
    cpu.integer.load_raw(primary, shadow);
    let mut float = [0u64; 32];
    for slot in float.iter_mut() {
        *slot = take_u64(bytes, &mut cursor);
    }
    cpu.float.load_raw(float);
    cpu.unique = take_u64(bytes, &mut cursor);
    cpu.cycle_counter = take_u64(bytes, &mut cursor);
    cpu.iprs.pal_base = take_u64(bytes, &mut cursor);
    cpu.iprs.exc_addr = take_u64(bytes, &mut cursor);
    cpu.waiting_for_start = bytes[cursor] != 0;
    cursor += 1;
    cpu.set_halted(bytes[cursor] != 0);
    Ok(())
}

pub fn save_cpus(w: &mut impl Write, cpus: &[Cpu]) -> Result<()> {
    for cpu in cpus {
        write_framed(w, CPU_MAGIC, &pack_cpu(cpu))?;
    }
    Ok(())
}

pub fn restore_cpus(r: &mut impl Read, cpus: &mut [Cpu]) -> Result<()> {
    for cpu in cpus.iter_mut() {
        let payload = read_framed(r, CPU_MAGIC)?;
        unpack_cpu(cpu, &payload)?;
    }
    Ok(())
}

fn pack_channel(channel: &Channel) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(channel.regs.selected as u8);
    buf.push(channel.regs.device_control.bits());
    for dev in channel.regs.devices.iter() {
        buf.push(dev.error);
        buf.push(dev.features);
        buf.push(dev.sector_count);
        buf.push(dev.sector_number);
        buf.push(dev.cylinder_low);
        buf.push(dev.cylinder_high);
        buf.push(dev.drive_head);
        buf.push(dev.status);
        buf.push(dev.current_command);
        buf.push(dev.multiple_size);
    }
    buf.push(channel.busmaster.command.bits());
    buf.push(channel.busmaster.status.bits());
    buf.extend_from_slice(&channel.busmaster.prd_pointer.to_le_bytes());
    buf
}

const CHANNEL_SNAPSHOT_LEN: usize = 2 + 2 * 10 + 2 + 4;

fn unpack_channel(regs: &mut ChannelRegisters, busmaster: &mut crate::storage::registers::BusmasterRegisters, bytes: &[u8]) -> Result<()> {
    expect_len(bytes, CHANNEL_SNAPSHOT_LEN, "channel snapshot")?;
    let mut cursor = 0usize;
    regs.selected = bytes[cursor] as usize;
    cursor += 1;
    regs.device_control = DeviceControl::from_bits_truncate(bytes[cursor]);
    cursor += 1;
    for dev in regs.devices.iter_mut() {
        dev.error = bytes[cursor];
        dev.features = bytes[cursor + 1];
        dev.sector_count = bytes[cursor + 2];
        dev.sector_number = bytes[cursor + 3];
        dev.cylinder_low = bytes[cursor + 4];
        dev.cylinder_high = bytes[cursor + 5];
        dev.drive_head = bytes[cursor + 6];
        dev.status = bytes[cursor + 7];
        dev.current_command = bytes[cursor + 8];
        dev.multiple_size = bytes[cursor + 9];
        cursor += 10;
    }
    busmaster.command = BusmasterCommand::from_bits_truncate(bytes[cursor]);
    busmaster.status = BusmasterStatus::from_bits_truncate(bytes[cursor + 1]);
    cursor += 2;
    busmaster.prd_pointer = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
    Ok(())
}

pub fn save_controller(w: &mut impl Write, controller: &Controller) -> Result<()> {
    for channel in controller.channels.iter() {
        write_framed(w, CONTROLLER_MAGIC, &pack_channel(channel))?;
    }
    Ok(())
}

pub fn restore_controller(r: &mut impl Read, controller: &mut Controller) -> Result<()> {
    for channel in controller.channels.iter_mut() {
        let payload = read_framed(r, CONTROLLER_MAGIC)?;
        unpack_channel(&mut channel.regs, &mut channel.busmaster, &payload)?;
    }
    Ok(())
}

pub fn save_pci(w: &mut impl Write, functions: &[PciConfigSpace]) -> Result<()> {
    for function in functions {
        let mut bytes = vec![0u8; 256];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = function.read_u8(i);
        }
        write_framed(w, PCI_MAGIC, &bytes)?;
    }
    Ok(())
}

/// Restores a PCI function's readable identity/BAR bytes directly into a
/// fresh `PciConfigSpace`'s backing array via its own write path so the
/// writable-bit mask still governs what actually lands;
/// since identity fields are masked read-only, a function restored this
/// way re-derives its identity from `PciConfigSpace::new_ide_function`
/// rather than from the save file, and only BAR/interrupt-line bytes are
/// replayed from the snapshot.
pub fn restore_pci(r: &mut impl Read, functions: &mut [PciConfigSpace]) -> Result<()> {
    for function in functions.iter_mut() {
        let payload = read_framed(r, PCI_MAGIC)?;
        expect_len(&payload, 256, "PCI function snapshot")?;
        for (offset, byte) in payload.iter().enumerate() {
            function.write_u8(offset, *byte);
        }
    }
    Ok(())
}

/// A disk's save-relevant state. The media backend's byte position lives in whatever
/// `Read + Write + Seek` the host gave it, which this crate does not own
/// well enough to snapshot generically; what's captured here is the part
/// the controller itself tracks.
pub fn pack_disk(drive: &DriveSlot) -> Vec<u8> {
    match drive {
        DriveSlot::Empty => vec![0u8],
        DriveSlot::Ata(drive) => {
            let mut buf = vec![1u8];
            buf.extend_from_slice(&drive.dma_lba().to_le_bytes());
            buf.push(drive.multiple_sectors);
            buf
        }
        DriveSlot::Atapi(_) => vec![2u8],
    }
}

pub fn save_disks(w: &mut impl Write, controller: &Controller) -> Result<()> {
    for channel in controller.channels.iter() {
        for drive in channel.drives.iter() {
            write_framed(w, DISK_MAGIC, &pack_disk(drive))?;
        }
    }
    Ok(())
}

/// Consumes (and verifies the framing of) each disk section without
/// attempting to reconstruct live `MediaBackend` state from it — restoring
/// the open file handle/cursor a disk image uses is the caller's job,
/// since only the caller knows where the image file lives on this host.
pub fn skip_disks(r: &mut impl Read, disk_count: usize) -> Result<()> {
    for _ in 0..disk_count {
        let _ = read_framed(r, DISK_MAGIC)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpu;
    use std::io::Cursor;

    #[test]
    fn cpu_snapshot_round_trips_through_framing() {
        let mut cpu = Cpu::new(0, 0x8000_0000, true);
        cpu.pc = 0x1234_5678;
        cpu.unique = 42;
        cpu.cycle_counter = 99;
        let mut buf = Vec::new();
        save_cpus(&mut buf, std::slice::from_ref(&cpu)).unwrap();

        let mut restored = Cpu::new(0, 0, false);
        let mut cursor = Cursor::new(buf);
        restore_cpus(&mut cursor, std::slice::from_mut(&mut restored)).unwrap();
        assert_eq!(restored.pc, 0x1234_5678);
        assert_eq!(restored.unique, 42);
        assert_eq!(restored.cycle_counter, 99);
    }

    #[test]
    fn bad_magic_is_refused() {
        let cpu = Cpu::new(0, 0x8000_0000, true);
        let mut buf = Vec::new();
        save_cpus(&mut buf, std::slice::from_ref(&cpu)).unwrap();
        buf[0] ^= 0xFF;
        let mut restored = Cpu::new(0, 0, false);
        let mut cursor = Cursor::new(buf);
        assert!(restore_cpus(&mut cursor, std::slice::from_mut(&mut restored)).is_err());
    }

    #[test]
    fn controller_snapshot_round_trips() {
        let mut controller = Controller::default();
        controller.channels[0].regs.selected = 1;
        controller.channels[0].busmaster.prd_pointer = 0xDEAD_BEEF;
        let mut buf = Vec::new();
        save_controller(&mut buf, &controller).unwrap();

        let mut restored = Controller::default();
        let mut cursor = Cursor::new(buf);
        restore_controller(&mut cursor, &mut restored).unwrap();
        assert_eq!(restored.channels[0].regs.selected, 1);
        assert_eq!(restored.channels[0].busmaster.prd_pointer, 0xDEAD_BEEF);
    }
}
