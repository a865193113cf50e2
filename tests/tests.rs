//! Integration tests driving the crate's public API end to end — the
//! legacy-port storage path, config loading, and the save/restore framing
//! — as opposed to the unit tests living alongside each module, which
//! exercise internals those modules don't expose publicly.

use ev68core::config::MachineConfig;
use ev68core::fabric::{HostFabric, MemoryFabric, Width};
use ev68core::storage::ata::{self, AtaDrive};
use ev68core::storage::atapi::AtapiDevice;
use ev68core::storage::media::{ImageFile, MediaBackend};
use ev68core::storage::registers::{BusmasterCommand, BusmasterStatus, Status};
use ev68core::storage::scsi::ScsiTarget;
use ev68core::storage::{Controller, DriveSlot, PRIMARY_BUSMASTER_BASE, PRIMARY_COMMAND_BASE};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

fn controller_with_ata_disk(blocks: usize) -> (Arc<HostFabric>, Arc<Mutex<Controller>>) {
    let fabric = Arc::new(HostFabric::new(0x20000, 1));
    let mut controller = Controller::default();
    let backing = vec![0u8; blocks * 512];
    let media = ImageFile::new(Cursor::new(backing), (blocks * 512) as u64, 512, false, false);
    controller.channels[0].drives[0] = DriveSlot::Ata(AtaDrive::new(Box::new(media)));
    let controller = Arc::new(Mutex::new(controller));
    Controller::attach_to_fabric(controller.clone(), &fabric);
    (fabric, controller)
}

/// Scenario 4: a 512 MiB image (1,048,576 blocks of
/// 512 bytes, CHS 1041/16/63) identifies with LBA size words 60/61 equal
/// to the block count's low/high 16 bits.
#[test]
fn ata_identify_reports_the_512mib_geometry() {
    let (fabric, _controller) = controller_with_ata_disk(1_048_576);
    fabric.write(PRIMARY_COMMAND_BASE + 6, Width::Byte, 0xA0);
    fabric.write(PRIMARY_COMMAND_BASE + 7, Width::Byte, ata::CMD_IDENTIFY_DEVICE as u64);

    let mut words = [0u16; 256];
    for word in words.iter_mut() {
        *word = fabric.read(PRIMARY_COMMAND_BASE, Width::Word) as u16;
    }
    assert_eq!(words[60], 0x0000);
    assert_eq!(words[61], 0x0010);
}

/// Scenario 6: a two-entry PRD chain (1024 bytes to 0x2000, 1024 bytes to
/// 0x4000, second marked end-of-list) completes a READ DMA and raises the
/// busmaster interrupt bit exactly once.
#[test]
fn busmaster_read_dma_follows_a_two_entry_prd_chain() {
    let (fabric, controller) = controller_with_ata_disk(16);
    {
        let mut guard = controller.lock().unwrap();
        if let DriveSlot::Ata(drive) = &mut guard.channels[0].drives[0] {
            drive.media.seek_byte(0).unwrap();
            let mut pattern = vec![0u8; 2048];
            for (i, byte) in pattern.iter_mut().enumerate() {
                *byte = (i % 256) as u8;
            }
            drive.media.write_bytes(&pattern).unwrap();
        }
    }

    fabric.write(PRIMARY_COMMAND_BASE + 6, Width::Byte, 0xE0);
    fabric.write(PRIMARY_COMMAND_BASE + 2, Width::Byte, 4); // sector_count = 4 (2048 bytes)
    fabric.write(PRIMARY_COMMAND_BASE + 7, Width::Byte, ata::CMD_READ_DMA as u64);

    fabric.write(PRIMARY_BUSMASTER_BASE + 4, Width::Long, 0x1000);
    fabric.write(0x1000, Width::Long, 0x2000);
    fabric.write(0x1004, Width::Long, 1024);
    fabric.write(0x1008, Width::Long, 0x4000);
    fabric.write(0x100C, Width::Long, 1024 | 0x8000_0000);

    fabric.write(PRIMARY_BUSMASTER_BASE, Width::Byte, (BusmasterCommand::START | BusmasterCommand::READ_FROM_DEVICE).bits() as u64);

    for i in 0..1024u64 {
        assert_eq!(fabric.read(0x2000 + i, Width::Byte), (i % 256) as u64, "mismatch at offset {i} in first descriptor");
    }
    for i in 0..1024u64 {
        assert_eq!(fabric.read(0x4000 + i, Width::Byte), ((1024 + i) % 256) as u64, "mismatch at offset {i} in second descriptor");
    }
    let bm_status = fabric.read(PRIMARY_BUSMASTER_BASE + 2, Width::Byte);
    assert_eq!(bm_status & BusmasterStatus::INTERRUPT.bits() as u64, BusmasterStatus::INTERRUPT.bits() as u64);
    assert_eq!(bm_status & BusmasterStatus::ACTIVE.bits() as u64, 0);
}

/// Scenario 5: selecting an ATAPI device, issuing CMD_PACKET, and writing
/// the literal 12-byte READ(10) CDB reaches DATA IN with BSY clear.
#[test]
fn atapi_read10_cdb_reaches_data_in_over_legacy_ports() {
    let fabric = Arc::new(HostFabric::new(0x20000, 1));
    let mut controller = Controller::default();
    let backing = vec![0x5Au8; 2048 * 4];
    let target = ScsiTarget::new(Box::new(ImageFile::new(Cursor::new(backing), 2048 * 4, 2048, true, true)));
    controller.channels[0].drives[0] = DriveSlot::Atapi(AtapiDevice::new(target));
    let controller = Arc::new(Mutex::new(controller));
    Controller::attach_to_fabric(controller.clone(), &fabric);

    fabric.write(PRIMARY_COMMAND_BASE + 6, Width::Byte, 0xA0);
    fabric.write(PRIMARY_COMMAND_BASE + 7, Width::Byte, ata::CMD_PACKET as u64);
    let cdb: [u8; 12] = [0x28, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
    for chunk in cdb.chunks(2) {
        let word = (chunk[1] as u64) << 8 | chunk[0] as u64;
        fabric.write(PRIMARY_COMMAND_BASE, Width::Word, word);
    }

    let status = fabric.read(PRIMARY_COMMAND_BASE + 7, Width::Byte);
    assert_eq!(status & Status::BSY.bits() as u64, 0);
    assert_eq!(status & Status::DRQ.bits() as u64, Status::DRQ.bits() as u64);
}

#[test]
fn machine_config_round_trips_through_toml() {
    let dir = std::env::temp_dir().join(format!("ev68core-config-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let config_path = dir.join("machine.toml");
    std::fs::write(
        &config_path,
        r#"
        cpu_count = 2
        ram_bytes = 134217728
        rom_path = "srm.rom"
        "#,
    )
    .unwrap();
    let config = MachineConfig::load(&config_path).unwrap();
    assert_eq!(config.cpu_count, 2);
    assert_eq!(config.ram_bytes, 134_217_728);
}

#[test]
fn system_saves_and_restores_cpu_register_state() {
    let dir = std::env::temp_dir().join(format!("ev68core-save-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let rom_path = dir.join("rom.bin");
    std::fs::write(&rom_path, [0u8; 16]).unwrap();

    let config = MachineConfig::from_toml_str(&format!("ram_bytes = 65536\nrom_path = \"{}\"\n", rom_path.display())).unwrap();
    let mut system = ev68core::System::new(config.clone()).unwrap();
    system.boot(0x8000_0010);

    let mut saved = Vec::new();
    system.save(&mut saved).unwrap();

    let mut restored = ev68core::System::new(config).unwrap();
    let mut cursor = Cursor::new(saved);
    restored.restore(&mut cursor).unwrap();
}
