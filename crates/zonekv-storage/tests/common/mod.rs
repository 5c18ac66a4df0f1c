//! Shared fixtures for the integration tests: an in-memory device with its
//! oracle, plus helpers for registering and writing files.
#![allow(dead_code)]

use std::sync::Arc;

use zonekv_storage::{
    DeviceConfig, FileId, FixedOracle, InternalKey, MemZbdConfig, MemoryZbd, SstFile,
    WriteLifetimeHint, Zone, ZonedDevice,
};

pub const BLOCK: u64 = 4096;

pub struct TestRig {
    pub backend: Arc<MemoryZbd>,
    pub dev: Arc<ZonedDevice>,
    pub oracle: Arc<FixedOracle>,
}

pub fn rig_with(config: MemZbdConfig) -> TestRig {
    let backend = Arc::new(MemoryZbd::new(config));
    let dev = Arc::new(ZonedDevice::open(backend.clone(), DeviceConfig::default()).unwrap());
    let oracle = Arc::new(FixedOracle::new(7));
    dev.set_oracle(oracle.clone());
    TestRig {
        backend,
        dev,
        oracle,
    }
}

pub fn rig(nr_zones: u32, zone_size: u64) -> TestRig {
    rig_with(MemZbdConfig {
        nr_zones,
        zone_size,
        block_size: BLOCK,
        ..MemZbdConfig::default()
    })
}

impl TestRig {
    /// Registers a file with the device and the oracle.
    pub fn add_file(
        &self,
        id: u64,
        level: u32,
        key_lo: u64,
        key_hi: u64,
        hint: WriteLifetimeHint,
    ) -> Arc<SstFile> {
        let file = Arc::new(SstFile::new(
            FileId::new(id),
            level,
            InternalKey::from_u64(key_lo, 0),
            InternalKey::from_u64(key_hi, 0),
            hint,
        ));
        self.dev.register_file(file.clone());
        self.oracle.insert(
            FileId::new(id),
            level,
            InternalKey::from_u64(key_lo, 0),
            InternalKey::from_u64(key_hi, 0),
        );
        file
    }

    /// Allocates a zone for `file` through the normal placement path.
    pub fn allocate_for(&self, file: &SstFile) -> Arc<Zone> {
        self.dev
            .allocate_zone(file.lifetime(), file.smallest(), file.largest(), file.level())
            .expect("allocation must not error")
            .expect("allocation must produce a zone")
    }

    /// Writes one extent of `len` patterned bytes and keeps the zone open.
    pub fn append(&self, file: &SstFile, zone: &Arc<Zone>, len: usize) {
        self.dev
            .append_file_extent(file.id(), zone, &pattern(file.id(), len))
            .unwrap();
    }

    /// Allocates, writes one extent and releases the zone.
    pub fn write_file(&self, file: &SstFile, len: usize) -> Arc<Zone> {
        let zone = self.allocate_for(file);
        self.append(file, &zone, len);
        self.dev.release_zone(&zone).unwrap();
        zone
    }

    /// Deletes a file from the device and the oracle.
    pub fn delete_file(&self, file: &SstFile) {
        self.dev.delete_file(file.id()).unwrap();
        self.oracle.remove(file.id());
    }

    /// Reads a file's payload back through its extents.
    pub fn read_file(&self, file: &SstFile) -> Vec<u8> {
        use zonekv_storage::ZbdBackend;
        let mut out = Vec::new();
        for extent in file.extents() {
            let mut buf = vec![0u8; extent.length as usize];
            self.backend.pread_direct(&mut buf, extent.start).unwrap();
            out.extend_from_slice(&buf);
        }
        out
    }
}

/// Deterministic per-file payload.
pub fn pattern(id: FileId, len: usize) -> Vec<u8> {
    vec![id.into_inner() as u8; len]
}
