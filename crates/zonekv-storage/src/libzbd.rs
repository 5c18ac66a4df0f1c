//! Real host-managed device backend over libzbd.
//!
//! Minimal hand-written bindings for the libzbd entry points the engine
//! uses, plus a [`ZbdBackend`] implementation over them. Writes go through
//! an `O_DIRECT` descriptor; buffers are staged through a block-aligned
//! allocation before submission.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::CString;
use std::io;
use std::os::raw::{c_char, c_int, c_uint};

use parking_lot::Mutex;
use tracing::info;

use crate::backend::{
    BackendStats, ZbdBackend, ZbdInfo, ZoneCondition, ZoneModel, ZoneReport, ZoneType,
};
use crate::error::{ZbdError, ZbdResult};

const ZBD_VENDOR_ID_LEN: usize = 32;

/// Device models, per `enum zbd_dev_model`.
const ZBD_DM_HOST_MANAGED: c_uint = 1;
const ZBD_DM_HOST_AWARE: c_uint = 2;

/// Zone types, per `enum zbd_zone_type`.
const ZBD_ZONE_TYPE_CNV: c_uint = 1;
const ZBD_ZONE_TYPE_SWR: c_uint = 2;
const ZBD_ZONE_TYPE_SWP: c_uint = 3;

/// Zone conditions, per `enum zbd_zone_cond`.
const ZBD_ZONE_COND_EMPTY: c_uint = 1;
const ZBD_ZONE_COND_IMP_OPEN: c_uint = 2;
const ZBD_ZONE_COND_EXP_OPEN: c_uint = 3;
const ZBD_ZONE_COND_CLOSED: c_uint = 4;
const ZBD_ZONE_COND_READONLY: c_uint = 13;
const ZBD_ZONE_COND_FULL: c_uint = 14;
const ZBD_ZONE_COND_OFFLINE: c_uint = 15;

/// Report filter accepting every zone (`ZBD_RO_ALL`).
const ZBD_RO_ALL: c_uint = 0;

#[repr(C)]
struct RawZbdInfo {
    vendor_id: [c_char; ZBD_VENDOR_ID_LEN],
    nr_sectors: u64,
    nr_lblocks: u64,
    nr_pblocks: u64,
    zone_size: u64,
    zone_sectors: c_uint,
    lblock_size: c_uint,
    pblock_size: c_uint,
    nr_zones: c_uint,
    max_nr_open_zones: c_uint,
    max_nr_active_zones: c_uint,
    model: c_uint,
}

#[repr(C)]
struct RawZbdZone {
    start: u64,
    len: u64,
    capacity: u64,
    wp: u64,
    flags: c_uint,
    zone_type: c_uint,
    cond: c_uint,
    reserved: [u8; 20],
}

extern "C" {
    fn zbd_open(filename: *const c_char, flags: c_int, info: *mut RawZbdInfo) -> c_int;
    fn zbd_close(fd: c_int);
    fn zbd_report_zones(
        fd: c_int,
        ofst: libc::off_t,
        len: libc::off_t,
        ro: c_uint,
        zones: *mut RawZbdZone,
        nr_zones: *mut c_uint,
    ) -> c_int;
    fn zbd_reset_zones(fd: c_int, ofst: libc::off_t, len: libc::off_t) -> c_int;
    fn zbd_finish_zones(fd: c_int, ofst: libc::off_t, len: libc::off_t) -> c_int;
    fn zbd_close_zones(fd: c_int, ofst: libc::off_t, len: libc::off_t) -> c_int;
}

fn map_model(model: c_uint) -> Option<ZoneModel> {
    match model {
        ZBD_DM_HOST_MANAGED => Some(ZoneModel::HostManaged),
        ZBD_DM_HOST_AWARE => Some(ZoneModel::HostAware),
        _ => None,
    }
}

fn map_zone_type(raw: c_uint) -> ZoneType {
    match raw {
        ZBD_ZONE_TYPE_SWR => ZoneType::SequentialWriteRequired,
        ZBD_ZONE_TYPE_SWP => ZoneType::SequentialWritePreferred,
        ZBD_ZONE_TYPE_CNV => ZoneType::Conventional,
        _ => ZoneType::Conventional,
    }
}

fn map_cond(raw: c_uint) -> ZoneCondition {
    match raw {
        ZBD_ZONE_COND_EMPTY => ZoneCondition::Empty,
        ZBD_ZONE_COND_IMP_OPEN => ZoneCondition::ImplicitOpen,
        ZBD_ZONE_COND_EXP_OPEN => ZoneCondition::ExplicitOpen,
        ZBD_ZONE_COND_CLOSED => ZoneCondition::Closed,
        ZBD_ZONE_COND_READONLY => ZoneCondition::ReadOnly,
        ZBD_ZONE_COND_FULL => ZoneCondition::Full,
        ZBD_ZONE_COND_OFFLINE => ZoneCondition::Offline,
        _ => ZoneCondition::Offline,
    }
}

/// A physical zoned block device opened through libzbd.
pub struct LibzbdDevice {
    filename: String,
    read_fd: c_int,
    read_direct_fd: c_int,
    write_fd: Option<c_int>,
    info: ZbdInfo,
    block_size: u64,
    stats: Mutex<BackendStats>,
}

impl LibzbdDevice {
    /// Opens `/dev/<bdevname>`. Without `readonly` a third descriptor is
    /// opened `O_WRONLY | O_DIRECT` for the write path.
    pub fn open(bdevname: &str, readonly: bool) -> ZbdResult<Self> {
        let filename = format!("/dev/{bdevname}");
        let c_filename = CString::new(filename.clone())
            .map_err(|_| ZbdError::InvalidArgument("device name contains NUL".to_string()))?;

        let mut raw: RawZbdInfo = unsafe { std::mem::zeroed() };

        let read_fd = unsafe { zbd_open(c_filename.as_ptr(), libc::O_RDONLY, &mut raw) };
        if read_fd < 0 {
            return Err(ZbdError::InvalidArgument(format!(
                "failed to open zoned block device {filename}"
            )));
        }

        let read_direct_fd = unsafe { zbd_open(c_filename.as_ptr(), libc::O_RDONLY, &mut raw) };
        if read_direct_fd < 0 {
            unsafe { zbd_close(read_fd) };
            return Err(ZbdError::InvalidArgument(format!(
                "failed to open zoned block device {filename}"
            )));
        }

        let write_fd = if readonly {
            None
        } else {
            let fd = unsafe {
                zbd_open(
                    c_filename.as_ptr(),
                    libc::O_WRONLY | libc::O_DIRECT,
                    &mut raw,
                )
            };
            if fd < 0 {
                unsafe {
                    zbd_close(read_fd);
                    zbd_close(read_direct_fd);
                }
                return Err(ZbdError::InvalidArgument(format!(
                    "failed to open zoned block device {filename} for writing"
                )));
            }
            Some(fd)
        };

        let model = map_model(raw.model).ok_or_else(|| {
            ZbdError::NotSupported(format!("{filename} is not a zoned block device"))
        })?;

        let info = ZbdInfo {
            model,
            nr_zones: raw.nr_zones,
            zone_size: raw.zone_size,
            block_size: raw.pblock_size as u64,
            max_nr_open_zones: raw.max_nr_open_zones,
            max_nr_active_zones: raw.max_nr_active_zones,
        };
        info!(device = %filename, nr_zones = info.nr_zones, "opened zoned block device");

        Ok(Self {
            filename,
            read_fd,
            read_direct_fd,
            write_fd,
            block_size: info.block_size,
            info,
            stats: Mutex::new(BackendStats::default()),
        })
    }

    fn write_fd(&self) -> ZbdResult<c_int> {
        self.write_fd.ok_or_else(|| {
            ZbdError::InvalidArgument("device opened read-only".to_string())
        })
    }

    fn pread_fd(&self, fd: c_int, buf: &mut [u8], offset: u64) -> ZbdResult<usize> {
        let n = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
        self.stats.lock().bytes_read += n as u64;
        Ok(n as usize)
    }
}

impl ZbdBackend for LibzbdDevice {
    fn info(&self) -> ZbdResult<ZbdInfo> {
        Ok(self.info.clone())
    }

    fn report_zones(&self, start: u64, len: u64) -> ZbdResult<Vec<ZoneReport>> {
        let nr = ((len + self.info.zone_size - 1) / self.info.zone_size).max(1) as usize;
        let mut raw: Vec<RawZbdZone> = Vec::with_capacity(nr);
        let mut reported: c_uint = nr as c_uint;

        let ret = unsafe {
            zbd_report_zones(
                self.read_fd,
                start as libc::off_t,
                len as libc::off_t,
                ZBD_RO_ALL,
                raw.as_mut_ptr(),
                &mut reported,
            )
        };
        if ret != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("zone report failed: {ret}"),
            )
            .into());
        }
        unsafe { raw.set_len(reported as usize) };

        Ok(raw
            .iter()
            .map(|z| ZoneReport {
                start: z.start,
                len: z.len,
                capacity: z.capacity,
                wp: z.wp,
                zone_type: map_zone_type(z.zone_type),
                cond: map_cond(z.cond),
            })
            .collect())
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> ZbdResult<usize> {
        match self.pread_fd(self.read_fd, buf, offset) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.stats.lock().buffered_read_errors += 1;
                Err(e)
            }
        }
    }

    fn pread_direct(&self, buf: &mut [u8], offset: u64) -> ZbdResult<usize> {
        self.pread_fd(self.read_direct_fd, buf, offset)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> ZbdResult<usize> {
        let fd = self.write_fd()?;

        // O_DIRECT needs block-aligned memory; stage through an aligned
        // allocation.
        let layout = Layout::from_size_align(buf.len(), self.block_size as usize)
            .map_err(|e| ZbdError::InvalidArgument(e.to_string()))?;
        let staged = unsafe { alloc_zeroed(layout) };
        if staged.is_null() {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "aligned alloc failed").into());
        }

        let n = unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), staged, buf.len());
            let n = libc::pwrite(fd, staged.cast(), buf.len(), offset as libc::off_t);
            dealloc(staged, layout);
            n
        };
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
        self.stats.lock().bytes_written += n as u64;
        Ok(n as usize)
    }

    fn reset_zone(&self, start: u64, len: u64) -> ZbdResult<()> {
        let fd = self.write_fd()?;
        let ret = unsafe { zbd_reset_zones(fd, start as libc::off_t, len as libc::off_t) };
        if ret != 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "zone reset failed").into());
        }
        self.stats.lock().zone_resets += 1;
        Ok(())
    }

    fn finish_zone(&self, start: u64, len: u64) -> ZbdResult<()> {
        let fd = self.write_fd()?;
        let ret = unsafe { zbd_finish_zones(fd, start as libc::off_t, len as libc::off_t) };
        if ret != 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "zone finish failed").into());
        }
        self.stats.lock().zone_finishes += 1;
        Ok(())
    }

    fn close_zone(&self, start: u64, len: u64) -> ZbdResult<()> {
        let fd = self.write_fd()?;
        let ret = unsafe { zbd_close_zones(fd, start as libc::off_t, len as libc::off_t) };
        if ret != 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "zone close failed").into());
        }
        self.stats.lock().zone_closes += 1;
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.stats.lock().clone()
    }

    fn describe(&self) -> String {
        self.filename.clone()
    }
}

impl Drop for LibzbdDevice {
    fn drop(&mut self) {
        unsafe {
            zbd_close(self.read_fd);
            zbd_close(self.read_direct_fd);
            if let Some(fd) = self.write_fd {
                zbd_close(fd);
            }
        }
    }
}
