//! Loop device setup.
//!
//! Image mounts go through a transient loop device carved out of the
//! backing file at the partition's offset. The legacy loop ioctls pass an
//! fd by value, so they are issued through raw `libc::ioctl`.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;

use vessel_common::{VesselError, VesselResult};

/// Loop device detaches automatically on last close.
pub const LO_FLAGS_AUTOCLEAR: u32 = 4;
/// Loop device rejects writes.
pub const LO_FLAGS_READ_ONLY: u32 = 1;

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// How many times to race other processes for a free loop device before
/// giving up.
const ATTACH_ATTEMPTS: u32 = 5;

/// Kernel `loop_info64` structure for `LOOP_SET_STATUS64`.
#[repr(C)]
pub struct LoopInfo64 {
    /// Device number (read-only for us).
    pub lo_device: u64,
    /// Backing inode (read-only for us).
    pub lo_inode: u64,
    /// Backing device number (read-only for us).
    pub lo_rdevice: u64,
    /// Byte offset into the backing file.
    pub lo_offset: u64,
    /// Byte length exposed through the device; 0 means to EOF.
    pub lo_sizelimit: u64,
    /// Loop device index (read-only for us).
    pub lo_number: u32,
    /// Legacy encryption type; unused.
    pub lo_encrypt_type: u32,
    /// Legacy encryption key size; unused.
    pub lo_encrypt_key_size: u32,
    /// `LO_FLAGS_*` bits.
    pub lo_flags: u32,
    /// Backing file name.
    pub lo_file_name: [u8; LO_NAME_SIZE],
    /// Legacy crypt name; unused.
    pub lo_crypt_name: [u8; LO_NAME_SIZE],
    /// Legacy encryption key; unused.
    pub lo_encrypt_key: [u8; LO_KEY_SIZE],
    /// Reserved.
    pub lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

/// An attached loop device, held open until the mount consumes it.
///
/// With `LO_FLAGS_AUTOCLEAR` set, dropping the last reference after the
/// filesystem is unmounted detaches the device.
pub struct LoopDevice {
    index: i32,
    device: File,
    // Keeps the backing file alive until the kernel holds its own
    // reference through LOOP_SET_FD.
    _backing: File,
}

impl LoopDevice {
    /// Loop device node path, `/dev/loop<n>`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/dev/loop{}", self.index)
    }

    /// Apply offset, size limit, and flags via `LOOP_SET_STATUS64`.
    pub fn set_status(&self, info: &LoopInfo64) -> VesselResult<()> {
        // SAFETY: info is a fully initialized repr(C) struct matching the
        // kernel layout, passed by pointer for the duration of the call.
        let rc = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                LOOP_SET_STATUS64,
                info as *const LoopInfo64,
            )
        };
        if rc != 0 {
            return Err(VesselError::Loop {
                message: format!(
                    "failed to set loop device status: {}",
                    std::io::Error::last_os_error()
                ),
            });
        }
        Ok(())
    }
}

/// Attach `source` to a free loop device.
///
/// Asks `/dev/loop-control` for a free index and binds the backing file
/// with `LOOP_SET_FD`, retrying a few times when another process wins the
/// race for the same device.
pub fn attach(source: &str, read_only: bool) -> VesselResult<LoopDevice> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/loop-control")
        .map_err(|err| VesselError::Loop {
            message: format!("failed to open /dev/loop-control: {err}"),
        })?;

    let backing = OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(source)
        .map_err(|err| VesselError::Loop {
            message: format!("failed to open image {source}: {err}"),
        })?;

    for attempt in 0..ATTACH_ATTEMPTS {
        // SAFETY: LOOP_CTL_GET_FREE takes no argument and returns the
        // free index as the ioctl result.
        let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE) };
        if index < 0 {
            return Err(VesselError::Loop {
                message: format!(
                    "no free loop device: {}",
                    std::io::Error::last_os_error()
                ),
            });
        }

        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/loop{index}"))
            .map_err(|err| VesselError::Loop {
                message: format!("failed to open /dev/loop{index}: {err}"),
            })?;

        // SAFETY: LOOP_SET_FD passes the backing fd by value.
        let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_FD, backing.as_raw_fd()) };
        if rc == 0 {
            return Ok(LoopDevice {
                index,
                device,
                _backing: backing,
            });
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EBUSY) {
            tracing::debug!(index, attempt, "loop device raced away, retrying");
            continue;
        }
        return Err(VesselError::Loop {
            message: format!("failed to attach /dev/loop{index}: {err}"),
        });
    }

    Err(VesselError::Loop {
        message: format!("no loop device available after {ATTACH_ATTEMPTS} attempts"),
    })
}
