//! Low-level POSIX shared memory operations

use crate::error::{FrameShmError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

const SHM_PREFIX: &str = "/frameshm_";
const MAX_NAME_LEN: usize = 255 - SHM_PREFIX.len();

fn full_name(name: &str) -> Result<CString> {
    if name.len() > MAX_NAME_LEN {
        return Err(FrameShmError::NameTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    // Segment names never contain NUL: length checked, prefix is static
    Ok(CString::new(format!("{}{}", SHM_PREFIX, name))
        .expect("segment name contains NUL"))
}

/// Handle to a mapped shared memory segment
///
/// Dropping the handle unmaps the segment for this process only. Removing
/// the segment from the OS namespace is always explicit via
/// [`ShmRegion::unlink`]; the logical owner decides when.
pub struct ShmRegion {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: ShmRegion can be safely shared between threads.
// The mapped region itself is synchronized by the store control blocks.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a new segment of `size` bytes, zero-initialized.
    ///
    /// Fails with `AlreadyExists` if the name is taken; the caller must
    /// unlink first if it wants to replace the segment.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = full_name(name)?;

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH,
        )
        .map_err(|e| {
            if e == Errno::EXIST {
                FrameShmError::AlreadyExists {
                    name: name.to_string(),
                }
            } else {
                FrameShmError::Create {
                    name: name.to_string(),
                    source: e.into(),
                }
            }
        })?;

        if let Err(e) = ftruncate(&fd, size as u64) {
            // Do not leave a zero-length segment behind
            let _ = shm_unlink(c_name.as_c_str());
            return Err(FrameShmError::Truncate(e.into()));
        }

        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| {
                let _ = shm_unlink(c_name.as_c_str());
                FrameShmError::Mmap(e.into())
            })?
        };

        let addr = NonNull::new(addr.cast::<u8>()).expect("mmap returned null");

        // Zero initialize
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: true,
        })
    }

    /// Open an existing segment read-write.
    ///
    /// Fails with `NotFound` if the name does not resolve.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = full_name(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            if e == Errno::NOENT {
                FrameShmError::NotFound {
                    name: name.to_string(),
                }
            } else {
                FrameShmError::Open {
                    name: name.to_string(),
                    source: e.into(),
                }
            }
        })?;

        let stat = rustix::fs::fstat(&fd).map_err(|e| FrameShmError::Open {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;

        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| FrameShmError::Mmap(e.into()))?
        };

        let addr = NonNull::new(addr.cast::<u8>()).expect("mmap returned null");

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
        })
    }

    /// Remove a segment from the OS namespace.
    ///
    /// Existing mappings stay valid until their holders unmap; what happens
    /// to processes that attach mid-destroy is the caller's responsibility.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = full_name(name)?;
        shm_unlink(c_name.as_c_str()).map_err(|e| {
            if e == Errno::NOENT {
                FrameShmError::NotFound {
                    name: name.to_string(),
                }
            } else {
                FrameShmError::Unlink {
                    name: name.to_string(),
                    source: e.into(),
                }
            }
        })
    }

    /// Get raw pointer to the mapped region
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Size of the mapped region
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Name of the segment (without the OS prefix)
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the segment
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Unmap only; the OS object survives until an explicit unlink
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open() {
        let name = "test_region_create";
        let _ = ShmRegion::unlink(name);
        let size = 4096;

        let region1 = ShmRegion::create(name, size).unwrap();
        assert!(region1.is_owner());
        assert_eq!(region1.size(), size);

        unsafe {
            std::ptr::write(region1.as_ptr(), 42u8);
        }

        // Open from another "process"
        let region2 = ShmRegion::open(name).unwrap();
        assert!(!region2.is_owner());
        assert_eq!(region2.size(), size);

        let val = unsafe { std::ptr::read(region2.as_ptr()) };
        assert_eq!(val, 42u8);

        drop(region2);
        drop(region1);
        ShmRegion::unlink(name).unwrap();
    }

    #[test]
    fn test_create_over_existing_fails() {
        let name = "test_region_exists";
        let _ = ShmRegion::unlink(name);

        let _region = ShmRegion::create(name, 4096).unwrap();
        assert!(matches!(
            ShmRegion::create(name, 4096),
            Err(FrameShmError::AlreadyExists { .. })
        ));
        ShmRegion::unlink(name).unwrap();
    }

    #[test]
    fn test_open_missing_fails() {
        assert!(matches!(
            ShmRegion::open("test_region_never_created"),
            Err(FrameShmError::NotFound { .. })
        ));
    }

    #[test]
    fn test_unlink_missing_fails() {
        assert!(matches!(
            ShmRegion::unlink("test_region_never_created"),
            Err(FrameShmError::NotFound { .. })
        ));
    }

    #[test]
    fn test_name_too_long() {
        let name = "x".repeat(300);
        assert!(matches!(
            ShmRegion::create(&name, 64),
            Err(FrameShmError::NameTooLong { .. })
        ));
    }
}
