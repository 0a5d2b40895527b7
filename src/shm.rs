//! SysV shared-memory acquisition: attach to an existing segment by key, or
//! create one sized for the caller's header + ring buffer.
//!
//! Grounded on `original_source/CCshm/SharedMem.cxx` (`CCMapSharedMemory`/
//! `CCUnmapSharedMemory`). Caller-supplied SysV keys (derived via `ftok`)
//! rule out crates that manage anonymous/OS-id-linked segments, so this
//! talks to `shmget`/`shmat`/`shmdt`/`shmctl` through `libc` directly (see
//! DESIGN.md).

use std::io;
use std::ptr;

use crate::error::{BusError, Result};

/// An attached SysV shared-memory segment.
#[derive(Debug)]
pub struct SharedMem {
    key: libc::key_t,
    id: libc::c_int,
    size: usize,
    base: *mut u8,
    data: *mut u8,
}

unsafe impl Send for SharedMem {}
unsafe impl Sync for SharedMem {}

impl SharedMem {
    /// Attach an existing segment at `key`, or create one of
    /// `header_bytes + required_buffer_size` bytes if none exists.
    ///
    /// `force_init` is set to `true` if this call created the segment (the
    /// caller must then zero it and write its own header).
    pub fn acquire(
        key: libc::key_t,
        required_buffer_size: usize,
        header_bytes: usize,
        force_init: &mut bool,
    ) -> Result<SharedMem> {
        let mut id = unsafe { libc::shmget(key, 0, 0) };
        let size;
        if id >= 0 && !*force_init {
            let mut info: libc::shmid_ds = unsafe { std::mem::zeroed() };
            if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut info) } != 0 {
                return Err(BusError::Io(io::Error::last_os_error()));
            }
            size = info.shm_segsz as usize;
        } else {
            if required_buffer_size == 0 {
                tracing::warn!(key, "shared-memory segment absent and no buffer size given");
                return Err(BusError::NotFound { key });
            }
            size = header_bytes + required_buffer_size;
            tracing::info!(key, size, "creating shared-memory segment");
            id = unsafe { libc::shmget(key, size, 0o666 | libc::IPC_CREAT) };
            if id < 0 {
                tracing::warn!(
                    key,
                    error = %io::Error::last_os_error(),
                    "failed to create segment, removing conflicting segment and retrying"
                );
                let existing = unsafe { libc::shmget(key, 0, 0) };
                if existing >= 0 {
                    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
                    unsafe { libc::shmctl(existing, libc::IPC_RMID, &mut ds) };
                }
                id = unsafe { libc::shmget(key, size, 0o666 | libc::IPC_CREAT) };
                if id < 0 {
                    return Err(BusError::Io(io::Error::last_os_error()));
                }
            }
            *force_init = true;
        }

        let base = unsafe { libc::shmat(id, ptr::null(), 0) };
        if base as isize == -1 {
            return Err(BusError::Io(io::Error::last_os_error()));
        }
        let base = base as *mut u8;
        let data = unsafe { base.add(header_bytes) };
        Ok(SharedMem { key, id, size, base, data })
    }

    /// Remove the kernel segment outright. Administrative only; the bus
    /// itself never calls this during normal open/close.
    pub fn destroy(key: libc::key_t) -> Result<()> {
        let id = unsafe { libc::shmget(key, 0, 0) };
        if id < 0 {
            return Err(BusError::Io(io::Error::last_os_error()));
        }
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(id, libc::IPC_RMID, &mut ds) } != 0 {
            return Err(BusError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    #[inline]
    pub fn key(&self) -> libc::key_t {
        self.key
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn data(&self) -> *mut u8 {
        self.data
    }
}

impl Drop for SharedMem {
    fn drop(&mut self) {
        if !self.base.is_null() {
            if unsafe { libc::shmdt(self.base as *const libc::c_void) } != 0 {
                tracing::warn!(
                    key = self.key,
                    error = %io::Error::last_os_error(),
                    "failed to detach shared-memory segment"
                );
            }
        }
    }
}

/// Derive the two SysV IPC keys for a bus identified by `path`, mirroring
/// `ftok(path, 1)` for semaphores and `ftok(path, 2)` for shared memory.
pub fn derive_keys(path: &std::path::Path) -> Result<(libc::key_t, libc::key_t)> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| BusError::BadArg("path contains a NUL byte".into()))?;
    let sem_key = unsafe { libc::ftok(c_path.as_ptr(), 1) };
    let shm_key = unsafe { libc::ftok(c_path.as_ptr(), 2) };
    if sem_key == -1 || shm_key == -1 {
        return Err(BusError::Io(io::Error::last_os_error()));
    }
    Ok((sem_key, shm_key))
}
