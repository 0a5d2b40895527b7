//! The four-semaphore group backing a bus, and the cross-process
//! readers-writer lock built from semaphores 1..3.
//!
//! Grounded on `original_source/CCshm/SemRWLock.h` / `SemRWLock.cxx`
//! (`CCSemaphoreGet`, `SemRWLock::readLock`/`writeLock`/`unlock`/`init`) and
//! on `examples/other_examples/d5254037_alexcrichton-ipc-rs__src-unix.rs.rs`
//! for the `libc`-based SysV semaphore call idiom (EINTR retry loop,
//! `SEM_UNDO`).

use std::io;
use std::sync::{Condvar, Mutex};

use crate::error::{BusError, Result};

pub const NUM_SEMAPHORES: libc::c_int = 4;
pub const SEM_NOTIFY: libc::c_ushort = 0;
const SEM_N_READ: libc::c_ushort = 1;
const SEM_N_WRITE: libc::c_ushort = 2;
const SEM_CAN_WRITE: libc::c_ushort = 3;

/// Get or create the 4-semaphore group at `key`. Sets `force_init` if this
/// call created the group (no prior group existed).
pub fn acquire_semaphores(key: libc::key_t, force_init: &mut bool) -> Result<libc::c_int> {
    let mut id = unsafe { libc::semget(key, NUM_SEMAPHORES, 0) };
    if id < 0 {
        *force_init = true;
        id = unsafe { libc::semget(key, NUM_SEMAPHORES, 0o666 | libc::IPC_CREAT) };
        if id < 0 {
            return Err(BusError::Io(io::Error::last_os_error()));
        }
    }
    Ok(id)
}

fn semop_retry(semid: libc::c_int, ops: &mut [libc::sembuf]) -> Result<()> {
    loop {
        let rc = unsafe { libc::semop(semid, ops.as_mut_ptr(), ops.len() as libc::size_t) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(BusError::Io(err));
    }
}

fn sembuf(num: libc::c_ushort, op: libc::c_short, flg: libc::c_short) -> libc::sembuf {
    libc::sembuf { sem_num: num, sem_op: op, sem_flg: flg }
}

/// Set the notification semaphore to zero, waking every consumer blocked in
/// a "wait for zero" (`semop` with `sem_op == 0`).
pub fn pulse_notify(semid: libc::c_int) -> Result<()> {
    loop {
        let rc = unsafe { libc::semctl(semid, SEM_NOTIFY as libc::c_int, libc::SETVAL, 0) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(BusError::Io(err));
    }
}

/// Block until the notification semaphore reads zero, then immediately
/// re-arm it by raising it back to 1. Racy by design against concurrent
/// pulses; callers must re-check shared state afterward rather than assume
/// one pulse means one message.
pub fn wait_for_notification(semid: libc::c_int) -> Result<()> {
    let mut wait_op = [sembuf(SEM_NOTIFY, 0, 0)];
    semop_retry(semid, &mut wait_op)?;
    let mut rearm_op = [sembuf(SEM_NOTIFY, 1, 0)];
    semop_retry(semid, &mut rearm_op)
}

pub fn dump_state(semid: libc::c_int) {
    for i in 0..NUM_SEMAPHORES {
        let val = unsafe { libc::semctl(semid, i, libc::GETVAL) };
        tracing::info!(sem_index = i, value = val, "semaphore state");
    }
}

/// Local re-entrancy state for [`SemRWLock`]: a single process must not
/// attempt to take the kernel lock from two threads at once, because the
/// kernel-side reservation is undone per-process (`SEM_UNDO`), not per-thread.
#[derive(Default)]
struct LockState {
    state: u8, // 0 = unlocked, 1 = read, 2 = write
}

/// Cross-process readers-writer lock built from three counting semaphores
/// (`n_read`, `n_write`, `can_write`) plus a per-process mutex/condvar.
pub struct SemRWLock {
    semid: libc::c_int,
    base_index: libc::c_ushort,
    local: Mutex<LockState>,
    cond: Condvar,
}

impl SemRWLock {
    /// `base_index` is the semaphore index of `n_read`; `n_write` and
    /// `can_write` follow immediately after.
    pub fn new(semid: libc::c_int, base_index: libc::c_ushort) -> SemRWLock {
        SemRWLock { semid, base_index, local: Mutex::new(LockState::default()), cond: Condvar::new() }
    }

    #[inline]
    fn idx(&self, offset: libc::c_ushort) -> libc::c_ushort {
        self.base_index + offset
    }

    /// Write the three initial values `(0, 0, 1)`. Only the bus creator
    /// during force-init (or the CLI's `--init-locks`) calls this.
    pub fn init(&self) -> Result<()> {
        let n_read = self.idx(0) as libc::c_int;
        let n_write = self.idx(1) as libc::c_int;
        let can_write = self.idx(2) as libc::c_int;
        unsafe {
            libc::semctl(self.semid, n_read, libc::SETVAL, 0);
            libc::semctl(self.semid, n_write, libc::SETVAL, 0);
            libc::semctl(self.semid, can_write, libc::SETVAL, 1);
        }
        Ok(())
    }

    pub fn read_lock(&self) -> Result<()> {
        {
            let mut guard = self.local.lock().unwrap();
            while guard.state != 0 {
                guard = self.cond.wait(guard).unwrap();
            }
        }
        let mut ops = [
            sembuf(self.idx(0), 1, libc::SEM_UNDO as libc::c_short),
            sembuf(self.idx(1), 0, 0),
        ];
        semop_retry(self.semid, &mut ops)?;
        self.local.lock().unwrap().state = 1;
        Ok(())
    }

    pub fn write_lock(&self) -> Result<()> {
        {
            let mut guard = self.local.lock().unwrap();
            while guard.state != 0 {
                guard = self.cond.wait(guard).unwrap();
            }
        }
        let mut ops = [
            sembuf(self.idx(0), 0, 0),
            sembuf(self.idx(1), 1, libc::SEM_UNDO as libc::c_short),
            sembuf(self.idx(2), -1, libc::SEM_UNDO as libc::c_short),
        ];
        semop_retry(self.semid, &mut ops)?;
        self.local.lock().unwrap().state = 2;
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        let mut guard = self.local.lock().unwrap();
        match guard.state {
            1 => {
                let mut ops = [sembuf(self.idx(0), -1, libc::SEM_UNDO as libc::c_short)];
                semop_retry(self.semid, &mut ops)?;
                guard.state = 0;
            }
            2 => {
                let mut ops = [
                    sembuf(self.idx(1), -1, libc::SEM_UNDO as libc::c_short),
                    sembuf(self.idx(2), 1, libc::SEM_UNDO as libc::c_short),
                ];
                semop_retry(self.semid, &mut ops)?;
                guard.state = 0;
            }
            _ => {
                tracing::warn!("unlock() called while no lock is held");
            }
        }
        self.cond.notify_all();
        Ok(())
    }

    pub fn dump(&self) {
        for offset in 0..3 {
            let idx = self.idx(offset) as libc::c_int;
            let val = unsafe { libc::semctl(self.semid, idx, libc::GETVAL) };
            tracing::info!(sem_index = idx, value = val, "rwlock semaphore state");
        }
    }
}
