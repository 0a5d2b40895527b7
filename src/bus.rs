//! The event bus itself: shared-memory ring buffer, framing, and the
//! post/get operations built on top of [`crate::shm::SharedMem`] and
//! [`crate::semlock::SemRWLock`].
//!
//! Grounded on `original_source/CCshm/EventBus.h` / `EventBus.cxx`
//! (`_post`/`_get`/`rb_read`/`rb_write`/`rb_resync`/`_move_to_head`), matching
//! the overall shape of a shared-memory message journal with
//! semaphore-driven notification.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{BusError, Result};
use crate::frame::{align_up_8, BusHeader, MessageHeader, BUS_HEADER_FIELDS_SIZE, HEADER_BYTES, MESSAGE_HEADER_SIZE};
use crate::semlock::{self, SemRWLock};
use crate::shm::SharedMem;

/// A consumer's private read position: never written back to shared memory.
#[derive(Clone, Copy, Default)]
struct Cursor {
    head: u64,
    last_serial: u64,
}

fn dimensions(num_items: u64, item_size: u64) -> (bool, u64, u64) {
    if num_items == 0 {
        (false, item_size, item_size)
    } else {
        let data_size = item_size + MESSAGE_HEADER_SIZE as u64;
        (true, data_size, data_size * num_items)
    }
}

pub struct EventBus {
    pid: i32,
    semid: libc::c_int,
    lock: SemRWLock,
    shm: SharedMem,
    fixed_width: bool,
    num_items: u64,
    item_size: u64,
    data_size: u64,
    buffer_size: u64,
    cursor: Mutex<Cursor>,
    resync_count: AtomicU64,
}

unsafe impl Send for EventBus {}
unsafe impl Sync for EventBus {}

impl EventBus {
    /// Open a bus identified by `path`, creating it (lazily, on first open)
    /// with `num_items` fixed-width slots of `item_size` bytes each, or, if
    /// `num_items == 0`, a variable-width ring of `item_size` bytes.
    pub fn open_path(path: &Path, num_items: u64, item_size: u64) -> Result<EventBus> {
        Self::open_path_impl(path, num_items, item_size, false)
    }

    /// Like [`open_path`](Self::open_path), but unconditionally re-zeroes an
    /// already-existing segment and reinitializes its lock semaphores, the
    /// way the CLI's `--init` flag does. Destructive to any data already on
    /// the bus; only meant for administrative use.
    pub fn reinit_path(path: &Path, num_items: u64, item_size: u64) -> Result<EventBus> {
        Self::open_path_impl(path, num_items, item_size, true)
    }

    fn open_path_impl(path: &Path, num_items: u64, item_size: u64, force_init: bool) -> Result<EventBus> {
        if !path.exists() {
            return Err(BusError::BadArg(format!(
                "path {} does not exist; provide an empty file to derive IPC keys from",
                path.display()
            )));
        }
        let (sem_key, shm_key) = crate::shm::derive_keys(path)?;
        Self::open_keys_impl(sem_key, shm_key, num_items, item_size, force_init)
    }

    /// Open a bus directly by its two IPC keys.
    pub fn open_keys(
        sem_key: libc::key_t,
        shm_key: libc::key_t,
        num_items: u64,
        item_size: u64,
    ) -> Result<EventBus> {
        Self::open_keys_impl(sem_key, shm_key, num_items, item_size, false)
    }

    fn open_keys_impl(
        sem_key: libc::key_t,
        shm_key: libc::key_t,
        num_items: u64,
        item_size: u64,
        force_init: bool,
    ) -> Result<EventBus> {
        let pid = unsafe { libc::getpid() };

        let mut force_init = force_init;
        let semid = semlock::acquire_semaphores(sem_key, &mut force_init)?;
        let lock = SemRWLock::new(semid, 1);

        let (mut fixed_width, mut data_size, mut buffer_size) = dimensions(num_items, item_size);
        let mut num_items = num_items;
        let mut item_size = item_size;

        let shm = SharedMem::acquire(shm_key, buffer_size as usize, HEADER_BYTES, &mut force_init)?;

        let header = shm.base() as *mut BusHeader;
        if force_init {
            tracing::info!(sem_key, shm_key, num_items, item_size, "force-initializing bus");
            unsafe { std::ptr::write_bytes(shm.base(), 0, shm.size()) };
            unsafe {
                std::ptr::write_volatile(&mut (*header).num_items, num_items);
                std::ptr::write_volatile(&mut (*header).item_size, item_size);
            }
            lock.init()?;
        } else {
            num_items = unsafe { std::ptr::read_volatile(&(*header).num_items) };
            item_size = unsafe { std::ptr::read_volatile(&(*header).item_size) };
            let dims = dimensions(num_items, item_size);
            fixed_width = dims.0;
            data_size = dims.1;
            buffer_size = dims.2;
        }

        lock.read_lock()?;
        let initial = Cursor {
            head: unsafe { std::ptr::read_volatile(&(*header).head) },
            last_serial: unsafe { std::ptr::read_volatile(&(*header).serial) },
        };
        lock.unlock()?;

        Ok(EventBus {
            pid,
            semid,
            lock,
            shm,
            fixed_width,
            num_items,
            item_size,
            data_size,
            buffer_size,
            cursor: Mutex::new(initial),
            resync_count: AtomicU64::new(0),
        })
    }

    #[inline]
    fn header(&self) -> *mut BusHeader {
        self.shm.base() as *mut BusHeader
    }

    #[inline]
    fn read_head(&self) -> u64 {
        unsafe { std::ptr::read_volatile(&(*self.header()).head) }
    }

    #[inline]
    fn write_head(&self, v: u64) {
        unsafe { std::ptr::write_volatile(&mut (*self.header()).head, v) }
    }

    #[inline]
    fn read_serial(&self) -> u64 {
        unsafe { std::ptr::read_volatile(&(*self.header()).serial) }
    }

    #[inline]
    fn write_serial(&self, v: u64) {
        unsafe { std::ptr::write_volatile(&mut (*self.header()).serial, v) }
    }

    /// Number of times this handle has had to scan for a resync point in
    /// variable-width mode, exposed for diagnosis.
    pub fn resync_count(&self) -> u64 {
        self.resync_count.load(Ordering::Relaxed)
    }

    /// Unsynchronized scratch space past the bus's own header fields, for a
    /// caller-defined small shared state. No locking discipline is imposed;
    /// callers must coordinate externally.
    pub unsafe fn extra_header_area(&self) -> *mut [u8] {
        let avail = HEADER_BYTES - BUS_HEADER_FIELDS_SIZE;
        std::ptr::slice_from_raw_parts_mut(self.shm.base().add(BUS_HEADER_FIELDS_SIZE), avail)
    }

    pub fn dump(&self) {
        let val = unsafe { libc::semctl(self.semid, semlock::SEM_NOTIFY as libc::c_int, libc::GETVAL) };
        tracing::info!(value = val, "notification semaphore state");
        self.lock.dump();
    }

    /// Reinitialize the RW-lock semaphores without touching the ring
    /// contents. Used only by the CLI's `--init-locks`.
    pub fn init_locks(&self) -> Result<()> {
        self.lock.init()
    }

    /// Test-only: override the pid this handle stamps into posted frames and
    /// filters on when reading, so tests for multi-process delivery don't
    /// need to actually spawn a second process.
    #[cfg(test)]
    pub(crate) fn set_pid_for_test(&mut self, pid: i32) {
        self.pid = pid;
    }

    /// Detach the shared-memory segment and drop the lock handle. Never
    /// removes the underlying kernel objects — only `--rm` does that.
    pub fn close(self) {
        tracing::debug!("closing bus handle");
    }

    // ---- write side --------------------------------------------------

    pub fn post(&self, payload: impl AsRef<[u8]>) -> bool {
        self.try_post(payload)
            .inspect_err(|err| tracing::warn!(%err, "post failed"))
            .is_ok()
    }

    pub fn post_many(&self, payloads: &[impl AsRef<[u8]>]) -> bool {
        if let Err(err) = self.lock.write_lock() {
            tracing::error!(%err, "failed to take write lock");
            return false;
        }
        let mut any_posted = false;
        for payload in payloads {
            match self.write_one(payload.as_ref()) {
                Ok(()) => any_posted = true,
                Err(err) => tracing::warn!(%err, "dropping oversized payload from batch"),
            }
        }
        if let Err(err) = self.lock.unlock() {
            tracing::error!(%err, "failed to release write lock");
        }
        if any_posted {
            if let Err(err) = semlock::pulse_notify(self.semid) {
                tracing::error!(%err, "failed to pulse notification semaphore");
            }
        }
        any_posted
    }

    /// Fallible variant of [`post`](Self::post): carries the reason a post
    /// was rejected (oversized payload) instead of collapsing it to `false`.
    pub fn try_post(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        let payload = payload.as_ref();
        self.lock.write_lock()?;
        let result = self.write_one(payload);
        self.lock.unlock()?;
        if result.is_ok() {
            semlock::pulse_notify(self.semid)?;
        }
        result
    }

    /// Runs under the write lock: validates size, assigns the next serial,
    /// and writes the frame + payload.
    fn write_one(&self, payload: &[u8]) -> Result<()> {
        let length = payload.len() as u64;
        if self.fixed_width {
            if length > self.item_size {
                return Err(BusError::TooLarge { len: payload.len(), limit: self.item_size as usize });
            }
        } else if length + MESSAGE_HEADER_SIZE as u64 > self.buffer_size {
            return Err(BusError::TooLarge { len: payload.len(), limit: self.buffer_size as usize });
        }

        let serial = self.read_serial() + 1;
        self.write_serial(serial);
        let frame = MessageHeader::new(serial, self.pid, length);

        if self.fixed_width {
            let head = (self.read_head() + 1) % self.num_items;
            self.write_head(head);
            let slot = unsafe { self.shm.data().add((self.data_size * head) as usize) };
            unsafe {
                std::ptr::copy_nonoverlapping(frame.as_bytes().as_ptr(), slot, MESSAGE_HEADER_SIZE);
                std::ptr::copy_nonoverlapping(payload.as_ptr(), slot.add(MESSAGE_HEADER_SIZE), payload.len());
            }
        } else {
            self.rb_write(frame.as_bytes());
            self.rb_write(payload);
            let aligned = align_up_8(self.read_head(), self.buffer_size);
            self.write_head(aligned);
        }
        Ok(())
    }

    /// Write `bytes` starting at the current head, splitting the copy
    /// across the wrap point if needed, and advance the head.
    fn rb_write(&self, bytes: &[u8]) {
        let start = self.read_head() as usize;
        let buffer_size = self.buffer_size as usize;
        let data = self.shm.data();
        if start + bytes.len() <= buffer_size {
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(start), bytes.len()) };
        } else {
            let chunk0 = buffer_size - start;
            let chunk1 = bytes.len() - chunk0;
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(start), chunk0);
                std::ptr::copy_nonoverlapping(bytes.as_ptr().add(chunk0), data, chunk1);
            }
        }
        let new_head = ((start + bytes.len()) % buffer_size.max(1)) as u64;
        self.write_head(new_head);
    }

    /// Read `bytes` starting at `offset`, splitting across the wrap point if
    /// needed. Returns the offset immediately after the read region.
    fn rb_read(&self, offset: u64, bytes: usize, dst: &mut [u8]) -> u64 {
        let start = offset as usize;
        let buffer_size = self.buffer_size as usize;
        let data = self.shm.data();
        if start + bytes <= buffer_size {
            unsafe { std::ptr::copy_nonoverlapping(data.add(start), dst.as_mut_ptr(), bytes) };
        } else {
            let chunk0 = buffer_size - start;
            let chunk1 = bytes - chunk0;
            unsafe {
                std::ptr::copy_nonoverlapping(data.add(start), dst.as_mut_ptr(), chunk0);
                std::ptr::copy_nonoverlapping(data, dst.as_mut_ptr().add(chunk0), chunk1);
            }
        }
        ((start + bytes) % buffer_size.max(1)) as u64
    }

    // ---- read side -----------------------------------------------------

    pub fn get(&self) -> Vec<u8> {
        self.get_inner(false).unwrap_or_default()
    }

    pub fn get_head(&self) -> Vec<u8> {
        self.get_inner(true).unwrap_or_default()
    }

    fn get_inner(&self, skip_to_head: bool) -> Result<Vec<u8>> {
        loop {
            self.lock.read_lock()?;
            if let Err(err) = self.wait_for_new_data() {
                return Err(err);
            }
            let mut cursor = self.cursor.lock().unwrap();
            if skip_to_head {
                self.move_to_head(&mut cursor);
            }
            let delivered = self.read_one(&mut cursor);
            drop(cursor);
            self.lock.unlock()?;
            if let Some(payload) = delivered {
                return Ok(payload);
            }
        }
    }

    pub fn get_many(&self) -> Vec<Vec<u8>> {
        self.get_many_inner().unwrap_or_default()
    }

    fn get_many_inner(&self) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        while out.is_empty() {
            self.lock.read_lock()?;
            self.wait_for_new_data()?;
            loop {
                let mut cursor = self.cursor.lock().unwrap();
                if self.read_serial() == cursor.last_serial {
                    break;
                }
                let old_head = cursor.head;
                let delivered = self.read_one(&mut cursor);
                let advanced = cursor.head != old_head;
                drop(cursor);
                if let Some(payload) = delivered {
                    out.push(payload);
                }
                if !advanced {
                    // Not making progress (resync found nothing useful); stop
                    // spinning and return whatever we have.
                    break;
                }
            }
            self.lock.unlock()?;
        }
        Ok(out)
    }

    /// Release/reacquire the read lock around the notification wait until
    /// `header.serial != cursor.last_serial`.
    fn wait_for_new_data(&self) -> Result<()> {
        loop {
            let current = self.read_serial();
            let last = self.cursor.lock().unwrap().last_serial;
            if current != last {
                return Ok(());
            }
            self.lock.unlock()?;
            semlock::wait_for_notification(self.semid)?;
            self.lock.read_lock()?;
        }
    }

    /// Attempt to deliver one message at the cursor's current position,
    /// always advancing the cursor regardless of delivery.
    fn read_one(&self, cursor: &mut Cursor) -> Option<Vec<u8>> {
        if self.fixed_width {
            self.read_one_fixed(cursor)
        } else {
            match self.read_one_variable(cursor) {
                Ok(delivered) => delivered,
                Err(err) => {
                    tracing::warn!(%err, "giving up on this frame");
                    None
                }
            }
        }
    }

    fn read_one_fixed(&self, cursor: &mut Cursor) -> Option<Vec<u8>> {
        let slot = unsafe { self.shm.data().add((self.data_size * cursor.head) as usize) };
        let mut header_bytes = vec![0u8; MESSAGE_HEADER_SIZE];
        unsafe { std::ptr::copy_nonoverlapping(slot, header_bytes.as_mut_ptr(), MESSAGE_HEADER_SIZE) };
        let msg = MessageHeader::from_bytes(&header_bytes);

        let mut result = None;
        if msg.serial > cursor.last_serial {
            cursor.last_serial = msg.serial;
            if msg.pid != self.pid && msg.length <= self.item_size {
                let mut payload = vec![0u8; msg.length as usize + 1];
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        slot.add(MESSAGE_HEADER_SIZE),
                        payload.as_mut_ptr(),
                        msg.length as usize,
                    );
                }
                result = Some(payload);
            }
        }
        cursor.head = (cursor.head + 1) % self.num_items;
        result
    }

    fn read_one_variable(&self, cursor: &mut Cursor) -> Result<Option<Vec<u8>>> {
        let mut attempts = 0;
        loop {
            let mut header_bytes = vec![0u8; MESSAGE_HEADER_SIZE];
            let after_header = self.rb_read(cursor.head, MESSAGE_HEADER_SIZE, &mut header_bytes);
            let msg = MessageHeader::from_bytes(&header_bytes);

            if msg.magic != crate::frame::MAGIC {
                let offset = cursor.head as usize;
                cursor.head = self.rb_resync(cursor.head);
                attempts += 1;
                if attempts >= 2 {
                    return Err(BusError::LostSync { offset });
                }
                continue;
            }

            let mut result = None;
            if msg.serial > cursor.last_serial {
                cursor.last_serial = msg.serial;
                if msg.pid != self.pid && msg.length < self.buffer_size {
                    let mut payload = vec![0u8; msg.length as usize + 1];
                    self.rb_read(after_header, msg.length as usize, &mut payload[..msg.length as usize]);
                    result = Some(payload);
                }
            }
            cursor.head = align_up_8(after_header + msg.length, self.buffer_size);
            return Ok(result);
        }
    }

    /// Scan forward 8 bytes at a time looking for a valid frame magic.
    /// Gives up and resets to `header.head` if the scan wraps all the way
    /// around without finding one.
    fn rb_resync(&self, head: u64) -> u64 {
        self.resync_count.fetch_add(1, Ordering::Relaxed);
        if head % 8 != 0 {
            tracing::error!(head, "resync entered with a misaligned cursor");
            return self.read_head();
        }
        let mut cur = (head + 8) % self.buffer_size.max(1);
        while cur != head {
            let mut magic_bytes = [0u8; 8];
            self.rb_read(cur, 8, &mut magic_bytes);
            if u64::from_ne_bytes(magic_bytes) == crate::frame::MAGIC {
                return cur;
            }
            cur = (cur + 8) % self.buffer_size.max(1);
        }
        self.read_head()
    }

    /// Variable-width mode only: walk the cursor forward to the last frame
    /// deliverable to this consumer, so the next `read_one` delivers just
    /// that message. Fixed-width mode has no equivalent in the original
    /// implementation.
    fn move_to_head(&self, cursor: &mut Cursor) {
        if self.fixed_width {
            tracing::warn!("skip_to_head is unimplemented in fixed-width mode");
            return;
        }
        let mut valid_head: Option<u64> = None;
        let mut valid_serial = 0u64;
        let mut cur_head = cursor.head;
        let mut cur_serial = cursor.last_serial;
        let mut attempts = 0;

        while self.read_serial() != cur_serial && attempts < 2 {
            let mut header_bytes = vec![0u8; MESSAGE_HEADER_SIZE];
            let after_header = self.rb_read(cur_head, MESSAGE_HEADER_SIZE, &mut header_bytes);
            let msg = MessageHeader::from_bytes(&header_bytes);
            if msg.magic != crate::frame::MAGIC {
                cur_head = self.rb_resync(cur_head);
                attempts += 1;
                continue;
            }
            if msg.serial > cur_serial {
                cur_serial = msg.serial;
                if msg.pid != self.pid && msg.length < self.buffer_size {
                    valid_head = Some(cur_head);
                    valid_serial = msg.serial - 1;
                }
            }
            cur_head = align_up_8(after_header + msg.length, self.buffer_size);
        }

        if let Some(head) = valid_head {
            cursor.head = head;
            cursor.last_serial = valid_serial;
        } else {
            cursor.head = cur_head;
            cursor.last_serial = cur_serial;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn teardown(path: &Path) {
        if let Ok((sem_key, shm_key)) = crate::shm::derive_keys(path) {
            let _ = SharedMem::destroy(shm_key);
            let id = unsafe { libc::semget(sem_key, 0, 0) };
            if id >= 0 {
                unsafe { libc::semctl(id, 0, libc::IPC_RMID) };
            }
        }
    }

    #[test]
    fn fixed_width_round_trip_across_distinct_pids() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();

        let producer = EventBus::open_path(path, 4, 32).unwrap();
        let mut consumer = EventBus::open_path(path, 4, 32).unwrap();
        consumer.pid = producer.pid + 1;

        assert!(producer.post(b"hello"));

        // The consumer's cursor was snapshotted at open time, before the
        // post landed in slot 1: the first call walks past the still-empty
        // slot 0, and the second delivers the posted message.
        consumer.lock.read_lock().unwrap();
        let mut cursor = Cursor::default();
        let skipped = consumer.read_one(&mut cursor);
        let delivered = consumer.read_one(&mut cursor);
        consumer.lock.unlock().unwrap();

        assert_eq!(skipped, None);
        assert_eq!(delivered.as_deref(), Some(&b"hello\0"[..]));
        teardown(path);
    }

    #[test]
    fn messages_from_own_pid_are_never_delivered() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();
        // Variable-width mode starts writing at offset 0, so a cursor
        // default-initialized at (0, 0) lands exactly on the frame this bus
        // posts itself, with no write-head offset to account for.
        let bus = EventBus::open_path(path, 0, 64).unwrap();

        assert!(bus.post(b"echo"));

        bus.lock.read_lock().unwrap();
        let mut cursor = Cursor::default();
        let delivered = bus.read_one(&mut cursor);
        bus.lock.unlock().unwrap();

        assert_eq!(delivered, None);
        assert_eq!(cursor.last_serial, 1, "cursor still advances past a filtered message");
        teardown(path);
    }

    #[test]
    fn fixed_width_overwrite_keeps_most_recent_message_at_head() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();

        let producer = EventBus::open_path(path, 4, 8).unwrap();
        let mut consumer = EventBus::open_path(path, 4, 8).unwrap();
        consumer.pid = producer.pid + 1;

        for label in [b"a".as_slice(), b"b", b"c", b"d", b"e"] {
            assert!(producer.post(label));
        }

        // Five posts into a 4-slot ring wrap exactly once: header.head must
        // point at the slot holding "e", the most recent post.
        let head = producer.read_head();
        let slot = unsafe { producer.shm.data().add((producer.data_size * head) as usize) };
        let mut header_bytes = vec![0u8; MESSAGE_HEADER_SIZE];
        unsafe { std::ptr::copy_nonoverlapping(slot, header_bytes.as_mut_ptr(), MESSAGE_HEADER_SIZE) };
        let msg = MessageHeader::from_bytes(&header_bytes);
        let mut payload = vec![0u8; msg.length as usize];
        unsafe { std::ptr::copy_nonoverlapping(slot.add(MESSAGE_HEADER_SIZE), payload.as_mut_ptr(), msg.length as usize) };
        assert_eq!(payload, b"e");

        // A consumer that started reading before any post sees a subsequence
        // with strictly increasing serials that never includes "a": its slot
        // was overwritten by the wraparound before the cursor could reach it.
        consumer.lock.read_lock().unwrap();
        let mut cursor = Cursor::default();
        let mut delivered = Vec::new();
        let mut last_serial = 0u64;
        for _ in 0..4 {
            if let Some(payload) = consumer.read_one(&mut cursor) {
                assert!(cursor.last_serial > last_serial, "serials must strictly increase");
                last_serial = cursor.last_serial;
                delivered.push(payload);
            }
        }
        consumer.lock.unlock().unwrap();

        assert!(!delivered.is_empty(), "at least one surviving slot must still be deliverable");
        assert!(!delivered.contains(&b"a\0".to_vec()), "the overwritten first post must never be observed");
        assert_eq!(delivered.last(), Some(&b"e\0".to_vec()), "the most recent post must be the last one delivered");
        teardown(path);
    }

    #[test]
    fn get_head_returns_only_the_latest_deliverable_message() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();

        let producer = EventBus::open_path(path, 0, 256).unwrap();
        let mut consumer = EventBus::open_path(path, 0, 256).unwrap();
        consumer.pid = producer.pid + 1;

        for label in [b"first".as_slice(), b"second", b"third"] {
            assert!(producer.post(label));
        }

        assert_eq!(consumer.get_head(), b"third\0");
        teardown(path);
    }

    #[test]
    fn close_consumes_the_handle_without_panicking() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();
        let bus = EventBus::open_path(path, 4, 8).unwrap();
        assert!(bus.post(b"x"));
        bus.close();
        teardown(path);
    }

    #[test]
    fn oversized_payload_is_rejected_in_fixed_width_mode() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();
        let bus = EventBus::open_path(path, 4, 8).unwrap();

        let err = bus.try_post(b"this payload is far too long for an 8 byte slot").unwrap_err();
        assert!(matches!(err, BusError::TooLarge { .. }));
        assert!(!bus.post(b"also too long for the configured slot size"));
        teardown(path);
    }

    #[test]
    fn variable_width_wraps_and_resyncs_on_overwritten_frames() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();

        let producer = EventBus::open_path(path, 0, 96).unwrap();
        let mut consumer = EventBus::open_path(path, 0, 96).unwrap();
        consumer.pid = producer.pid + 1;

        for i in 0..6u8 {
            let payload = [i; 20];
            assert!(producer.post(&payload));
        }

        // The 96-byte ring is far smaller than six 20-byte-plus-header frames,
        // so a cursor still parked at byte 0 is reading stale, overwritten
        // frames and must resync at least once.
        consumer.lock.read_lock().unwrap();
        let mut cursor = Cursor::default();
        let mut resynced = false;
        let mut delivered_payloads = Vec::new();
        for _ in 0..8 {
            match consumer.read_one_variable(&mut cursor) {
                Ok(Some(payload)) => delivered_payloads.push(payload),
                Ok(None) => {}
                Err(BusError::LostSync { .. }) => resynced = true,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        consumer.lock.unlock().unwrap();

        assert!(resynced, "expected at least one lost-sync resync while reading a wrapped ring");
        assert!(consumer.resync_count() > 0);
        assert!(!delivered_payloads.is_empty(), "expected at least one message to survive the wraparound");
        for payload in &delivered_payloads {
            // Every byte of a posted payload is the same value, so the first
            // byte identifies which of the 6 posts this is; the frame must
            // decode back to exactly that, NUL terminator included.
            let value = payload[0];
            assert!(value < 6, "payload byte out of the posted range: {value}");
            let mut expected = vec![value; 20];
            expected.push(0);
            assert_eq!(payload, &expected, "delivered payload bytes must match what was posted exactly");
        }
        teardown(path);
    }

    #[test]
    fn variable_width_get_many_returns_byte_exact_payloads_in_order_after_wrap() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path();

        // 40-byte header + 40-byte payload = 80 bytes per frame; a 320-byte
        // ring holds exactly 4 frames, so posting 8 wraps the ring exactly
        // once and only the last 4 survive.
        let producer = EventBus::open_path(path, 0, 320).unwrap();
        let mut consumer = EventBus::open_path(path, 0, 320).unwrap();
        consumer.pid = producer.pid + 1;

        let payloads: Vec<[u8; 40]> = (0..8u8).map(|i| [100 + i; 40]).collect();
        for payload in &payloads {
            assert!(producer.post(payload));
        }

        let delivered = consumer.get_many();

        assert_eq!(delivered.len(), 4, "only the last 4 of 8 posts fit in a 4-frame ring");
        for (offset, msg) in delivered.iter().enumerate() {
            let expected_value = 100 + (4 + offset) as u8;
            assert_eq!(&msg[..40], &[expected_value; 40][..], "payload bytes must match what was posted exactly");
            assert_eq!(msg[40], 0, "payload is NUL-terminated like fixed-width slots");
        }
        teardown(path);
    }

    #[test]
    fn align_up_8_rounds_and_wraps() {
        assert_eq!(align_up_8(0, 64), 0);
        assert_eq!(align_up_8(1, 64), 8);
        assert_eq!(align_up_8(8, 64), 8);
        assert_eq!(align_up_8(60, 64), 0);
    }
}
