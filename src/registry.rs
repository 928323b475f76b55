//! POSIX shared-memory registry: named regions that let a consumer in one
//! process address a Pipeline or Target owned by another process's daemon,
//! by key rather than by pointer. Only value-typed fields are ever written
//! into a region; no in-process handle (GStreamer element, file descriptor)
//! crosses the boundary. A process that reads a region back re-resolves any
//! live object it needs through the IPC layer, never by dereferencing a
//! pointer found in shm.
//!
//! Mirrors the original's four operations per entity (`new`, `read`,
//! `close`, `unmap`) plus a parallel set for the robust process-shared
//! mutex that guards each region.

use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::fd::FromRawFd;
use std::os::unix::io::RawFd;

use memmap2::MmapMut;

use crate::error::{Result, StreamError};

fn shm_name_for_pipeline(prefix: &str, node_id: u32) -> String {
    format!("/{prefix}_{node_id}")
}

fn shm_name_for_target(prefix: &str, uri_hash: u32, node_id: u32) -> String {
    format!("/{prefix}_{uri_hash}_{node_id}")
}

fn shm_name_for_mutex(prefix: &str, node_id: u32) -> String {
    format!("/{prefix}_{node_id}_mtx")
}

/// Value-only, fixed-layout deep copy of a Pipeline's descriptor fields.
/// Handle fields from the live object (the GStreamer elements, the tee) are
/// deliberately absent — there is nothing for them to deserialize into in
/// another process.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PipelineDescriptor {
    pub node_id: u32,
    pub source_kind: u32,
    pub resolution_width: u32,
    pub resolution_height: u32,
    pub framerate: i32,
    pub target_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TargetDescriptor {
    pub id: u32,
    pub kind: u32,
    pub codec: u32,
    pub bitrate: u32,
    pub bitrate_actual: u32,
    pub quantizer: u32,
    pub srt_mode: u32,
    pub caller_count: u32,
}

/// A mapped, named shm region holding one `T`. Dropping this does not
/// unlink the region — multiple processes may still hold it open; call
/// `close` explicitly once the entity is torn down.
pub struct ShmRegion<T> {
    name: String,
    fd: RawFd,
    map: MmapMut,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Copy> ShmRegion<T> {
    fn open_raw(name: &str, create: bool) -> io::Result<RawFd> {
        let c_name = CString::new(name).expect("shm name has no interior NUL");
        let flags = if create {
            libc::O_CREAT | libc::O_RDWR
        } else {
            libc::O_RDWR
        };
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o666) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    /// `shm_open(O_CREAT|O_RDWR)`, `ftruncate(size_of::<T>())`,
    /// `mmap(PROT_WRITE, MAP_SHARED)`. Idempotent: calling `new` against a
    /// name that already exists just truncates it to the same size and
    /// remaps it.
    pub fn new(name: &str, initial: T) -> Result<ShmRegion<T>> {
        let fd = Self::open_raw(name, true).map_err(StreamError::Io)?;
        let size = size_of::<T>() as libc::off_t;
        if unsafe { libc::ftruncate(fd, size) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(StreamError::Io(err));
        }

        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(StreamError::Io)?;
        std::mem::forget(file); // fd ownership stays with this ShmRegion

        write_value(&mut map, &initial);

        Ok(ShmRegion {
            name: name.to_string(),
            fd,
            map,
            _marker: std::marker::PhantomData,
        })
    }

    /// `shm_open(O_RDWR)` against an existing region, `mmap`. Fails if the
    /// region was never created or was already unlinked.
    pub fn read(name: &str) -> Result<ShmRegion<T>> {
        let fd = Self::open_raw(name, false).map_err(StreamError::Io)?;
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(StreamError::Io)?;
        std::mem::forget(file);

        Ok(ShmRegion {
            name: name.to_string(),
            fd,
            map,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn get(&self) -> T {
        read_value(&self.map)
    }

    pub fn set(&mut self, value: &T) {
        write_value(&mut self.map, value);
    }

    /// Unmaps and `shm_unlink`s the region. Callers are expected to run
    /// their entity's own cleanup (e.g. `free_srt_resources`) before this.
    pub fn close(self) -> Result<()> {
        let name = self.name.clone();
        drop(self); // unmaps via Drop, closes fd
        let c_name = CString::new(name).expect("shm name has no interior NUL");
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            return Err(StreamError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl<T> Drop for ShmRegion<T> {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn write_value<T: Copy>(map: &mut MmapMut, value: &T) {
    let bytes =
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) };
    map[..bytes.len()].copy_from_slice(bytes);
}

fn read_value<T: Copy>(map: &MmapMut) -> T {
    unsafe { std::ptr::read(map.as_ptr() as *const T) }
}

/// A robust, process-shared mutex living in its own shm region. Unlike the
/// descriptor regions above, this one's layout (`pthread_mutex_t`) is
/// opaque and must never be read as a plain value by Rust code; all access
/// goes through `lock`/`unlock`.
pub struct ShmMutex {
    fd: RawFd,
    ptr: *mut libc::pthread_mutex_t,
    name: String,
}

// SAFETY: the mutex is PTHREAD_PROCESS_SHARED and all access is serialized
// by pthread itself; the Rust wrapper only exposes lock/unlock.
unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

impl ShmMutex {
    pub fn new(prefix: &str, node_id: u32) -> Result<ShmMutex> {
        let name = shm_name_for_mutex(prefix, node_id);
        let c_name = CString::new(name.clone()).unwrap();
        let size = size_of::<libc::pthread_mutex_t>() as libc::off_t;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(StreamError::Io(io::Error::last_os_error()));
        }
        if unsafe { libc::ftruncate(fd, size) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(StreamError::Io(err));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(StreamError::Io(err));
        }
        let ptr = ptr as *mut libc::pthread_mutex_t;

        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            libc::pthread_mutexattr_init(&mut attr);
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            libc::pthread_mutex_init(ptr, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
        }

        Ok(ShmMutex { fd, ptr, name })
    }

    /// Opens an existing mutex region without re-initializing it — used by
    /// a peer process that did not create the region.
    pub fn open_existing(prefix: &str, node_id: u32) -> Result<ShmMutex> {
        let name = shm_name_for_mutex(prefix, node_id);
        let c_name = CString::new(name.clone()).unwrap();
        let size = size_of::<libc::pthread_mutex_t>() as libc::off_t;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(StreamError::Io(io::Error::last_os_error()));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(StreamError::Io(err));
        }

        Ok(ShmMutex {
            fd,
            ptr: ptr as *mut libc::pthread_mutex_t,
            name,
        })
    }

    /// Acquires the lock. `EOWNERDEAD` (the prior holder's process died
    /// mid-hold) is treated as recoverable: the mutex is marked consistent
    /// and the caller proceeds as though the lock were acquired cleanly.
    pub fn lock(&self) -> Result<()> {
        let rc = unsafe { libc::pthread_mutex_lock(self.ptr) };
        if rc == 0 {
            return Ok(());
        }
        if rc == libc::EOWNERDEAD {
            let rc = unsafe { libc::pthread_mutex_consistent(self.ptr) };
            if rc != 0 {
                return Err(StreamError::IpcFailed(format!(
                    "pthread_mutex_consistent failed: {rc}"
                )));
            }
            return Ok(());
        }
        Err(StreamError::IpcFailed(format!(
            "pthread_mutex_lock failed: {rc}"
        )))
    }

    pub fn unlock(&self) -> Result<()> {
        let rc = unsafe { libc::pthread_mutex_unlock(self.ptr) };
        if rc != 0 {
            return Err(StreamError::IpcFailed(format!(
                "pthread_mutex_unlock failed: {rc}"
            )));
        }
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        let name = self.name.clone();
        drop(self);
        let c_name = CString::new(name).unwrap();
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            return Err(StreamError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for ShmMutex {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, size_of::<libc::pthread_mutex_t>());
            libc::close(self.fd);
        }
    }
}

/// Thin registry wrapper tying the naming convention to the operations
/// above, so callers in the daemons do not hand-format shm names.
#[derive(Clone)]
pub struct Registry {
    prefix: String,
}

impl Registry {
    pub fn new(prefix: impl Into<String>) -> Registry {
        Registry { prefix: prefix.into() }
    }

    pub fn pipeline_new(&self, node_id: u32, descriptor: PipelineDescriptor) -> Result<ShmRegion<PipelineDescriptor>> {
        ShmRegion::new(&shm_name_for_pipeline(&self.prefix, node_id), descriptor)
    }

    pub fn pipeline_read(&self, node_id: u32) -> Result<ShmRegion<PipelineDescriptor>> {
        ShmRegion::read(&shm_name_for_pipeline(&self.prefix, node_id))
    }

    pub fn target_new(&self, uri_hash: u32, node_id: u32, descriptor: TargetDescriptor) -> Result<ShmRegion<TargetDescriptor>> {
        ShmRegion::new(&shm_name_for_target(&self.prefix, uri_hash, node_id), descriptor)
    }

    pub fn target_read(&self, uri_hash: u32, node_id: u32) -> Result<ShmRegion<TargetDescriptor>> {
        ShmRegion::read(&shm_name_for_target(&self.prefix, uri_hash, node_id))
    }

    pub fn mutex_new(&self, node_id: u32) -> Result<ShmMutex> {
        ShmMutex::new(&self.prefix, node_id)
    }

    pub fn mutex_open(&self, node_id: u32) -> Result<ShmMutex> {
        ShmMutex::open_existing(&self.prefix, node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn unique_prefix(tag: &str) -> String {
        format!("streamgraph_test_{tag}_{}", std::process::id())
    }

    #[test]
    #[serial]
    fn pipeline_region_roundtrip() {
        let registry = Registry::new(unique_prefix("pipe"));
        let descriptor = PipelineDescriptor {
            node_id: 7,
            source_kind: 1,
            resolution_width: 1280,
            resolution_height: 720,
            framerate: 30,
            target_count: 0,
        };
        let region = registry.pipeline_new(7, descriptor).unwrap();
        assert_eq!(region.get().node_id, 7);

        let read_back = registry.pipeline_read(7).unwrap();
        assert_eq!(read_back.get().resolution_width, 1280);

        read_back.close().ok();
        region.close().ok();
    }

    #[test]
    #[serial]
    fn read_after_close_fails() {
        let registry = Registry::new(unique_prefix("closed"));
        let descriptor = PipelineDescriptor {
            node_id: 9,
            source_kind: 0,
            resolution_width: 640,
            resolution_height: 480,
            framerate: 30,
            target_count: 0,
        };
        let region = registry.pipeline_new(9, descriptor).unwrap();
        region.close().unwrap();

        assert!(registry.pipeline_read(9).is_err());
    }

    #[test]
    #[serial]
    fn mutex_lock_unlock_roundtrip() {
        let registry = Registry::new(unique_prefix("mtx"));
        let mtx = registry.mutex_new(3).unwrap();
        mtx.lock().unwrap();
        mtx.unlock().unwrap();
        mtx.close().ok();
    }
}
