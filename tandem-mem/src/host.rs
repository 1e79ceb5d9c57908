//! Thin wrappers around the host virtual-memory primitives used by the
//! fastmem arena: an anonymous shared-memory object for the physical backing
//! store, PROT_NONE address-space reservations for the per-CPU windows, and
//! fixed-address aliasing of backing sub-ranges into those windows.

use std::io;

/// Anonymous shared-memory object holding the physical backing store.
pub struct Backing {
    fd: libc::c_int,
    size: usize,
}

impl Backing {
    #[cfg(target_os = "linux")]
    fn create_fd() -> io::Result<libc::c_int> {
        let fd = unsafe { libc::memfd_create(c"tandem-fastmem".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    #[cfg(not(target_os = "linux"))]
    fn create_fd() -> io::Result<libc::c_int> {
        let name = std::ffi::CString::new(format!("/tandem-fastmem-{}", std::process::id()))
            .expect("shm name contains no interior NUL");
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::shm_unlink(name.as_ptr()) };
        Ok(fd)
    }

    pub fn create(size: usize) -> io::Result<Backing> {
        let fd = Self::create_fd()?;
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Backing { fd, size })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// A contiguous reserved range of host address space. Reserved ranges are
/// inaccessible until sub-ranges are aliased into them with [`map_fixed`].
pub struct Reservation {
    ptr: *mut u8,
    size: usize,
}

impl Reservation {
    pub fn reserve(size: usize) -> io::Result<Reservation> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Reservation { ptr: ptr.cast(), size })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr.cast(), self.size) };
    }
}

/// A read/write view of the whole backing store, used for ordinary (non
/// fastmem) access to guest memory by the rest of the emulator.
pub struct View {
    ptr: *mut u8,
    size: usize,
}

impl View {
    pub fn map(backing: &Backing) -> io::Result<View> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                backing.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                backing.fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(View { ptr: ptr.cast(), size: backing.size })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for View {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr.cast(), self.size) };
    }
}

/// Alias `size` bytes of the backing store, starting at `offset`, at the fixed
/// host address `at`.
///
/// # Safety
///
/// `at..at + size` must lie entirely within a live [`Reservation`], and
/// `offset + size` within the backing object. Page alignment of all three
/// values is required by the host.
pub unsafe fn map_fixed(
    at: *mut u8,
    backing: &Backing,
    offset: usize,
    size: usize,
) -> io::Result<()> {
    let ptr = libc::mmap(
        at.cast(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_FIXED,
        backing.fd,
        offset as libc::off_t,
    );
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    debug_assert_eq!(ptr.cast::<u8>(), at);
    Ok(())
}

/// Return `at..at + size` to the inaccessible reserved state.
///
/// # Safety
///
/// Same range requirements as [`map_fixed`]. Mapping over the range rather
/// than unmapping it keeps the reservation hole-free.
pub unsafe fn unmap_fixed(at: *mut u8, size: usize) -> io::Result<()> {
    let ptr = libc::mmap(
        at.cast(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
