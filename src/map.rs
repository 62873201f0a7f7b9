//! Thin wrappers around the POSIX memory mapping calls.  Address
//! space is reserved with `PROT_NONE` mappings, committed with
//! `mprotect`, and released with `munmap`.
use std::ffi::c_void;
use std::fs::File;
use std::ptr::NonNull;

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", last_errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Attempts to reserve an *address space* region of `size` bytes.
///
/// The reservation is inaccessible until committed; the `size`
/// argument must be a multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        return Err(last_errno());
    }

    NonNull::new(base as *mut c_void).ok_or_else(last_errno)
}

/// Releases a region of `size` bytes starting at `base`.
///
/// Both arguments must be multiples of the page size.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0 && (base.as_ptr() as usize % page_size()) == 0,
        "Bad region base={:?} size={} page_size={}",
        base,
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr() as *mut _, size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(last_errno())
    }
}

/// Backs a reserved region of `size` bytes starting at `base` with
/// (demand-faulted, zero-filled) memory.
///
/// Both arguments must be multiples of the page size.
pub fn commit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0 && (base.as_ptr() as usize % page_size()) == 0,
        "Bad region base={:?} size={} page_size={}",
        base,
        size,
        page_size()
    );

    let ret = unsafe {
        libc::mprotect(
            base.as_ptr() as *mut _,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };

    if ret == 0 {
        Ok(())
    } else {
        Err(last_errno())
    }
}

/// Backs a reserved region of `size` bytes starting at `base` with a
/// shared mapping of `file`.  The file is grown to `size` bytes; the
/// mapping keeps it alive once this function returns.
///
/// Fresh file pages read back as zero, so the committed range is
/// zero-filled just like anonymous commits.
pub fn commit_file_region(file: File, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    use std::os::unix::io::AsRawFd;

    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0 && (base.as_ptr() as usize % page_size()) == 0,
        "Bad region base={:?} size={} page_size={}",
        base,
        size,
        page_size()
    );

    file.set_len(size as u64)
        .map_err(|e| e.raw_os_error().unwrap_or(0))?;

    let ret = unsafe {
        libc::mmap(
            base.as_ptr() as *mut _,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        return Err(last_errno());
    }

    Ok(())
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);

    // Pages are always a power of two.
    assert_eq!(page_size() & (page_size() - 1), 0);
}

// Reserve a large range, commit a few sub-ranges, trim the slop, and
// release everything: the workflow the reservation module relies on.
#[test]
fn smoke_test() {
    let region_size = 1usize << 20;
    let mut base = reserve_region(3 * region_size).expect("reserve should succeed");

    assert!(region_size > 3 * page_size());

    // We overallocated `base` by 3x.  Drop the bottom and top
    // `region_size` bytes from the range.
    release_region(base, region_size).expect("should release the bottom slop");
    base = NonNull::new((base.as_ptr() as usize + region_size) as *mut c_void)
        .expect("Should be non-null");

    let top_slop = NonNull::new((base.as_ptr() as usize + region_size) as *mut c_void)
        .expect("Should be non-null");
    release_region(top_slop, region_size).expect("should release the top slop");

    // Commit the first page and the tail of the surviving range,
    // leaving an uncommitted gap in between.
    let bottom = base;
    let remainder = NonNull::new((base.as_ptr() as usize + 2 * page_size()) as *mut c_void)
        .expect("Should be non-null");

    commit_region(bottom, page_size()).expect("should commit bottom");
    commit_region(remainder, region_size - 2 * page_size()).expect("should commit remainder");

    // Committed pages must read back as zero and accept writes.
    unsafe {
        let bytes = bottom.as_ptr() as *mut u8;
        assert_eq!(std::ptr::read(bytes), 0);
        std::ptr::write(bytes, 42);
        assert_eq!(std::ptr::read(bytes), 42);
    }

    release_region(base, region_size).expect("should release everything");
}

#[test]
fn file_backed_smoke_test() {
    let size = 4 * page_size();
    let base = reserve_region(size).expect("reserve should succeed");

    let file = tempfile::tempfile().expect("tempfile should open");
    commit_file_region(file, base, size).expect("should commit the file mapping");

    unsafe {
        let bytes = base.as_ptr() as *mut u8;
        assert_eq!(std::ptr::read(bytes), 0);
        std::ptr::write(bytes.add(size - 1), 42);
        assert_eq!(std::ptr::read(bytes.add(size - 1)), 42);
    }

    release_region(base, size).expect("should release the mapping");
}
