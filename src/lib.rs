mod file_backed_mapper;
mod free_tree;
mod header;
mod heap;
mod map;
mod mapper;
mod queue;
mod region;
mod reservation;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_allocation_map;
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_span_map;

use std::ffi::c_void;
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::sync::Mutex;

pub use file_backed_mapper::set_file_backed_heap_directory;
pub use heap::Heap;
pub use mapper::register_mapper;
pub use mapper::Mapper;
pub use queue::MpscQueue;
pub use queue::QueueNode;

lazy_static::lazy_static! {
    // The process-wide heap behind the C entry points.  The mutex
    // provides the exclusive access the single-threaded heap
    // demands; tests thread `Heap` handles directly instead.
    static ref GLOBAL_HEAP: Mutex<Heap> = Mutex::new(Heap::new());
}

/// Allocates `size` bytes at the natural maximal alignment, or
/// returns NULL.
#[no_mangle]
pub extern "C" fn quarry_allocate(size: usize) -> *mut c_void {
    let mut heap = GLOBAL_HEAP.lock().unwrap();

    heap.allocate(size)
        .map(NonNull::as_ptr)
        .unwrap_or(std::ptr::null_mut())
}

/// Allocates `size` bytes at a multiple of `align`, or returns NULL;
/// `align` must be a power of two.
#[no_mangle]
pub extern "C" fn quarry_aligned_allocate(align: usize, size: usize) -> *mut c_void {
    let mut heap = GLOBAL_HEAP.lock().unwrap();

    heap.aligned_allocate(align, size)
        .map(NonNull::as_ptr)
        .unwrap_or(std::ptr::null_mut())
}

/// Returns an allocation to the global heap.  NULL is a no-op.
///
/// # Safety
///
/// This function assumes `ptr` is NULL or was returned by
/// `quarry_allocate` / `quarry_aligned_allocate` and not yet freed.
#[no_mangle]
pub unsafe extern "C" fn quarry_deallocate(ptr: *mut c_void) {
    if let Some(ptr) = NonNull::new(ptr) {
        GLOBAL_HEAP.lock().unwrap().deallocate(ptr);
    }
}

/// Updates the directory for the file-backed mapper's temporary
/// files.
///
/// NULL reverts to the default temporary directory.
///
/// # Safety
///
/// This function assumes `path` is NULL or valid.
#[no_mangle]
pub unsafe extern "C" fn quarry_set_file_backed_heap_directory(path: *const c_char) {
    use std::ffi::CStr;

    if path.is_null() {
        set_file_backed_heap_directory(None);
        return;
    }

    let path_str = CStr::from_ptr(path)
        .to_str()
        .expect("path must be valid")
        .to_owned();
    set_file_backed_heap_directory(Some(path_str.into()));
}
