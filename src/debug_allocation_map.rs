//! This module tracks the payload ranges handed out to the mutator
//! in contract builds.
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

struct AllocationInfo {
    size: usize,
    live: bool, // True if owned by the mutator
}

lazy_static::lazy_static! {
    static ref ALLOCATION_STATE_MAP: Mutex<BTreeMap<usize, AllocationInfo>> = Default::default();
}

/// Confirms that handing `[alloc, alloc + size)` to the mutator would
/// neither double-allocate nor overlap another live allocation.
pub fn can_be_allocated(alloc: &NonNull<c_void>, size: usize) -> Result<(), &'static str> {
    let map = ALLOCATION_STATE_MAP.lock().unwrap();
    let begin = alloc.as_ptr() as usize;

    if let Some((info_begin, info)) = map.range(0..=begin).last() {
        if info.live && info_begin + info.size > begin {
            return Err("allocation overlaps a live predecessor");
        }
    }

    if let Some((succ_begin, info)) = map.range((begin + 1)..).next() {
        if info.live && begin + size > *succ_begin {
            return Err("allocation overlaps a live successor");
        }
    }

    Ok(())
}

/// Marks `[alloc, alloc + size)` as returned to the mutator.
pub fn mark_allocated(alloc: &NonNull<c_void>, size: usize) -> Result<(), &'static str> {
    can_be_allocated(alloc, size)?;

    let mut map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map
        .entry(alloc.as_ptr() as usize)
        .or_insert(AllocationInfo { size, live: false });

    if info.live {
        return Err("double allocation");
    }

    info.size = size;
    info.live = true;
    Ok(())
}

/// Marks this allocation as released by the mutator.
pub fn mark_released(alloc: &NonNull<c_void>) -> Result<(), &'static str> {
    let mut map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map
        .get_mut(&(alloc.as_ptr() as usize))
        .ok_or("Released unknown address")?;

    if !info.live {
        return Err("double free");
    }

    info.live = false;
    Ok(())
}
