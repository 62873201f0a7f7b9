//! This module tracks reserved address spans and their committed
//! sub-ranges in contract builds.
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Clone, Copy)]
struct Range {
    begin: usize,
    size: usize,
}

#[derive(Clone, Copy)]
struct ReservedSpan {
    /// The range of address space reserved.
    begin: usize,
    size: usize,

    /// If populated, the *one* committed range completely inside this
    /// reserved span.
    committed: Option<Range>,
}

lazy_static::lazy_static! {
    static ref SPAN_MAP: Mutex<BTreeMap<usize, ReservedSpan>> = Default::default();
}

/// Returns the span associated with the highest key less than or
/// equal to `ptr`.
fn predecessor(ptr: usize) -> Option<ReservedSpan> {
    let map = SPAN_MAP.lock().unwrap();
    map.range(0..=ptr).last().map(|x| *x.1)
}

/// Registers a new reserved span.
pub fn reserve_range(begin: usize, size: usize) -> Result<(), &'static str> {
    if usize::MAX - begin < size {
        return Err("Address is too high.");
    }

    let mut map = SPAN_MAP.lock().unwrap();

    map.insert(
        begin,
        ReservedSpan {
            begin,
            size,
            committed: None,
        },
    );
    Ok(())
}

/// Returns Ok if `[begin, begin + size)` could be released: it must
/// cover the whole parent span, or hang off one of its ends without
/// touching the committed range.
pub fn releasable_range(begin: usize, size: usize) -> Result<(), &'static str> {
    if size > usize::MAX - begin {
        return Err("Range too large");
    }

    let reserved = predecessor(begin).ok_or("Parent span not found")?;

    if begin >= reserved.begin + reserved.size {
        return Err("Parent span too short for begin");
    }

    if begin + size > reserved.begin + reserved.size {
        return Err("Parent span too short for size");
    }

    if reserved.begin == begin && reserved.size == size {
        return Ok(());
    }

    if let Some(committed) = reserved.committed {
        if !(begin >= committed.begin + committed.size || begin + size <= committed.begin) {
            return Err("Released range overlaps with committed range");
        }
    }

    if reserved.begin == begin || reserved.begin + reserved.size == begin + size {
        return Ok(());
    }

    Err("Released range is in the middle of the span")
}

/// Unregisters a fragment of a pre-existing span.  The fragment must
/// cover the whole span, or sit at either end of it.
pub fn release_range(begin: usize, size: usize) -> Result<(), &'static str> {
    releasable_range(begin, size)?;

    let reserved = predecessor(begin).ok_or("Parent span not found")?;
    let mut map = SPAN_MAP.lock().unwrap();

    if reserved.begin == begin && reserved.size == size {
        map.remove(&begin);
        return Ok(());
    }

    if reserved.begin == begin {
        map.remove(&begin);
        assert!(size < reserved.size);
        map.insert(
            begin + size,
            ReservedSpan {
                begin: begin + size,
                size: reserved.size - size,
                committed: reserved.committed,
            },
        );
        return Ok(());
    }

    let entry: &mut _ = map
        .get_mut(&reserved.begin)
        .ok_or("Parent span not found on second lookup")?;

    assert!(size < entry.size);
    entry.size -= size;
    Ok(())
}

pub fn can_mark_committed(begin: usize, size: usize) -> Result<usize, &'static str> {
    if size > usize::MAX - begin {
        return Err("Range too large");
    }

    let reserved = predecessor(begin).ok_or("Parent span not found")?;
    if begin < reserved.begin {
        return Err("Committed address too low");
    }

    if begin + size > reserved.begin + reserved.size {
        return Err("Committed address too high");
    }

    if reserved.committed.is_some() {
        return Err("Committed range registered twice");
    }

    Ok(reserved.begin)
}

/// Marks the committed sub-range of a previously reserved span.
pub fn mark_committed(begin: usize, size: usize) -> Result<(), &'static str> {
    let reservation_begin = can_mark_committed(begin, size)?;

    let mut map = SPAN_MAP.lock().unwrap();
    let entry: &mut _ = map
        .get_mut(&reservation_begin)
        .ok_or("Parent span not found on second lookup")?;

    if entry.committed.is_some() {
        return Err("Committed range registered twice");
    }

    entry.committed = Some(Range { begin, size });
    Ok(())
}
