//! Carves aligned, committed spans out of fresh address-space
//! reservations, and keeps the book of live spans.
//!
//! Arbitrary power-of-two payload alignments are obtained by
//! over-reserving `align - granularity` extra bytes, placing the
//! commit base so the first payload granule lands on the requested
//! alignment, and then giving the page-aligned slop on both sides
//! back to the operating system.  The sub-page slack that survives
//! below the commit base is the reservation offset a `BigAllocated`
//! header records.
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::header::GRANULARITY;
use crate::mapper::Mapper;

/// A live reservation: `[base, base + len)` is mapped, and
/// `[commit, commit + committed_size)` is readable and writable.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Span {
    pub base: usize,           // page-aligned
    pub commit: usize,         // granule-aligned
    pub committed_size: usize, // multiple of the granularity
    pub len: usize,            // page-aligned
}

impl Span {
    /// Slack between the reservation base and the commit base; what
    /// release needs to get back from a commit address.
    pub fn offset(&self) -> usize {
        self.commit - self.base
    }

    /// Asserts against internal invariants.
    pub fn check_rep(&self, page_size: usize, align: usize) {
        assert_eq!(self.base % page_size, 0, "self: {:?}", self);
        assert_eq!(self.len % page_size, 0, "self: {:?}", self);
        assert_eq!(self.commit % GRANULARITY, 0, "self: {:?}", self);
        assert_eq!(self.committed_size % GRANULARITY, 0, "self: {:?}", self);

        assert!(self.commit >= self.base, "self: {:?}", self);
        assert!(
            self.commit + self.committed_size <= self.base + self.len,
            "self: {:?}",
            self
        );

        // The prefix trim leaves less than one page of slack.
        assert!(self.offset() < page_size, "self: {:?}", self);

        // The first payload granule satisfies the alignment.
        assert_eq!((self.commit + GRANULARITY) % align, 0, "self: {:?}", self);
    }
}

/// How a fresh reservation `[base, top)` splits into slop to trim and
/// the span to keep.
#[derive(Debug)]
struct CarvedSpan {
    span: Span,
    base: usize, // original reservation base, page-aligned
    top: usize,  // original reservation end, page-aligned
}

fn round_up(value: usize, unit: usize) -> Option<usize> {
    Some(value.checked_add(unit - 1)? / unit * unit)
}

/// Attempts to carve an aligned span of `size` bytes out of
/// `[base, base + actual)`.
///
/// # Errors
///
/// Returns `Err` when the range cannot hold the span; that means the
/// mapper returned an invalid range, and results in panic upstream.
fn carve(
    base: usize,
    actual: usize,
    size: usize,
    align: usize,
    page_size: usize,
) -> Result<CarvedSpan, &'static str> {
    if base % page_size != 0 {
        return Err("base is incorrectly aligned");
    }

    if actual % page_size != 0 {
        return Err("size is incorrectly aligned");
    }

    let top = base.checked_add(actual).ok_or("input region wraps around")?;

    // Place the commit base so `commit + granularity` is aligned.
    let commit = round_up(base + GRANULARITY, align).ok_or("overflow in alignment")? - GRANULARITY;

    let kept_base = commit - commit % page_size;
    let kept_end =
        round_up(commit.checked_add(size).ok_or("overflow in commit end")?, page_size)
            .ok_or("overflow in kept end")?;

    if kept_end > top {
        return Err("region too small");
    }

    Ok(CarvedSpan {
        span: Span {
            base: kept_base,
            commit,
            committed_size: size,
            len: kept_end - kept_base,
        },
        base,
        top,
    })
}

/// Reserves and commits a span of `size` bytes whose first payload
/// granule (`commit + granularity`) is `align`-aligned, trimming the
/// page-aligned slop on both sides.
///
/// # Errors
///
/// Returns `Err` on mapping failures (OOM-like conditions).
pub(crate) fn reserve_span(
    mapper: &dyn Mapper,
    size: usize,
    align: usize,
) -> Result<Span, i32> {
    assert!(align.is_power_of_two() && align >= GRANULARITY);
    assert!(size > 0 && size % GRANULARITY == 0);

    let page_size = mapper.page_size();
    let total = size
        .checked_add(align - GRANULARITY)
        .and_then(|total| round_up(total, page_size))
        .ok_or(libc::ENOMEM)?;

    let (region, actual) = mapper.reserve(total)?;
    let carved = carve(region.as_ptr() as usize, actual, size, align, page_size)
        .expect("mapper returned a bad region");
    let span = carved.span;

    span.check_rep(page_size, align);

    if let Err(errno) = mapper.commit(as_ptr(span.base), span.len) {
        // Nothing kept on failure; hand the whole range back.
        let _ = mapper.release(as_ptr(carved.base), carved.top - carved.base);
        return Err(errno);
    }

    trim(mapper, carved.base, span.base);
    trim(mapper, span.base + span.len, carved.top);

    Ok(span)
}

/// Releases a whole span previously returned by `reserve_span`.
///
/// # Errors
///
/// Returns `Err` when the operating system refuses the release; the
/// caller treats that as fatal.
pub(crate) fn release_span(mapper: &dyn Mapper, base: usize, len: usize) -> Result<(), i32> {
    mapper.release(as_ptr(base), len)
}

fn as_ptr(addr: usize) -> NonNull<c_void> {
    NonNull::new(addr as *mut c_void).expect("span addresses are never null")
}

/// Gives `[begin, end)` back to the operating system.  The slop
/// around a span is dead weight; failing to shed it is the same
/// bookkeeping failure as any other bad release.
fn trim(mapper: &dyn Mapper, begin: usize, end: usize) {
    assert!(begin <= end);
    if begin == end {
        return;
    }

    if let Err(errno) = mapper.release(as_ptr(begin), end - begin) {
        panic!("failed to trim reservation slop errno={}", errno);
    }
}

/// The book of live reservations, keyed by base address.  Release
/// needs it to recover the munmap length, heap teardown walks it,
/// and contract builds use it to audit every chunk.
pub(crate) struct SpanTable {
    spans: BTreeMap<usize, Span>,
}

impl SpanTable {
    pub fn new() -> SpanTable {
        SpanTable {
            spans: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, span: Span) {
        let previous = self.spans.insert(span.base, span);

        assert!(previous.is_none(), "reservation registered twice");
    }

    pub fn remove(&mut self, base: usize) -> Option<Span> {
        self.spans.remove(&base)
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn bases(&self) -> Vec<usize> {
        self.spans.keys().cloned().collect()
    }

    #[cfg(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    ))]
    pub fn iter(&self) -> impl Iterator<Item = &Span> {
        self.spans.values()
    }
}
