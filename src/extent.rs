//! The append-only, contiguity-checked extent list (spec §3, §4.2).
//!
//! An [`ExtentList`] accumulates `{offset, length, type}` records describing
//! a `[start, end)` byte range. Every `add` call either extends the list or
//! is silently dropped according to the rules in spec §4.2; `next` always
//! advances so an out-of-order `add` is caught on the following call.

use crate::error::ChainError;
use crate::flags::ExtentType;
use crate::limits::Limits;

/// One contiguous record within an [`ExtentList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentRecord {
    pub offset: i64,
    pub length: i64,
    pub ty: ExtentType,
}

#[derive(Debug)]
pub struct ExtentList {
    start: i64,
    end: i64,
    records: Vec<ExtentRecord>,
    /// The only legal offset at which the next record may be added. `None`
    /// until the first `add` call.
    next: Option<i64>,
    max_extents: usize,
}

impl ExtentList {
    /// Creates an empty list covering `[start, end)`. Fails with `Range`
    /// when either endpoint is negative, exceeds `i64::MAX` is moot in Rust
    /// (the type already bounds it), or `start > end`.
    pub fn create(start: i64, end: i64, limits: Limits) -> Result<Self, ChainError> {
        if start < 0 || end < 0 {
            return Err(ChainError::range("extent range endpoints must be non-negative"));
        }
        if start > end {
            return Err(ChainError::range("extent range start must not exceed end"));
        }
        Ok(ExtentList {
            start,
            end,
            records: Vec::new(),
            next: None,
            max_extents: limits.max_extents,
        })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn records(&self) -> &[ExtentRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_len(&self) -> i64 {
        self.records.iter().map(|r| r.length).sum()
    }

    /// Adds a record reported by a layer. See spec §4.2 for the full rule
    /// set: contiguity, drop, tail-clip, first-record placement, coalesce.
    pub fn add(&mut self, offset: i64, length: i64, ty: ExtentType) -> Result<(), ChainError> {
        if let Some(next) = self.next {
            if offset != next {
                return Err(ChainError::range(format!(
                    "non-contiguous extent add: expected offset {next}, got {offset}"
                )));
            }
        }
        // Unconditional advance, using the *original* offset/length, so a
        // subsequent out-of-order call is caught even if this call is
        // dropped or clipped below.
        self.next = Some(offset + length);

        if length <= 0 {
            return Ok(());
        }
        if offset >= self.end {
            return Ok(());
        }

        let mut length = length;
        if offset + length > self.end {
            length = self.end - offset;
        }

        if self.records.is_empty() {
            if offset + length <= self.start {
                return Ok(());
            }
            if offset > self.start {
                return Err(ChainError::range(format!(
                    "first extent record begins at {offset}, past range start {}",
                    self.start
                )));
            }
            if offset < self.start {
                length -= self.start - offset;
                self.push_or_coalesce(self.start, length, ty);
                return Ok(());
            }
        }

        self.push_or_coalesce(offset, length, ty);
        Ok(())
    }

    fn push_or_coalesce(&mut self, offset: i64, length: i64, ty: ExtentType) {
        if let Some(last) = self.records.last_mut() {
            if last.ty == ty {
                last.length += length;
                return;
            }
        }
        if self.records.len() >= self.max_extents {
            return;
        }
        self.records.push(ExtentRecord { offset, length, ty });
    }

    /// Re-bucketises the inner layer's extents into exactly one record of
    /// `align` bytes starting at `offset`, consulting `fetch` for more
    /// inner data when the accumulated records don't yet cover `align`
    /// bytes. The merged type is the bitwise-AND of every contributing
    /// record (spec §4.2, Testable Property 8).
    ///
    /// `fetch(offset, remaining)` must return at least one record starting
    /// at `offset`; returning an empty list is treated as a layer bug.
    pub fn aligned_query<F>(
        offset: i64,
        align: i64,
        limits: Limits,
        mut fetch: F,
    ) -> Result<ExtentList, ChainError>
    where
        F: FnMut(i64, i64) -> Result<ExtentList, ChainError>,
    {
        if align <= 0 {
            return Err(ChainError::range("alignment must be positive"));
        }

        let mut merged_ty: Option<ExtentType> = None;
        let mut covered: i64 = 0;
        let mut cursor = offset;

        while covered < align {
            let remaining = align - covered;
            let inner = fetch(cursor, remaining)?;
            if inner.records.is_empty() {
                return Err(ChainError::range(
                    "inner extents query returned no records while aligning",
                ));
            }
            for record in &inner.records {
                if covered >= align {
                    break;
                }
                let take = record.length.min(align - covered);
                merged_ty = Some(match merged_ty {
                    Some(existing) => existing.merge(record.ty),
                    None => record.ty,
                });
                covered += take;
                cursor += take;
            }
        }

        let mut out = ExtentList::create(offset, offset + align, limits)?;
        out.add(offset, align, merged_ty.unwrap_or(ExtentType::ALLOCATED))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits::default()
    }

    #[test]
    fn coalesces_adjacent_equal_type_records() {
        let mut list = ExtentList::create(0, 100, limits()).unwrap();
        list.add(0, 60, ExtentType(1)).unwrap();
        list.add(60, 40, ExtentType(1)).unwrap();
        assert_eq!(list.records(), &[ExtentRecord { offset: 0, length: 100, ty: ExtentType(1) }]);
    }

    #[test]
    fn clips_head_and_tail_around_range() {
        // All three adds share a type, so push_or_coalesce merges them into
        // a single running record as each lands: {50,20,2} -> {50,70,2} ->
        // {50,100,2}. Head clipping (40 -> 50) and tail clipping (160 -> 150)
        // both still happen; they just aren't visible as separate records
        // once same-type coalescing folds everything together.
        let mut list = ExtentList::create(50, 150, limits()).unwrap();
        list.add(40, 30, ExtentType(2)).unwrap();
        list.add(70, 50, ExtentType(2)).unwrap();
        list.add(120, 40, ExtentType(2)).unwrap();
        assert_eq!(
            list.records(),
            &[ExtentRecord { offset: 50, length: 100, ty: ExtentType(2) }]
        );
    }

    #[test]
    fn leading_drop_then_straddling_head_truncation() {
        let mut list = ExtentList::create(100, 200, limits()).unwrap();
        list.add(90, 10, ExtentType(0)).unwrap(); // ends exactly at start: dropped
        list.add(100, 20, ExtentType(5)).unwrap();
        assert_eq!(
            list.records(),
            &[ExtentRecord { offset: 100, length: 20, ty: ExtentType(5) }]
        );
    }

    #[test]
    fn detects_non_contiguous_add() {
        let mut list = ExtentList::create(0, 1000, limits()).unwrap();
        list.add(0, 10, ExtentType(0)).unwrap();
        let err = list.add(11, 5, ExtentType(0)).unwrap_err();
        assert!(matches!(err, ChainError::Range { .. }));
    }

    #[test]
    fn tail_clip_exact() {
        // The first record must itself begin at `start`, or `add` rejects it
        // as "begins past start"; seed with that record, then add the one
        // that actually needs tail-clipping.
        let mut list = ExtentList::create(0, 100, limits()).unwrap();
        list.add(0, 80, ExtentType(0)).unwrap();
        list.add(80, 40, ExtentType(1)).unwrap();
        assert_eq!(
            list.records(),
            &[
                ExtentRecord { offset: 0, length: 80, ty: ExtentType(0) },
                ExtentRecord { offset: 80, length: 20, ty: ExtentType(1) },
            ]
        );
    }

    #[test]
    fn head_clip_exact() {
        let mut list = ExtentList::create(10, 100, limits()).unwrap();
        list.add(0, 20, ExtentType(3)).unwrap();
        assert_eq!(
            list.records(),
            &[ExtentRecord { offset: 10, length: 10, ty: ExtentType(3) }]
        );
    }

    #[test]
    fn cap_is_respected_but_next_still_advances() {
        let mut limits = limits();
        limits.max_extents = 2;
        let mut list = ExtentList::create(0, 1000, limits).unwrap();
        list.add(0, 10, ExtentType(1)).unwrap();
        list.add(10, 10, ExtentType(2)).unwrap();
        // Third distinct-type record would exceed the cap: dropped, but the
        // cursor still advances so a later mismatched offset is caught.
        list.add(20, 10, ExtentType(3)).unwrap();
        assert_eq!(list.records().len(), 2);
        let err = list.add(31, 10, ExtentType(1)).unwrap_err();
        assert!(matches!(err, ChainError::Range { .. }));
    }

    #[test]
    fn aligned_query_merges_to_exact_alignment() {
        let limits = limits();
        let mut calls = 0;
        let result = ExtentList::aligned_query(0, 4096, limits, |offset, remaining| {
            calls += 1;
            let mut list = ExtentList::create(offset, offset + remaining, limits).unwrap();
            // Report misaligned, small chunks to force multiple fetches.
            list.add(offset, 1000.min(remaining), ExtentType::HOLE).unwrap();
            Ok(list)
        })
        .unwrap();
        assert_eq!(result.records().len(), 1);
        assert_eq!(result.records()[0].length, 4096);
        assert_eq!(result.records()[0].ty, ExtentType::HOLE);
        assert!(calls >= 1);
    }

    #[test]
    fn aligned_query_ands_mismatched_types() {
        let limits = limits();
        let mut first = true;
        let result = ExtentList::aligned_query(0, 512, limits, move |offset, remaining| {
            let mut list = ExtentList::create(offset, offset + remaining, limits).unwrap();
            if first {
                first = false;
                list.add(offset, 256.min(remaining), ExtentType::HOLE).unwrap();
            } else {
                // Hole bit set, plus an extra bit the first chunk didn't
                // agree on: the merge should keep only the shared bit.
                list.add(offset, remaining, ExtentType(ExtentType::HOLE.0 | ExtentType::ZERO.0)).unwrap();
            }
            Ok(list)
        })
        .unwrap();
        assert_eq!(result.records().len(), 1);
        assert_eq!(result.records()[0].ty, ExtentType::HOLE);
    }
}
