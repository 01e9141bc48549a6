//! Property-based tests covering the extent-list and capability-cache
//! invariants: contiguity is always enforced, coalescing never changes
//! total coverage, and a capability's cached answer never changes after
//! its first successful resolution.

use nbd_backend_chain::{
    ChainDispatcher, Connection, ExtentList, ExtentType, Flags, Limits, SupportLevel, TriState,
};
use nbd_backend_chain::testutil::RecordingLayer;
use nbd_backend_chain::{Chain, LayerDescriptor, LayerKind};
use proptest::prelude::*;
use std::sync::Arc;

fn single_plugin_chain(size: i64, can_write: Option<TriState>) -> Arc<Chain> {
    let mut layer = RecordingLayer::with_size(size);
    layer.can_write = can_write;
    let plugin = LayerDescriptor::new("file", "file.so", LayerKind::Plugin, 0, None, Arc::new(layer)).unwrap();
    Arc::new(Chain::new(vec![plugin]).unwrap())
}

proptest! {
    /// Feeding an `ExtentList` a sequence of contiguous records never
    /// errors, and the total length reported never exceeds the queried
    /// range's width regardless of how records are chunked.
    #[test]
    fn contiguous_adds_never_fail_and_never_overflow_range(
        start in 0i64..1_000_000,
        width in 1i64..1_000_000,
        chunk_sizes in prop::collection::vec(1i64..10_000, 1..50),
    ) {
        let end = start + width;
        let mut list = ExtentList::create(start, end, Limits::default()).unwrap();
        let mut offset = start;
        for (i, chunk) in chunk_sizes.iter().enumerate() {
            let ty = ExtentType(i as u32 % 2);
            list.add(offset, *chunk, ty).unwrap();
            offset += chunk;
        }
        prop_assert!(list.total_len() <= width);
        for record in list.records() {
            prop_assert!(record.offset >= start);
            prop_assert!(record.offset + record.length <= end);
        }
    }

    /// A non-contiguous add (a gap or overlap relative to the running
    /// cursor) is always rejected, whatever the gap's sign or size.
    #[test]
    fn non_contiguous_add_is_always_rejected(
        first_len in 1i64..10_000,
        gap in prop::num::i64::ANY.prop_filter("nonzero", |g| *g != 0),
    ) {
        let mut list = ExtentList::create(0, 10_000_000, Limits::default()).unwrap();
        list.add(0, first_len, ExtentType::ALLOCATED).unwrap();
        let next_offset = first_len.saturating_add(gap);
        prop_assume!(next_offset >= 0 && next_offset != first_len);
        let result = list.add(next_offset, 1, ExtentType::ALLOCATED);
        prop_assert!(result.is_err());
    }

    /// Once a `TriState` capability resolves successfully, re-querying it
    /// through the dispatcher always returns the same answer, no matter how
    /// many times it's asked.
    #[test]
    fn tristate_capability_cache_is_stable(can_write in prop::bool::ANY, queries in 1usize..20) {
        let chain = single_plugin_chain(4096, Some(if can_write { TriState::Yes } else { TriState::No }));
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, !can_write, "").unwrap();
        dispatcher.prepare(&chain, &connection, !can_write).unwrap();

        let first = dispatcher.can_write(&chain, &connection, chain.outermost()).unwrap();
        for _ in 0..queries {
            let again = dispatcher.can_write(&chain, &connection, chain.outermost()).unwrap();
            prop_assert_eq!(again, first);
        }
    }

    /// `pwrite` followed by `pread` over the same range always observes
    /// exactly the bytes written, for any in-range offset/length.
    #[test]
    fn pwrite_then_pread_is_observable(
        offset in 0i64..3000,
        len in 1usize..1000,
        byte in any::<u8>(),
    ) {
        prop_assume!(offset + len as i64 <= 4096);
        let chain = single_plugin_chain(4096, None);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        let data = vec![byte; len];
        dispatcher.pwrite(&chain, &connection, chain.outermost(), &data, offset, Flags::NONE).unwrap();
        let mut buf = vec![0u8; len];
        dispatcher.pread(&chain, &connection, chain.outermost(), &mut buf, offset, Flags::NONE).unwrap();
        prop_assert_eq!(buf, data);
    }

    /// A disallowed flag for a given operation is always rejected before
    /// any layer is consulted, regardless of which extra bits are set.
    #[test]
    fn pread_rejects_any_nonzero_flag(bits in 1u32..16) {
        let chain = single_plugin_chain(4096, None);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        let mut buf = vec![0u8; 4];
        let result = dispatcher.pread(&chain, &connection, chain.outermost(), &mut buf, 0, Flags::from_bits(bits));
        prop_assert!(result.is_err());
    }

    /// `can_trim` is never `Yes` unless `can_write` is also `Yes`, for any
    /// combination of the layer's own reported tri-states.
    #[test]
    fn can_trim_never_exceeds_can_write(write_yes in prop::bool::ANY) {
        let chain = single_plugin_chain(4096, Some(if write_yes { TriState::Yes } else { TriState::No }));
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        let write = dispatcher.can_write(&chain, &connection, chain.outermost()).unwrap();
        let trim = dispatcher.can_trim(&chain, &connection, chain.outermost()).unwrap();
        if trim.is_yes() {
            prop_assert!(write.is_yes());
        }
    }
}

#[test]
fn support_level_ordering_is_total() {
    assert!(SupportLevel::None < SupportLevel::Emulate);
    assert!(SupportLevel::Emulate < SupportLevel::Native);
}
