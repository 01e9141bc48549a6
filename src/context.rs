//! Per-connection, per-layer state (spec §3 "Context", §5).
//!
//! A [`Context`] is created by a successful `open` and destroyed by `close`.
//! Everything it caches uses a write-once sentinel scheme so concurrent
//! readers on the data path never need to take a lock: the first real answer
//! wins, and a later write of the same (or a stale) value is a harmless
//! no-op.

use crate::flags::{SupportLevel, TriState};
use crate::layer::LayerHandle;
use std::sync::atomic::{AtomicI64, AtomicI8, Ordering};

const UNKNOWN: i8 = -2;

/// A single write-once capability answer. `-2` means "not yet queried";
/// any other value, once stored, is never overwritten (spec §5: "the cache
/// itself never transitions back to unknown").
#[derive(Debug, Default)]
struct CapabilityCell(AtomicI8);

impl CapabilityCell {
    fn new() -> Self {
        CapabilityCell(AtomicI8::new(UNKNOWN))
    }

    fn get(&self) -> Option<i8> {
        let v = self.0.load(Ordering::Acquire);
        if v == UNKNOWN {
            None
        } else {
            Some(v)
        }
    }

    /// Stores `value` only if nothing has been stored yet. A second writer
    /// racing to cache the same answer is expected and benign.
    fn set_if_unknown(&self, value: i8) {
        let _ = self.0.compare_exchange(UNKNOWN, value, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Tracks the connection lifecycle state of a single context. `CONNECTED`
/// can only be true while `OPEN` is also true; `FAILED` is sticky and, once
/// set, is never cleared.
#[derive(Debug, Default)]
struct StateFlags {
    open: std::sync::atomic::AtomicBool,
    connected: std::sync::atomic::AtomicBool,
    failed: std::sync::atomic::AtomicBool,
}

/// The live state one layer holds for one connection.
pub struct Context {
    handle: LayerHandle,
    state: StateFlags,
    exportsize: AtomicI64,
    can_write: CapabilityCell,
    can_flush: CapabilityCell,
    is_rotational: CapabilityCell,
    can_trim: CapabilityCell,
    can_zero: CapabilityCell,
    can_fast_zero: CapabilityCell,
    can_fua: CapabilityCell,
    can_multi_conn: CapabilityCell,
    can_cache: CapabilityCell,
    can_extents: CapabilityCell,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("open", &self.is_open())
            .field("connected", &self.is_connected())
            .field("failed", &self.is_failed())
            .field("exportsize", &self.cached_exportsize())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Wraps a freshly opened layer handle. Marks the context `OPEN`
    /// immediately; `CONNECTED` is set separately once `prepare` succeeds.
    pub fn new(handle: LayerHandle) -> Self {
        Context {
            handle,
            state: StateFlags {
                open: std::sync::atomic::AtomicBool::new(true),
                connected: std::sync::atomic::AtomicBool::new(false),
                failed: std::sync::atomic::AtomicBool::new(false),
            },
            exportsize: AtomicI64::new(-1),
            can_write: CapabilityCell::new(),
            can_flush: CapabilityCell::new(),
            is_rotational: CapabilityCell::new(),
            can_trim: CapabilityCell::new(),
            can_zero: CapabilityCell::new(),
            can_fast_zero: CapabilityCell::new(),
            can_fua: CapabilityCell::new(),
            can_multi_conn: CapabilityCell::new(),
            can_cache: CapabilityCell::new(),
            can_extents: CapabilityCell::new(),
        }
    }

    pub fn handle(&self) -> &LayerHandle {
        &self.handle
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.state.failed.load(Ordering::Acquire)
    }

    /// Sets `CONNECTED`. Only meaningful while `OPEN`; the dispatcher never
    /// calls this otherwise.
    pub fn mark_connected(&self) {
        self.state.connected.store(true, Ordering::Release);
    }

    /// Sticky terminal failure (spec §7): once set, every later operation on
    /// this context is rejected with [`crate::error::ChainError::Failed`].
    pub fn mark_failed(&self) {
        self.state.failed.store(true, Ordering::Release);
    }

    /// Clears `OPEN`/`CONNECTED` on close. Does not clear `FAILED`: a failed
    /// context is still considered failed for the remainder of its (short)
    /// lifetime until it is dropped.
    pub fn mark_closed(&self) {
        self.state.connected.store(false, Ordering::Release);
        self.state.open.store(false, Ordering::Release);
    }

    pub fn cached_exportsize(&self) -> Option<i64> {
        let v = self.exportsize.load(Ordering::Acquire);
        if v < 0 {
            None
        } else {
            Some(v)
        }
    }

    pub fn cache_exportsize(&self, size: i64) {
        let _ = self.exportsize.compare_exchange(-1, size, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Reset on `close` so a `reopen` re-queries rather than trusting a size
    /// that may no longer hold (spec §9, "size may change across reopen").
    pub fn reset_exportsize(&self) {
        self.exportsize.store(-1, Ordering::Release);
    }

    pub fn cached_tristate(&self, which: TriCapability) -> Option<TriState> {
        self.cell(which.into()).get().map(decode_tristate)
    }

    pub fn cache_tristate(&self, which: TriCapability, value: TriState) {
        if value == TriState::Error {
            return;
        }
        self.cell(which.into()).set_if_unknown(value as i8);
    }

    pub fn cached_support_level(&self, which: LevelCapability) -> Option<SupportLevel> {
        self.cell(which.into()).get().map(decode_support_level)
    }

    pub fn cache_support_level(&self, which: LevelCapability, value: SupportLevel) {
        self.cell(which.into()).set_if_unknown(value as i8);
    }

    fn cell(&self, which: Capability) -> &CapabilityCell {
        match which {
            Capability::Write => &self.can_write,
            Capability::Flush => &self.can_flush,
            Capability::Rotational => &self.is_rotational,
            Capability::Trim => &self.can_trim,
            Capability::Zero => &self.can_zero,
            Capability::FastZero => &self.can_fast_zero,
            Capability::Fua => &self.can_fua,
            Capability::MultiConn => &self.can_multi_conn,
            Capability::Cache => &self.can_cache,
            Capability::Extents => &self.can_extents,
        }
    }
}

fn decode_tristate(v: i8) -> TriState {
    match v {
        -1 => TriState::Error,
        0 => TriState::No,
        _ => TriState::Yes,
    }
}

fn decode_support_level(v: i8) -> SupportLevel {
    match v {
        0 => SupportLevel::None,
        1 => SupportLevel::Emulate,
        _ => SupportLevel::Native,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capability {
    Write,
    Flush,
    Rotational,
    Trim,
    Zero,
    FastZero,
    Fua,
    MultiConn,
    Cache,
    Extents,
}

/// The subset of capabilities cached as a [`TriState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriCapability {
    Write,
    Flush,
    Rotational,
    Trim,
    FastZero,
    MultiConn,
    Extents,
}

impl From<TriCapability> for Capability {
    fn from(c: TriCapability) -> Self {
        match c {
            TriCapability::Write => Capability::Write,
            TriCapability::Flush => Capability::Flush,
            TriCapability::Rotational => Capability::Rotational,
            TriCapability::Trim => Capability::Trim,
            TriCapability::FastZero => Capability::FastZero,
            TriCapability::MultiConn => Capability::MultiConn,
            TriCapability::Extents => Capability::Extents,
        }
    }
}

/// The subset of capabilities cached as a [`SupportLevel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelCapability {
    Zero,
    Fua,
    Cache,
}

impl From<LevelCapability> for Capability {
    fn from(c: LevelCapability) -> Self {
        match c {
            LevelCapability::Zero => Capability::Zero,
            LevelCapability::Fua => Capability::Fua,
            LevelCapability::Cache => Capability::Cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exportsize_cache_is_write_once() {
        let ctx = Context::new(Box::new(()));
        assert_eq!(ctx.cached_exportsize(), None);
        ctx.cache_exportsize(4096);
        ctx.cache_exportsize(8192);
        assert_eq!(ctx.cached_exportsize(), Some(4096));
    }

    #[test]
    fn exportsize_resets_on_close_for_reopen() {
        let ctx = Context::new(Box::new(()));
        ctx.cache_exportsize(4096);
        ctx.reset_exportsize();
        assert_eq!(ctx.cached_exportsize(), None);
    }

    #[test]
    fn tristate_error_is_never_cached() {
        let ctx = Context::new(Box::new(()));
        ctx.cache_tristate(TriCapability::Write, TriState::Error);
        assert_eq!(ctx.cached_tristate(TriCapability::Write), None);
        ctx.cache_tristate(TriCapability::Write, TriState::Yes);
        assert_eq!(ctx.cached_tristate(TriCapability::Write), Some(TriState::Yes));
    }

    #[test]
    fn tristate_first_answer_sticks() {
        let ctx = Context::new(Box::new(()));
        ctx.cache_tristate(TriCapability::Trim, TriState::No);
        ctx.cache_tristate(TriCapability::Trim, TriState::Yes);
        assert_eq!(ctx.cached_tristate(TriCapability::Trim), Some(TriState::No));
    }

    #[test]
    fn support_level_caches_independently_per_capability() {
        let ctx = Context::new(Box::new(()));
        ctx.cache_support_level(LevelCapability::Zero, SupportLevel::Emulate);
        ctx.cache_support_level(LevelCapability::Fua, SupportLevel::Native);
        assert_eq!(ctx.cached_support_level(LevelCapability::Zero), Some(SupportLevel::Emulate));
        assert_eq!(ctx.cached_support_level(LevelCapability::Fua), Some(SupportLevel::Native));
        assert_eq!(ctx.cached_support_level(LevelCapability::Cache), None);
    }

    #[test]
    fn connected_implies_open_invariant_holds_through_lifecycle() {
        let ctx = Context::new(Box::new(()));
        assert!(ctx.is_open());
        assert!(!ctx.is_connected());
        ctx.mark_connected();
        assert!(ctx.is_open() && ctx.is_connected());
        ctx.mark_closed();
        assert!(!ctx.is_open() && !ctx.is_connected());
    }

    #[test]
    fn failed_flag_is_sticky() {
        let ctx = Context::new(Box::new(()));
        ctx.mark_failed();
        ctx.mark_closed();
        assert!(ctx.is_failed());
    }
}
