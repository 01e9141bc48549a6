//! Test-only `LayerOps` fixtures. Gated behind `cfg(test)` in the library
//! build and behind the `testutil` feature for integration tests and
//! benchmarks that live outside this crate's own `#[cfg(test)]` modules.

use crate::error::ChainError;
use crate::extent::ExtentList;
use crate::flags::{ExtentType, Flags, SupportLevel, TriState};
use crate::layer::{ExportEntry, LayerHandle, LayerOps, NextOps};
use crate::limits::Limits;
use parking_lot::Mutex;
use std::sync::Arc;

/// A minimal in-memory plugin: a zeroed byte buffer with every capability
/// query answered by a fixed, overridable script. Every call is recorded so
/// tests can assert on dispatch order and forwarding behaviour.
pub struct RecordingLayer {
    pub size: i64,
    pub calls: Mutex<Vec<String>>,
    pub data: Mutex<Vec<u8>>,
    pub can_write: Option<TriState>,
    pub can_flush: Option<TriState>,
    pub is_rotational: Option<TriState>,
    pub can_trim: Option<TriState>,
    pub can_zero: Option<SupportLevel>,
    pub can_fast_zero: Option<TriState>,
    pub can_fua: Option<SupportLevel>,
    pub can_multi_conn: Option<TriState>,
    pub can_cache: Option<SupportLevel>,
    pub can_extents: Option<TriState>,
    pub fail_open: bool,
    pub default_export_name: Option<String>,
}

impl Default for RecordingLayer {
    fn default() -> Self {
        RecordingLayer {
            size: 4096,
            calls: Mutex::new(Vec::new()),
            data: Mutex::new(vec![0u8; 4096]),
            can_write: None,
            can_flush: None,
            is_rotational: None,
            can_trim: None,
            can_zero: None,
            can_fast_zero: None,
            can_fua: None,
            can_multi_conn: None,
            can_cache: None,
            can_extents: None,
            fail_open: false,
            default_export_name: Some("default".into()),
        }
    }
}

impl RecordingLayer {
    pub fn with_size(size: i64) -> Self {
        RecordingLayer { size, data: Mutex::new(vec![0u8; size as usize]), ..RecordingLayer::default() }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

struct Handle;

impl LayerOps for RecordingLayer {
    fn list_exports(&self, _readonly: bool) -> Result<Vec<ExportEntry>, ChainError> {
        self.record("list_exports");
        Ok(vec![ExportEntry { name: "default".into(), description: None }])
    }

    fn default_export(&self, _readonly: bool) -> Result<Option<String>, ChainError> {
        self.record("default_export");
        Ok(self.default_export_name.clone())
    }

    fn open(
        &self,
        _readonly: bool,
        _exportname: &str,
        next: Option<&dyn NextOps>,
    ) -> Result<LayerHandle, ChainError> {
        self.record("open");
        if self.fail_open {
            return Err(ChainError::invalid("RecordingLayer configured to fail open"));
        }
        if let Some(next) = next {
            next.open(_readonly, _exportname)?;
        }
        Ok(Box::new(Handle))
    }

    fn prepare(&self, _handle: &LayerHandle, _readonly: bool) -> Result<(), ChainError> {
        self.record("prepare");
        Ok(())
    }

    fn finalize(&self, _handle: &LayerHandle) -> Result<(), ChainError> {
        self.record("finalize");
        Ok(())
    }

    fn close(&self, _handle: &LayerHandle) -> Result<(), ChainError> {
        self.record("close");
        Ok(())
    }

    fn can_write(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        self.can_write.map(Ok)
    }

    fn can_flush(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        self.can_flush.map(Ok)
    }

    fn is_rotational(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        self.is_rotational.map(Ok)
    }

    fn can_trim(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        self.can_trim.map(Ok)
    }

    fn can_zero(&self, _handle: &LayerHandle) -> Option<Result<SupportLevel, ChainError>> {
        self.can_zero.map(Ok)
    }

    fn can_fast_zero(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        self.can_fast_zero.map(Ok)
    }

    fn can_fua(&self, _handle: &LayerHandle) -> Option<Result<SupportLevel, ChainError>> {
        self.can_fua.map(Ok)
    }

    fn can_multi_conn(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        self.can_multi_conn.map(Ok)
    }

    fn can_cache(&self, _handle: &LayerHandle) -> Option<Result<SupportLevel, ChainError>> {
        self.can_cache.map(Ok)
    }

    fn can_extents(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        self.can_extents.map(Ok)
    }

    fn get_size(&self, _handle: &LayerHandle) -> Option<Result<i64, ChainError>> {
        self.record("get_size");
        Some(Ok(self.size))
    }

    fn pread(&self, _handle: &LayerHandle, buf: &mut [u8], offset: i64) -> Option<Result<(), ChainError>> {
        self.record("pread");
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Some(Err(ChainError::range("pread past end of backing buffer")));
        }
        buf.copy_from_slice(&data[start..end]);
        Some(Ok(()))
    }

    fn pwrite(
        &self,
        _handle: &LayerHandle,
        buf: &[u8],
        offset: i64,
        _flags: Flags,
    ) -> Option<Result<(), ChainError>> {
        self.record("pwrite");
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Some(Err(ChainError::range("pwrite past end of backing buffer")));
        }
        data[start..end].copy_from_slice(buf);
        Some(Ok(()))
    }

    fn flush(&self, _handle: &LayerHandle) -> Option<Result<(), ChainError>> {
        self.record("flush");
        Some(Ok(()))
    }

    fn trim(&self, _handle: &LayerHandle, _offset: i64, _count: i64, _flags: Flags) -> Option<Result<(), ChainError>> {
        self.record("trim");
        Some(Ok(()))
    }

    fn zero(&self, _handle: &LayerHandle, offset: i64, count: i64, _flags: Flags) -> Option<Result<(), ChainError>> {
        self.record("zero");
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + count as usize;
        if end > data.len() {
            return Some(Err(ChainError::range("zero past end of backing buffer")));
        }
        data[start..end].fill(0);
        Some(Ok(()))
    }

    fn extents(
        &self,
        _handle: &LayerHandle,
        offset: i64,
        count: i64,
        _flags: Flags,
    ) -> Option<Result<ExtentList, ChainError>> {
        self.record("extents");
        let mut list = match ExtentList::create(offset, offset + count, Limits::default()) {
            Ok(l) => l,
            Err(e) => return Some(Err(e)),
        };
        Some(list.add(offset, count, ExtentType::ALLOCATED).map(|_| list))
    }

    fn cache(&self, _handle: &LayerHandle, _offset: i64, _count: i64) -> Option<Result<(), ChainError>> {
        self.record("cache");
        Some(Ok(()))
    }
}

/// A filter that forwards every call verbatim to its inner neighbour,
/// recording that it was consulted. Useful for asserting the dispatcher's
/// forward-on-absence behaviour without a real transformation. When
/// `fail_open` is set, it opens its inner neighbour first (so the inner
/// context exists) and then fails its own `open`, exercising the
/// teardown-on-failed-open path.
#[derive(Default)]
pub struct PassthroughFilter {
    pub calls: Mutex<Vec<String>>,
    pub fail_open: bool,
}

impl LayerOps for PassthroughFilter {
    fn open(
        &self,
        readonly: bool,
        exportname: &str,
        next: Option<&dyn NextOps>,
    ) -> Result<LayerHandle, ChainError> {
        self.calls.lock().push("open".into());
        let next = next.expect("PassthroughFilter must be given an inner neighbour");
        next.open(readonly, exportname)?;
        if self.fail_open {
            return Err(ChainError::invalid("PassthroughFilter configured to fail open"));
        }
        Ok(Box::new(Handle))
    }

    fn get_size(&self, _handle: &LayerHandle) -> Option<Result<i64, ChainError>> {
        None
    }
}

pub fn arc_recording() -> Arc<RecordingLayer> {
    Arc::new(RecordingLayer::default())
}

/// A plugin implementing nothing beyond the required minimum (`open` and
/// `get_size`), relying on [`LayerOps`]'s defaults for everything else: no
/// exports of its own, no opinion on a default export, every capability
/// absent. Used to exercise the dispatcher's own defaults and synthesis
/// paths rather than a fixture's.
#[derive(Default)]
pub struct MinimalPlugin;

impl LayerOps for MinimalPlugin {
    fn open(&self, _readonly: bool, _exportname: &str, _next: Option<&dyn NextOps>) -> Result<LayerHandle, ChainError> {
        Ok(Box::new(Handle))
    }

    fn get_size(&self, _handle: &LayerHandle) -> Option<Result<i64, ChainError>> {
        Some(Ok(0))
    }

    fn default_export(&self, _readonly: bool) -> Result<Option<String>, ChainError> {
        Ok(Some("default".into()))
    }
}
