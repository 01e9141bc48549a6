//! The chain dispatcher (spec §4.3–§4.6): the stateless functions that walk
//! a [`Chain`] against one connection's [`Context`]s, enforcing the
//! preconditions, capability caching, cross-capability rules, and emulation
//! fallbacks every layer is entitled to assume are already handled.

use crate::connection::Connection;
use crate::context::{Context, LevelCapability, TriCapability};
use crate::error::{ChainError, ErrnoKind};
use crate::extent::ExtentList;
use crate::flags::{allowed_flags, DataOp, ExtentType, Flags, SupportLevel, TriState};
use crate::layer::{Chain, LayerHandle, LayerOps, NextOps};
use crate::limits::Limits;
use crate::observability::{chain_control_span, teardown_span};
use tracing::{debug, error, warn};

/// A cheap, `Copy` handle to the dispatch logic. Holds only the limits that
/// bound request sizes and extent-list growth; all other state lives on the
/// [`Connection`] and its [`Context`]s.
#[derive(Debug, Clone, Copy)]
pub struct ChainDispatcher {
    limits: Limits,
}

impl ChainDispatcher {
    pub fn new(limits: Limits) -> Self {
        ChainDispatcher { limits }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    // ---------------------------------------------------------------- open

    /// Opens the outermost layer. If `exportname` is empty, resolves it via
    /// [`ChainDispatcher::default_export`] first (spec §4.3); failure of
    /// that resolution fails the open outright. Filters recurse inward
    /// themselves by calling the `next` handle their own `open` is given;
    /// this entry point only ever touches `chain.outermost()` directly.
    pub fn open(
        &self,
        chain: &Chain,
        connection: &Connection,
        readonly: bool,
        exportname: &str,
    ) -> Result<(), ChainError> {
        let _guard = chain.enter_call();
        let resolved_owned;
        let exportname: &str = if exportname.is_empty() {
            resolved_owned = self.default_export(chain, connection, chain.outermost(), readonly)?.unwrap_or_default();
            &resolved_owned
        } else {
            exportname
        };
        self.open_layer(chain, connection, chain.outermost(), readonly, exportname)?;
        connection.set_export_name(exportname);
        Ok(())
    }

    /// Opens a single layer's context. On failure, tears down any inner
    /// context the layer's own `open` already created via `next` before
    /// propagating the error (spec §4.3, scenario S6): a failed outer layer
    /// must never leave an inner context stranded.
    fn open_layer(
        &self,
        chain: &Chain,
        connection: &Connection,
        index: usize,
        readonly: bool,
        exportname: &str,
    ) -> Result<(), ChainError> {
        if connection.context(index).read().is_some() {
            return Err(ChainError::range(format!("layer {index} already has an open context")));
        }
        let descriptor = chain.get(index).ok_or_else(|| ChainError::range("unknown layer index"))?;
        let _span = chain_control_span("open", descriptor.name(), index).entered();
        debug!(readonly, "opening layer");

        let inner_index = descriptor.next();
        let inner = InnerOps { dispatcher: *self, chain, connection, index: inner_index.unwrap_or(0) };
        let next: Option<&dyn NextOps> = if inner_index.is_some() { Some(&inner) } else { None };

        match descriptor.ops().open(readonly, exportname, next) {
            Ok(handle) => {
                *connection.context(index).write() = Some(Context::new(handle));
                Ok(())
            }
            Err(e) => {
                if let Some(inner_index) = inner_index {
                    warn!(layer = descriptor.name(), "open failed; tearing down any inner context it created");
                    self.teardown_from(chain, connection, inner_index);
                }
                Err(e)
            }
        }
    }

    /// Closes every layer from `start_index` down to `0` that has an open
    /// context, outer-to-inner. Used both by a failed `open` (to unwind
    /// whatever its inner neighbours already created) and is the building
    /// block `close` itself uses over the whole chain.
    fn teardown_from(&self, chain: &Chain, connection: &Connection, start_index: usize) {
        for index in (0..=start_index).rev() {
            let Some(descriptor) = chain.get(index) else { continue };
            let mut slot = connection.context(index).write();
            if let Some(ctx) = slot.take() {
                if let Err(e) = descriptor.ops().close(ctx.handle()) {
                    warn!(error = %e, layer = descriptor.name(), "layer close returned an error during teardown");
                }
            }
        }
    }

    // ------------------------------------------------------- prepare/close

    /// Walks inner-to-outer, calling `prepare` on every open context and
    /// marking each `CONNECTED` as it succeeds (spec §4.3).
    pub fn prepare(&self, chain: &Chain, connection: &Connection, readonly: bool) -> Result<(), ChainError> {
        for descriptor in chain.iter() {
            let guard = connection.context(descriptor.index()).read();
            let ctx = guard
                .as_ref()
                .ok_or_else(|| ChainError::invalid("prepare called on a layer with no open context"))?;
            if ctx.is_failed() {
                return Err(ChainError::Failed);
            }
            descriptor.ops().prepare(ctx.handle(), readonly)?;
            ctx.mark_connected();
        }
        Ok(())
    }

    /// Walks outer-to-inner, calling `finalize` (spec §4.3: the mirror of
    /// `prepare`, run before `close`).
    pub fn finalize(&self, chain: &Chain, connection: &Connection) -> Result<(), ChainError> {
        for descriptor in chain.iter().rev() {
            let guard = connection.context(descriptor.index()).read();
            if let Some(ctx) = guard.as_ref() {
                if ctx.is_failed() {
                    continue;
                }
                descriptor.ops().finalize(ctx.handle())?;
            }
        }
        Ok(())
    }

    /// Walks outer-to-inner, calling `close` and dropping each context (spec
    /// §4.3). Errors from one layer's `close` do not stop the walk: every
    /// layer still gets a chance to release its resources.
    pub fn close(&self, chain: &Chain, connection: &Connection) {
        let _guard = chain.enter_call();
        let _span = teardown_span("chain", chain.outermost()).entered();
        self.teardown_from(chain, connection, chain.outermost());
    }

    /// `close` followed by `open`+`prepare` again, with each context's
    /// cached size reset so the new open re-queries it rather than trusting
    /// a value that may no longer hold. On failure of either stage the
    /// partially created context is finalized and closed before the error
    /// propagates (spec §4.3 line 81): `open`'s own internal teardown
    /// already covers an `open` failure; a `prepare` failure is cleaned up
    /// here so a failed `reopen` never leaves a live context behind either.
    pub fn reopen(
        &self,
        chain: &Chain,
        connection: &Connection,
        readonly: bool,
        exportname: &str,
    ) -> Result<(), ChainError> {
        self.finalize(chain, connection).ok();
        self.close(chain, connection);
        self.open(chain, connection, readonly, exportname)?;
        if let Err(e) = self.prepare(chain, connection, readonly) {
            self.finalize(chain, connection).ok();
            self.close(chain, connection);
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------ exports

    /// Lists exports, then applies the default-export resolution pass (spec
    /// §4.4): if the layer reported no exports of its own, synthesize one
    /// entry from [`ChainDispatcher::default_export`]. Names longer than
    /// [`Limits::max_name_len`] are dropped from the result either way.
    pub fn list_exports(
        &self,
        chain: &Chain,
        connection: &Connection,
        readonly: bool,
    ) -> Result<Vec<crate::layer::ExportEntry>, ChainError> {
        let _guard = chain.enter_call();
        let outermost = chain.get(chain.outermost()).expect("chain is non-empty");
        let mut entries = outermost.ops().list_exports(readonly)?;

        if entries.is_empty() {
            if let Some(name) = self.default_export(chain, connection, chain.outermost(), readonly)? {
                entries.push(crate::layer::ExportEntry { name, description: None });
            }
        }

        entries.retain(|entry| entry.name.len() <= self.limits.max_name_len);
        Ok(entries)
    }

    /// Resolves the export name a client gets when it requests the empty
    /// name for the layer at `index`, falling through to its inner
    /// neighbour when that layer has no opinion of its own (spec §4.4). A
    /// name exceeding [`Limits::max_name_len`] is discarded as if the layer
    /// had no opinion. The result is memoised per layer in
    /// `connection.default_exportname[index]` (spec §3), including a "no
    /// opinion" answer, so a later call against the same layer doesn't
    /// re-consult it or its inner neighbours.
    pub fn default_export(&self, chain: &Chain, connection: &Connection, index: usize, readonly: bool) -> Result<Option<String>, ChainError> {
        let _guard = chain.enter_call();
        if let Some(cached) = connection.cached_default_export(index) {
            return Ok(cached);
        }
        let descriptor = chain.get(index).ok_or_else(|| ChainError::range("unknown layer index"))?;
        let mut resolved = match descriptor.ops().default_export(readonly)? {
            Some(name) if name.len() <= self.limits.max_name_len => Some(name),
            Some(oversized) => {
                warn!(len = oversized.len(), layer = descriptor.name(), "layer's default export name exceeds the size cap; ignored");
                None
            }
            None => None,
        };
        if resolved.is_none() {
            if let Some(inner) = descriptor.next() {
                resolved = self.default_export(chain, connection, inner, readonly)?;
            }
        }
        if resolved.is_none() {
            warn!(layer = descriptor.name(), "no opinion on default export name");
        }
        connection.cache_default_export(index, resolved.clone());
        Ok(resolved)
    }

    // ------------------------------------------------------- capabilities

    pub fn can_write(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<TriState, ChainError> {
        if connection.readonly() {
            return Ok(TriState::No);
        }
        self.resolve_tristate(chain, connection, index, TriCapability::Write)
    }

    pub fn can_flush(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<TriState, ChainError> {
        self.resolve_tristate(chain, connection, index, TriCapability::Flush)
    }

    pub fn is_rotational(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<TriState, ChainError> {
        self.resolve_tristate(chain, connection, index, TriCapability::Rotational)
    }

    pub fn can_trim(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<TriState, ChainError> {
        if !self.can_write(chain, connection, index)?.is_yes() {
            return Ok(TriState::No);
        }
        self.resolve_tristate(chain, connection, index, TriCapability::Trim)
    }

    pub fn can_multi_conn(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<TriState, ChainError> {
        self.resolve_tristate(chain, connection, index, TriCapability::MultiConn)
    }

    pub fn can_extents(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<TriState, ChainError> {
        self.resolve_tristate(chain, connection, index, TriCapability::Extents)
    }

    pub fn can_zero(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<SupportLevel, ChainError> {
        if !self.can_write(chain, connection, index)?.is_yes() {
            return Ok(SupportLevel::None);
        }
        self.resolve_support_level(chain, connection, index, LevelCapability::Zero)
    }

    pub fn can_fast_zero(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<TriState, ChainError> {
        if self.can_zero(chain, connection, index)? < SupportLevel::Emulate {
            return Ok(TriState::No);
        }
        self.resolve_tristate(chain, connection, index, TriCapability::FastZero)
    }

    pub fn can_fua(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<SupportLevel, ChainError> {
        self.resolve_support_level(chain, connection, index, LevelCapability::Fua)
    }

    pub fn can_cache(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<SupportLevel, ChainError> {
        self.resolve_support_level(chain, connection, index, LevelCapability::Cache)
    }

    pub fn get_size(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<i64, ChainError> {
        let guard = connection.context(index).read();
        let ctx = guard.as_ref().ok_or_else(|| ChainError::invalid("get_size on unopened context"))?;
        if ctx.is_failed() {
            return Err(ChainError::Failed);
        }
        if let Some(cached) = ctx.cached_exportsize() {
            return Ok(cached);
        }
        let descriptor = chain.get(index).expect("valid index");
        let size = match descriptor.ops().get_size(ctx.handle()) {
            Some(result) => result?,
            None => match descriptor.next() {
                Some(inner) => {
                    drop(guard);
                    let size = self.get_size(chain, connection, inner)?;
                    if let Some(ctx) = connection.context(index).read().as_ref() {
                        ctx.cache_exportsize(size);
                    }
                    return Ok(size);
                }
                None => return Err(ChainError::invalid("innermost plugin did not implement get_size")),
            },
        };
        ctx.cache_exportsize(size);
        Ok(size)
    }

    /// Not cached (spec §4.5: its value may legitimately change across
    /// calls). A description longer than [`Limits::max_name_len`] is
    /// dropped to `absent` rather than surfaced truncated.
    pub fn export_description(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<Option<String>, ChainError> {
        let guard = connection.context(index).read();
        let ctx = guard.as_ref().ok_or_else(|| ChainError::invalid("export_description on unopened context"))?;
        if ctx.is_failed() {
            return Err(ChainError::Failed);
        }
        let descriptor = chain.get(index).expect("valid index");
        let description = match descriptor.ops().export_description(ctx.handle()) {
            Some(result) => result?,
            None => match descriptor.next() {
                Some(inner) => {
                    drop(guard);
                    return self.export_description(chain, connection, inner);
                }
                None => None,
            },
        };
        Ok(description.filter(|d| d.len() <= self.limits.max_name_len))
    }

    fn resolve_tristate(&self, chain: &Chain, connection: &Connection, index: usize, which: TriCapability) -> Result<TriState, ChainError> {
        let guard = connection.context(index).read();
        let ctx = guard.as_ref().ok_or_else(|| ChainError::invalid("capability query on unopened context"))?;
        if ctx.is_failed() {
            return Err(ChainError::Failed);
        }
        if let Some(cached) = ctx.cached_tristate(which) {
            return Ok(cached);
        }
        let descriptor = chain.get(index).expect("valid index");
        match tristate_call(descriptor.ops(), ctx.handle(), which) {
            Some(Ok(v)) => {
                ctx.cache_tristate(which, v);
                Ok(v)
            }
            Some(Err(e)) => Err(e),
            None => match descriptor.next() {
                Some(inner) => {
                    drop(guard);
                    let v = self.resolve_tristate(chain, connection, inner, which)?;
                    if let Some(ctx) = connection.context(index).read().as_ref() {
                        ctx.cache_tristate(which, v);
                    }
                    Ok(v)
                }
                None => {
                    let v = default_tristate(which);
                    ctx.cache_tristate(which, v);
                    Ok(v)
                }
            },
        }
    }

    fn resolve_support_level(&self, chain: &Chain, connection: &Connection, index: usize, which: LevelCapability) -> Result<SupportLevel, ChainError> {
        let guard = connection.context(index).read();
        let ctx = guard.as_ref().ok_or_else(|| ChainError::invalid("capability query on unopened context"))?;
        if ctx.is_failed() {
            return Err(ChainError::Failed);
        }
        if let Some(cached) = ctx.cached_support_level(which) {
            return Ok(cached);
        }
        let descriptor = chain.get(index).expect("valid index");
        match support_level_call(descriptor.ops(), ctx.handle(), which) {
            Some(Ok(v)) => {
                ctx.cache_support_level(which, v);
                Ok(v)
            }
            Some(Err(e)) => Err(e),
            None => match descriptor.next() {
                Some(inner) => {
                    drop(guard);
                    let v = self.resolve_support_level(chain, connection, inner, which)?;
                    if let Some(ctx) = connection.context(index).read().as_ref() {
                        ctx.cache_support_level(which, v);
                    }
                    Ok(v)
                }
                None => {
                    let v = SupportLevel::None;
                    ctx.cache_support_level(which, v);
                    Ok(v)
                }
            },
        }
    }

    // -------------------------------------------------------------- data

    pub fn pread(&self, chain: &Chain, connection: &Connection, index: usize, buf: &mut [u8], offset: i64, flags: Flags) -> Result<(), ChainError> {
        let _guard = self.outermost_call_guard(chain, index);
        check_flags(DataOp::Pread, flags)?;
        self.check_range(chain, connection, index, offset, buf.len() as i64)?;
        self.with_connected(connection, index, |ctx| {
            let descriptor = chain.get(index).expect("valid index");
            match descriptor.ops().pread(ctx.handle(), buf, offset) {
                Some(result) => result.map_err(|e| self.poison(ctx, descriptor.name(), e)),
                None => match descriptor.next() {
                    Some(inner) => self.pread(chain, connection, inner, buf, offset, flags),
                    None => Err(ChainError::invalid("innermost plugin did not implement pread")),
                },
            }
        })
    }

    pub fn pwrite(&self, chain: &Chain, connection: &Connection, index: usize, buf: &[u8], offset: i64, flags: Flags) -> Result<(), ChainError> {
        let _guard = self.outermost_call_guard(chain, index);
        check_flags(DataOp::Pwrite, flags)?;
        if !self.can_write(chain, connection, index)?.is_yes() {
            return Err(ChainError::layer(ErrnoKind::ReadOnly, "pwrite on a read-only export"));
        }
        self.check_range(chain, connection, index, offset, buf.len() as i64)?;
        let needs_fua_emulation = self.check_fua(chain, connection, index, flags)?;

        self.with_connected(connection, index, |ctx| {
            let descriptor = chain.get(index).expect("valid index");
            match descriptor.ops().pwrite(ctx.handle(), buf, offset, flags) {
                Some(result) => result.map_err(|e| self.poison(ctx, descriptor.name(), e))?,
                None => match descriptor.next() {
                    Some(inner) => self.pwrite(chain, connection, inner, buf, offset, flags)?,
                    None => return Err(ChainError::invalid("innermost plugin did not implement pwrite")),
                },
            }
            Ok(())
        })?;

        if needs_fua_emulation {
            self.flush(chain, connection, index)?;
        }
        Ok(())
    }

    pub fn flush(&self, chain: &Chain, connection: &Connection, index: usize) -> Result<(), ChainError> {
        let _guard = self.outermost_call_guard(chain, index);
        if !self.can_flush(chain, connection, index)?.is_yes() {
            return Ok(());
        }
        self.with_connected(connection, index, |ctx| {
            let descriptor = chain.get(index).expect("valid index");
            match descriptor.ops().flush(ctx.handle()) {
                Some(result) => result.map_err(|e| self.poison(ctx, descriptor.name(), e)),
                None => match descriptor.next() {
                    Some(inner) => self.flush(chain, connection, inner),
                    None => Ok(()),
                },
            }
        })
    }

    pub fn trim(&self, chain: &Chain, connection: &Connection, index: usize, offset: i64, count: i64, flags: Flags) -> Result<(), ChainError> {
        let _guard = self.outermost_call_guard(chain, index);
        check_flags(DataOp::Trim, flags)?;
        if !self.can_trim(chain, connection, index)?.is_yes() {
            return Err(ChainError::layer(ErrnoKind::NotSupported, "trim not supported by this export"));
        }
        self.check_range(chain, connection, index, offset, count)?;
        let needs_fua_emulation = self.check_fua(chain, connection, index, flags)?;

        self.with_connected(connection, index, |ctx| {
            let descriptor = chain.get(index).expect("valid index");
            match descriptor.ops().trim(ctx.handle(), offset, count, flags) {
                Some(result) => result.map_err(|e| self.poison(ctx, descriptor.name(), e))?,
                None => match descriptor.next() {
                    Some(inner) => self.trim(chain, connection, inner, offset, count, flags)?,
                    None => {}
                },
            }
            Ok(())
        })?;

        if needs_fua_emulation {
            self.flush(chain, connection, index)?;
        }
        Ok(())
    }

    /// Zero a range, falling back to a `pwrite` of zeroes when the layer's
    /// own `can_zero` is `None` (spec §4.6). `FAST_ZERO` requires
    /// `can_fast_zero` regardless of `can_zero`'s level: a caller asking for
    /// a cheap zero is rejected outright rather than silently paying for the
    /// `pwrite` fallback.
    pub fn zero(&self, chain: &Chain, connection: &Connection, index: usize, offset: i64, count: i64, flags: Flags) -> Result<(), ChainError> {
        let _guard = self.outermost_call_guard(chain, index);
        check_flags(DataOp::Zero, flags)?;
        if !self.can_write(chain, connection, index)?.is_yes() {
            return Err(ChainError::layer(ErrnoKind::ReadOnly, "zero on a read-only export"));
        }
        self.check_range(chain, connection, index, offset, count)?;

        if flags.contains(Flags::FAST_ZERO) && !self.can_fast_zero(chain, connection, index)?.is_yes() {
            return Err(ChainError::FastZeroNotSupported);
        }

        let level = self.can_zero(chain, connection, index)?;
        if level == SupportLevel::None {
            let zeroes = vec![0u8; count as usize];
            let pwrite_flags = if flags.contains(Flags::FUA) { Flags::FUA } else { Flags::NONE };
            return self.pwrite(chain, connection, index, &zeroes, offset, pwrite_flags);
        }

        let needs_fua_emulation = self.check_fua(chain, connection, index, flags)?;
        self.with_connected(connection, index, |ctx| {
            let descriptor = chain.get(index).expect("valid index");
            match descriptor.ops().zero(ctx.handle(), offset, count, flags) {
                Some(result) => result.map_err(|e| self.poison(ctx, descriptor.name(), e))?,
                None => match descriptor.next() {
                    Some(inner) => self.zero(chain, connection, inner, offset, count, flags)?,
                    None => return Err(ChainError::invalid("layer claimed zero support but did not implement it")),
                },
            }
            Ok(())
        })?;

        if needs_fua_emulation {
            self.flush(chain, connection, index)?;
        }
        Ok(())
    }

    /// Caches a range: rejected outright when the layer has no cache support
    /// at all (spec §4.6 line 114's "`can_cache` above `NONE`" precondition),
    /// satisfied by a `pread` loop when the layer's own `can_cache` is
    /// `Emulate` (spec §4.6 line 121 — caching is defined purely in terms of
    /// its effect on a later `pread`, so a plain read satisfies it), and
    /// forwarded to the layer's own `cache` when `Native`.
    pub fn cache(&self, chain: &Chain, connection: &Connection, index: usize, offset: i64, count: i64) -> Result<(), ChainError> {
        let _guard = self.outermost_call_guard(chain, index);
        self.check_range(chain, connection, index, offset, count)?;
        let level = self.can_cache(chain, connection, index)?;
        if level == SupportLevel::None {
            return Err(ChainError::layer(ErrnoKind::NotSupported, "cache not supported by this export"));
        }
        if level == SupportLevel::Emulate {
            let chunk = self.limits.max_request_size.min(count.max(0) as usize);
            let mut scratch = vec![0u8; chunk];
            let mut remaining = count;
            let mut cursor = offset;
            while remaining > 0 {
                let take = remaining.min(chunk as i64);
                self.pread(chain, connection, index, &mut scratch[..take as usize], cursor, Flags::NONE)?;
                cursor += take;
                remaining -= take;
            }
            return Ok(());
        }

        self.with_connected(connection, index, |ctx| {
            let descriptor = chain.get(index).expect("valid index");
            match descriptor.ops().cache(ctx.handle(), offset, count) {
                Some(result) => result.map_err(|e| self.poison(ctx, descriptor.name(), e)),
                None => match descriptor.next() {
                    Some(inner) => self.cache(chain, connection, inner, offset, count),
                    None => Err(ChainError::invalid("layer claimed cache support but did not implement it")),
                },
            }
        })
    }

    /// Queries extents, synthesizing a single `ALLOCATED` record covering
    /// the whole request when the layer's own `can_extents` is `No` (spec
    /// §4.6: a layer with no extent information is assumed fully allocated).
    pub fn extents(&self, chain: &Chain, connection: &Connection, index: usize, offset: i64, count: i64, flags: Flags) -> Result<ExtentList, ChainError> {
        let _guard = self.outermost_call_guard(chain, index);
        check_flags(DataOp::Extents, flags)?;
        self.check_range(chain, connection, index, offset, count)?;

        if !self.can_extents(chain, connection, index)?.is_yes() {
            let mut list = ExtentList::create(offset, offset + count, self.limits)?;
            list.add(offset, count, ExtentType::ALLOCATED)?;
            return Ok(list);
        }

        self.with_connected(connection, index, |ctx| {
            let descriptor = chain.get(index).expect("valid index");
            match descriptor.ops().extents(ctx.handle(), offset, count, flags) {
                Some(result) => result.map_err(|e| self.poison(ctx, descriptor.name(), e)),
                None => match descriptor.next() {
                    Some(inner) => self.extents(chain, connection, inner, offset, count, flags),
                    None => Err(ChainError::invalid("layer claimed extents support but did not implement it")),
                },
            }
        })
    }

    // ------------------------------------------------------------- shared

    /// Acquires the chain's unload lock only when `index` is the outermost
    /// layer: a data-path call recurses into the same method by name for
    /// its inner neighbour, and the outer call's guard already covers that
    /// whole recursion for its duration.
    fn outermost_call_guard<'a>(&self, chain: &'a Chain, index: usize) -> Option<crate::unload::CallGuard<'a>> {
        (index == chain.outermost()).then(|| chain.enter_call())
    }

    /// The gate every data-path call passes through: rejects calls observed
    /// after the connection began tearing down (spec §7 "Shutdown") before
    /// even an unopened/failed/unconnected context is checked, since a
    /// shutting-down connection has no meaningful data-path state left.
    fn with_connected<R>(&self, connection: &Connection, index: usize, f: impl FnOnce(&Context) -> Result<R, ChainError>) -> Result<R, ChainError> {
        if connection.is_shutting_down() {
            return Err(ChainError::ShuttingDown);
        }
        let guard = connection.context(index).read();
        let ctx = guard.as_ref().ok_or_else(|| ChainError::invalid("data-path call on unopened context"))?;
        if ctx.is_failed() {
            return Err(ChainError::Failed);
        }
        if !ctx.is_connected() {
            return Err(ChainError::invalid("data-path call before prepare completed"));
        }
        f(ctx)
    }

    /// Spec §4.6 line 113's unconditional `FUA` precondition: the flag
    /// requires `can_fua` above `None` regardless of write/trim/zero's own
    /// preconditions, not merely a best-effort flush afterwards. Returns
    /// whether the caller still needs the trailing-flush emulation for a
    /// merely-`Emulate`d `FUA`.
    fn check_fua(&self, chain: &Chain, connection: &Connection, index: usize, flags: Flags) -> Result<bool, ChainError> {
        if !flags.contains(Flags::FUA) {
            return Ok(false);
        }
        let level = self.can_fua(chain, connection, index)?;
        if level == SupportLevel::None {
            return Err(ChainError::layer(ErrnoKind::NotSupported, "FUA requested but this export has no FUA support"));
        }
        Ok(level < SupportLevel::Native)
    }

    fn check_range(&self, chain: &Chain, connection: &Connection, index: usize, offset: i64, length: i64) -> Result<(), ChainError> {
        if offset < 0 || length < 0 {
            return Err(ChainError::range("offset and length must be non-negative"));
        }
        if length as usize > self.limits.max_request_size {
            return Err(ChainError::range("request exceeds the configured maximum size"));
        }
        let size = self.get_size(chain, connection, index)?;
        if offset.checked_add(length).map_or(true, |end| end > size) {
            return Err(ChainError::range("request extends past the end of the export"));
        }
        Ok(())
    }

    /// Marks `ctx` `FAILED` when `e` is an I/O failure: spec §7 treats an
    /// I/O error from a layer as potentially leaving that layer's state
    /// inconsistent, so the context is poisoned rather than reused.
    fn poison(&self, ctx: &Context, layer: &str, e: ChainError) -> ChainError {
        if e.errno_kind() == ErrnoKind::Io {
            error!(layer, error = %e, "layer I/O failure; context marked failed");
            ctx.mark_failed();
        }
        e
    }
}

fn check_flags(op: DataOp, flags: Flags) -> Result<(), ChainError> {
    if !flags.is_subset_of(allowed_flags(op)) {
        return Err(ChainError::invalid(format!("flags {:#x} not allowed for this operation", flags.bits())));
    }
    Ok(())
}

fn default_tristate(which: TriCapability) -> TriState {
    match which {
        TriCapability::Write => TriState::Yes,
        _ => TriState::No,
    }
}

fn tristate_call(ops: &dyn LayerOps, handle: &LayerHandle, which: TriCapability) -> Option<Result<TriState, ChainError>> {
    match which {
        TriCapability::Write => ops.can_write(handle),
        TriCapability::Flush => ops.can_flush(handle),
        TriCapability::Rotational => ops.is_rotational(handle),
        TriCapability::Trim => ops.can_trim(handle),
        TriCapability::FastZero => ops.can_fast_zero(handle),
        TriCapability::MultiConn => ops.can_multi_conn(handle),
        TriCapability::Extents => ops.can_extents(handle),
    }
}

fn support_level_call(ops: &dyn LayerOps, handle: &LayerHandle, which: LevelCapability) -> Option<Result<SupportLevel, ChainError>> {
    match which {
        LevelCapability::Zero => ops.can_zero(handle),
        LevelCapability::Fua => ops.can_fua(handle),
        LevelCapability::Cache => ops.can_cache(handle),
    }
}

/// The `NextOps` a filter's `open` call is given, bound to its inner
/// neighbour's context.
struct InnerOps<'a> {
    dispatcher: ChainDispatcher,
    chain: &'a Chain,
    connection: &'a Connection,
    index: usize,
}

impl<'a> NextOps for InnerOps<'a> {
    fn open(&self, readonly: bool, exportname: &str) -> Result<(), ChainError> {
        self.dispatcher.open_layer(self.chain, self.connection, self.index, readonly, exportname)
    }

    fn default_export(&self, readonly: bool) -> Result<Option<String>, ChainError> {
        self.dispatcher.default_export(self.chain, self.connection, self.index, readonly)
    }

    fn can_write(&self) -> Result<bool, ChainError> {
        Ok(self.dispatcher.can_write(self.chain, self.connection, self.index)?.is_yes())
    }

    fn can_flush(&self) -> Result<bool, ChainError> {
        Ok(self.dispatcher.can_flush(self.chain, self.connection, self.index)?.is_yes())
    }

    fn is_rotational(&self) -> Result<bool, ChainError> {
        Ok(self.dispatcher.is_rotational(self.chain, self.connection, self.index)?.is_yes())
    }

    fn can_trim(&self) -> Result<bool, ChainError> {
        Ok(self.dispatcher.can_trim(self.chain, self.connection, self.index)?.is_yes())
    }

    fn can_zero(&self) -> Result<SupportLevel, ChainError> {
        self.dispatcher.can_zero(self.chain, self.connection, self.index)
    }

    fn can_fast_zero(&self) -> Result<bool, ChainError> {
        Ok(self.dispatcher.can_fast_zero(self.chain, self.connection, self.index)?.is_yes())
    }

    fn can_fua(&self) -> Result<SupportLevel, ChainError> {
        self.dispatcher.can_fua(self.chain, self.connection, self.index)
    }

    fn can_multi_conn(&self) -> Result<bool, ChainError> {
        Ok(self.dispatcher.can_multi_conn(self.chain, self.connection, self.index)?.is_yes())
    }

    fn can_cache(&self) -> Result<SupportLevel, ChainError> {
        self.dispatcher.can_cache(self.chain, self.connection, self.index)
    }

    fn can_extents(&self) -> Result<bool, ChainError> {
        Ok(self.dispatcher.can_extents(self.chain, self.connection, self.index)?.is_yes())
    }

    fn get_size(&self) -> Result<i64, ChainError> {
        self.dispatcher.get_size(self.chain, self.connection, self.index)
    }

    fn export_description(&self) -> Result<Option<String>, ChainError> {
        self.dispatcher.export_description(self.chain, self.connection, self.index)
    }

    fn pread(&self, buf: &mut [u8], offset: i64) -> Result<(), ChainError> {
        self.dispatcher.pread(self.chain, self.connection, self.index, buf, offset, Flags::NONE)
    }

    fn pwrite(&self, buf: &[u8], offset: i64, flags: Flags) -> Result<(), ChainError> {
        self.dispatcher.pwrite(self.chain, self.connection, self.index, buf, offset, flags)
    }

    fn flush(&self) -> Result<(), ChainError> {
        self.dispatcher.flush(self.chain, self.connection, self.index)
    }

    fn trim(&self, offset: i64, count: i64, flags: Flags) -> Result<(), ChainError> {
        self.dispatcher.trim(self.chain, self.connection, self.index, offset, count, flags)
    }

    fn zero(&self, offset: i64, count: i64, flags: Flags) -> Result<(), ChainError> {
        self.dispatcher.zero(self.chain, self.connection, self.index, offset, count, flags)
    }

    fn extents(&self, offset: i64, count: i64, flags: Flags) -> Result<ExtentList, ChainError> {
        self.dispatcher.extents(self.chain, self.connection, self.index, offset, count, flags)
    }

    fn cache(&self, offset: i64, count: i64) -> Result<(), ChainError> {
        self.dispatcher.cache(self.chain, self.connection, self.index, offset, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{LayerDescriptor, LayerKind};
    use crate::testutil::RecordingLayer;
    use std::sync::Arc;

    fn single_plugin_chain(size: i64) -> Arc<Chain> {
        chain_with(RecordingLayer::with_size(size))
    }

    fn chain_with(plugin: RecordingLayer) -> Arc<Chain> {
        let plugin = LayerDescriptor::new("file", "file.so", LayerKind::Plugin, 0, None, Arc::new(plugin)).unwrap();
        Arc::new(Chain::new(vec![plugin]).unwrap())
    }

    #[test]
    fn open_prepare_pread_roundtrip() {
        let chain = single_plugin_chain(4096);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());

        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        let mut buf = vec![1u8; 16];
        dispatcher.pread(&chain, &connection, chain.outermost(), &mut buf, 0, Flags::NONE).unwrap();
        assert_eq!(buf, vec![0u8; 16]);
    }

    #[test]
    fn data_path_call_after_shutdown_begins_fails_with_shutting_down() {
        let chain = single_plugin_chain(4096);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());

        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        connection.begin_shutdown();

        let mut buf = vec![0u8; 16];
        let err = dispatcher.pread(&chain, &connection, chain.outermost(), &mut buf, 0, Flags::NONE).unwrap_err();
        assert!(matches!(err, ChainError::ShuttingDown));
    }

    #[test]
    fn pwrite_then_pread_observes_write() {
        let chain = single_plugin_chain(4096);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        dispatcher.pwrite(&chain, &connection, chain.outermost(), &[9, 9, 9], 10, Flags::NONE).unwrap();
        let mut buf = vec![0u8; 3];
        dispatcher.pread(&chain, &connection, chain.outermost(), &mut buf, 10, Flags::NONE).unwrap();
        assert_eq!(buf, vec![9, 9, 9]);
    }

    #[test]
    fn readonly_connection_forces_can_write_false_and_rejects_pwrite() {
        let chain = single_plugin_chain(4096);
        let connection = Connection::new(chain.clone(), false, true);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, true, "").unwrap();
        dispatcher.prepare(&chain, &connection, true).unwrap();

        assert_eq!(dispatcher.can_write(&chain, &connection, chain.outermost()).unwrap(), TriState::No);
        let err = dispatcher.pwrite(&chain, &connection, chain.outermost(), &[1], 0, Flags::NONE).unwrap_err();
        assert!(matches!(err, ChainError::Layer { kind: ErrnoKind::ReadOnly, .. }));
    }

    #[test]
    fn pread_past_end_of_export_is_rejected() {
        let chain = single_plugin_chain(100);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        let mut buf = vec![0u8; 50];
        let err = dispatcher.pread(&chain, &connection, chain.outermost(), &mut buf, 80, Flags::NONE).unwrap_err();
        assert!(matches!(err, ChainError::Range { .. }));
    }

    #[test]
    fn zero_emulates_via_pwrite_when_layer_cannot_zero() {
        let chain = single_plugin_chain(64);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        dispatcher.pwrite(&chain, &connection, chain.outermost(), &[7, 7, 7, 7], 0, Flags::NONE).unwrap();
        dispatcher.zero(&chain, &connection, chain.outermost(), 0, 4, Flags::NONE).unwrap();
        let mut buf = vec![9u8; 4];
        dispatcher.pread(&chain, &connection, chain.outermost(), &mut buf, 0, Flags::NONE).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);
    }

    #[test]
    fn fast_zero_without_native_support_is_rejected() {
        let chain = single_plugin_chain(64);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        let err = dispatcher
            .zero(&chain, &connection, chain.outermost(), 0, 4, Flags::FAST_ZERO)
            .unwrap_err();
        assert!(matches!(err, ChainError::FastZeroNotSupported));
    }

    /// Literal scenario S2: a layer that emulates `zero` but has not
    /// separately claimed `can_fast_zero` must still reject `FAST_ZERO`,
    /// not merely layers reporting `can_zero == NONE`.
    #[test]
    fn fast_zero_rejected_when_zero_is_only_emulated() {
        let mut plugin = RecordingLayer::with_size(64);
        plugin.can_zero = Some(SupportLevel::Emulate);
        plugin.can_fast_zero = Some(TriState::No);
        let chain = chain_with(plugin);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        let err = dispatcher
            .zero(&chain, &connection, chain.outermost(), 0, 4, Flags::FAST_ZERO)
            .unwrap_err();
        assert!(matches!(err, ChainError::FastZeroNotSupported));
    }

    #[test]
    fn fua_rejected_when_layer_has_no_fua_support() {
        let mut plugin = RecordingLayer::with_size(64);
        plugin.can_fua = Some(SupportLevel::None);
        let chain = chain_with(plugin);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        let err = dispatcher
            .pwrite(&chain, &connection, chain.outermost(), &[1, 2, 3, 4], 0, Flags::FUA)
            .unwrap_err();
        assert!(matches!(err, ChainError::Layer { kind: ErrnoKind::NotSupported, .. }));
    }

    #[test]
    fn trim_rejected_when_layer_has_no_trim_support() {
        let mut plugin = RecordingLayer::with_size(64);
        plugin.can_trim = Some(TriState::No);
        let chain = chain_with(plugin);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        let err = dispatcher.trim(&chain, &connection, chain.outermost(), 0, 4, Flags::NONE).unwrap_err();
        assert!(matches!(err, ChainError::Layer { kind: ErrnoKind::NotSupported, .. }));
    }

    #[test]
    fn extents_default_to_single_allocated_record_without_support() {
        let chain = single_plugin_chain(64);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        let list = dispatcher.extents(&chain, &connection, chain.outermost(), 0, 64, Flags::NONE).unwrap();
        assert_eq!(list.records().len(), 1);
        assert_eq!(list.records()[0].ty, ExtentType::ALLOCATED);
    }

    #[test]
    fn disallowed_flag_rejected_before_touching_the_layer() {
        let chain = single_plugin_chain(64);
        let connection = Connection::new(chain.clone(), false, false);
        let dispatcher = ChainDispatcher::new(Limits::default());
        dispatcher.open(&chain, &connection, false, "").unwrap();
        dispatcher.prepare(&chain, &connection, false).unwrap();

        let mut buf = vec![0u8; 4];
        let err = dispatcher
            .pread(&chain, &connection, chain.outermost(), &mut buf, 0, Flags::FUA)
            .unwrap_err();
        assert!(matches!(err, ChainError::Invalid { .. }));
    }
}
