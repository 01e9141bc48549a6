//! The uniform operation surface every layer implements (spec §4.1).
//!
//! Every method that a layer may legitimately leave unimplemented returns
//! `Option<Result<_, ChainError>>`: `None` means "not implemented, let the
//! dispatcher apply its forwarding/default rule"; `Some(Err(_))` is a real
//! failure from the layer. `open` is the one chain-control operation every
//! layer must provide, since it is where a layer's handle comes from.

use crate::error::ChainError;
use crate::extent::ExtentList;
use crate::flags::{Flags, SupportLevel, TriState};
use std::any::Any;

/// The opaque per-connection handle a layer's `open` produces. The
/// dispatcher never inspects it; it exists only to be handed back to the
/// same layer's later calls.
pub type LayerHandle = Box<dyn Any + Send + Sync>;

/// One entry in a `list_exports` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: String,
    pub description: Option<String>,
}

/// The chain-control surface a filter's `open` is given to recurse into its
/// inner neighbour (spec §4.3: "The layer's open typically calls the
/// dispatcher recursively via 'next ops'"). Scoped to one context; every
/// method here is the dispatcher's own wrapper for that context, so all of
/// the dispatcher's preconditions and capability caching still apply.
pub trait NextOps: Send + Sync {
    fn open(&self, readonly: bool, exportname: &str) -> Result<(), ChainError>;
    fn default_export(&self, readonly: bool) -> Result<Option<String>, ChainError>;

    fn can_write(&self) -> Result<bool, ChainError>;
    fn can_flush(&self) -> Result<bool, ChainError>;
    fn is_rotational(&self) -> Result<bool, ChainError>;
    fn can_trim(&self) -> Result<bool, ChainError>;
    fn can_zero(&self) -> Result<SupportLevel, ChainError>;
    fn can_fast_zero(&self) -> Result<bool, ChainError>;
    fn can_fua(&self) -> Result<SupportLevel, ChainError>;
    fn can_multi_conn(&self) -> Result<bool, ChainError>;
    fn can_cache(&self) -> Result<SupportLevel, ChainError>;
    fn can_extents(&self) -> Result<bool, ChainError>;
    fn get_size(&self) -> Result<i64, ChainError>;
    fn export_description(&self) -> Result<Option<String>, ChainError>;

    fn pread(&self, buf: &mut [u8], offset: i64) -> Result<(), ChainError>;
    fn pwrite(&self, buf: &[u8], offset: i64, flags: Flags) -> Result<(), ChainError>;
    fn flush(&self) -> Result<(), ChainError>;
    fn trim(&self, offset: i64, count: i64, flags: Flags) -> Result<(), ChainError>;
    fn zero(&self, offset: i64, count: i64, flags: Flags) -> Result<(), ChainError>;
    fn extents(&self, offset: i64, count: i64, flags: Flags) -> Result<ExtentList, ChainError>;
    fn cache(&self, offset: i64, count: i64) -> Result<(), ChainError>;
}

/// The uniform operation set a plugin or filter implements (spec §4.1).
pub trait LayerOps: Send + Sync {
    /// List the exports this layer serves. Absence means "no exports of my
    /// own", which the dispatcher's default-export pass (spec §4.4) then
    /// fills in from `default_export`.
    fn list_exports(&self, _readonly: bool) -> Result<Vec<ExportEntry>, ChainError> {
        Ok(Vec::new())
    }

    /// The export name this layer serves when the client requests the
    /// empty name. `None` means the layer has no opinion.
    fn default_export(&self, _readonly: bool) -> Result<Option<String>, ChainError> {
        Ok(None)
    }

    /// Opens a fresh per-connection handle. `next` is `Some` for filters,
    /// bound to the context of this layer's inner neighbour; `None` for
    /// plugins.
    fn open(
        &self,
        readonly: bool,
        exportname: &str,
        next: Option<&dyn NextOps>,
    ) -> Result<LayerHandle, ChainError>;

    fn prepare(&self, _handle: &LayerHandle, _readonly: bool) -> Result<(), ChainError> {
        Ok(())
    }

    fn finalize(&self, _handle: &LayerHandle) -> Result<(), ChainError> {
        Ok(())
    }

    fn close(&self, _handle: &LayerHandle) -> Result<(), ChainError> {
        Ok(())
    }

    fn can_write(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        None
    }

    fn can_flush(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        None
    }

    fn is_rotational(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        None
    }

    fn can_trim(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        None
    }

    fn can_zero(&self, _handle: &LayerHandle) -> Option<Result<SupportLevel, ChainError>> {
        None
    }

    fn can_fast_zero(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        None
    }

    fn can_fua(&self, _handle: &LayerHandle) -> Option<Result<SupportLevel, ChainError>> {
        None
    }

    fn can_multi_conn(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        None
    }

    fn can_cache(&self, _handle: &LayerHandle) -> Option<Result<SupportLevel, ChainError>> {
        None
    }

    fn can_extents(&self, _handle: &LayerHandle) -> Option<Result<TriState, ChainError>> {
        None
    }

    /// Unlike the other queries, a plugin must eventually answer this one:
    /// the dispatcher caches it but has no safe default to manufacture
    /// (spec §4.5, "negotiation phase guarantees it is known").
    fn get_size(&self, handle: &LayerHandle) -> Option<Result<i64, ChainError>>;

    /// Not cached by the dispatcher (spec §4.5: "its value may legitimately
    /// change across calls").
    fn export_description(&self, _handle: &LayerHandle) -> Option<Result<Option<String>, ChainError>> {
        None
    }

    fn pread(
        &self,
        _handle: &LayerHandle,
        _buf: &mut [u8],
        _offset: i64,
    ) -> Option<Result<(), ChainError>> {
        None
    }

    fn pwrite(
        &self,
        _handle: &LayerHandle,
        _buf: &[u8],
        _offset: i64,
        _flags: Flags,
    ) -> Option<Result<(), ChainError>> {
        None
    }

    fn flush(&self, _handle: &LayerHandle) -> Option<Result<(), ChainError>> {
        None
    }

    fn trim(
        &self,
        _handle: &LayerHandle,
        _offset: i64,
        _count: i64,
        _flags: Flags,
    ) -> Option<Result<(), ChainError>> {
        None
    }

    fn zero(
        &self,
        _handle: &LayerHandle,
        _offset: i64,
        _count: i64,
        _flags: Flags,
    ) -> Option<Result<(), ChainError>> {
        None
    }

    fn extents(
        &self,
        _handle: &LayerHandle,
        _offset: i64,
        _count: i64,
        _flags: Flags,
    ) -> Option<Result<ExtentList, ChainError>> {
        None
    }

    fn cache(&self, _handle: &LayerHandle, _offset: i64, _count: i64) -> Option<Result<(), ChainError>> {
        None
    }
}
