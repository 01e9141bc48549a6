//! Layer descriptors and the ordered chain they form (spec §3 "Layer
//! Descriptor", §4.1 "Layer Interface").

mod ops;

pub use ops::{ExportEntry, LayerHandle, LayerOps, NextOps};

use crate::error::ChainError;
use crate::unload::{CallGuard, UnloadGuard, UnloadLock};
use std::sync::Arc;

/// Whether a layer is the innermost data source or a filter wrapping one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Plugin,
    Filter,
}

/// One layer's identity and position within the chain. `index` is the
/// layer's position counting from the innermost plugin (`0`); `next` names
/// the index of its inner neighbour and is `None` exactly when `index == 0`.
#[derive(Clone)]
pub struct LayerDescriptor {
    name: String,
    filename: String,
    kind: LayerKind,
    index: usize,
    next: Option<usize>,
    ops: Arc<dyn LayerOps>,
}

impl std::fmt::Debug for LayerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerDescriptor")
            .field("name", &self.name)
            .field("filename", &self.filename)
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

impl LayerDescriptor {
    /// Validates `name` ("non-empty ASCII, starts alphanumeric, then
    /// alphanumerics or `-`", spec §3) and the `next`/`index` link
    /// invariant before constructing the descriptor.
    pub fn new(
        name: impl Into<String>,
        filename: impl Into<String>,
        kind: LayerKind,
        index: usize,
        next: Option<usize>,
        ops: Arc<dyn LayerOps>,
    ) -> Result<Self, ChainError> {
        let name = name.into();
        let filename = filename.into();
        validate_name(&name)?;

        match (index, next) {
            (0, None) => {}
            (0, Some(_)) => {
                return Err(ChainError::range("the innermost layer (index 0) must have no next"))
            }
            (_, None) => {
                return Err(ChainError::range("every layer but the innermost must have a next"))
            }
            (i, Some(n)) if n >= i => {
                return Err(ChainError::range(format!(
                    "layer {i}'s next ({n}) must point strictly inward"
                )))
            }
            _ => {}
        }

        Ok(LayerDescriptor { name, filename, kind, index, next, ops })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn next(&self) -> Option<usize> {
        self.next
    }

    pub fn ops(&self) -> &dyn LayerOps {
        self.ops.as_ref()
    }
}

fn validate_name(name: &str) -> Result<(), ChainError> {
    if name.is_empty() {
        return Err(ChainError::range("layer name must not be empty"));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return Err(ChainError::range(format!(
            "layer name {name:?} must start with an ASCII alphanumeric character"
        )));
    }
    for c in chars {
        if !(c.is_ascii_alphanumeric() || c == '-') {
            return Err(ChainError::range(format!(
                "layer name {name:?} contains disallowed character {c:?}"
            )));
        }
    }
    Ok(())
}

/// The ordered chain of layers for one loaded backend, innermost first.
#[derive(Debug)]
pub struct Chain {
    descriptors: Vec<LayerDescriptor>,
    unload: UnloadLock,
}

impl Chain {
    /// Builds a chain from descriptors already ordered innermost-first,
    /// checking that indices are contiguous from `0` and every `next` link
    /// resolves within the vector.
    pub fn new(descriptors: Vec<LayerDescriptor>) -> Result<Self, ChainError> {
        if descriptors.is_empty() {
            return Err(ChainError::range("a chain must have at least one layer"));
        }
        for (position, descriptor) in descriptors.iter().enumerate() {
            if descriptor.index() != position {
                return Err(ChainError::range(format!(
                    "layer at position {position} has index {}, expected {position}",
                    descriptor.index()
                )));
            }
        }
        Ok(Chain { descriptors, unload: UnloadLock::new() })
    }

    /// Acquired by every dispatcher entry point for the duration of the
    /// call. Shared among concurrent calls; blocks only behind
    /// [`Chain::begin_unload`] (spec §5).
    pub fn enter_call(&self) -> CallGuard<'_> {
        self.unload.enter_call()
    }

    /// Acquired exclusively before a layer is unloaded from the process.
    /// Blocks until every call currently holding [`Chain::enter_call`] has
    /// returned.
    pub fn begin_unload(&self) -> UnloadGuard<'_> {
        self.unload.begin_unload()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The outermost layer: the entry point for every chain-control call.
    pub fn outermost(&self) -> usize {
        self.descriptors.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&LayerDescriptor> {
        self.descriptors.get(index)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LayerDescriptor> {
        self.descriptors.iter()
    }
}
