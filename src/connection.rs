//! Connection-scope state: the registry of per-layer [`Context`]s and the
//! handful of values that are resolved once per connection rather than once
//! per layer (spec §3 "Connection", §4.4).

use crate::context::Context;
use crate::layer::Chain;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One client connection's view of a loaded chain. Holds at most one
/// [`Context`] per layer, plus one `default_export` resolution per layer
/// (spec §3 `default_exportname[0..k-1]`, §4.4 "memoised in
/// `connection.default_exportname[layer.i]`" — each layer's own answer is
/// cached independently, since a filter and its inner neighbour may
/// legitimately disagree).
#[derive(Debug)]
pub struct Connection {
    chain: Arc<Chain>,
    contexts: Vec<RwLock<Option<Context>>>,
    default_export: Vec<Mutex<Option<Option<String>>>>,
    export_name: Mutex<Option<String>>,
    using_tls: bool,
    readonly: bool,
    shutting_down: AtomicBool,
}

impl Connection {
    pub fn new(chain: Arc<Chain>, using_tls: bool, readonly: bool) -> Self {
        let len = chain.len();
        Connection {
            chain,
            contexts: (0..len).map(|_| RwLock::new(None)).collect(),
            default_export: (0..len).map(|_| Mutex::new(None)).collect(),
            export_name: Mutex::new(None),
            using_tls,
            readonly,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Marks the connection as tearing down (spec §7 "Shutdown"). Every
    /// data-path call observed after this point fails with
    /// [`crate::error::ChainError::ShuttingDown`] instead of reaching a
    /// layer; chain-control calls (`finalize`/`close`) are unaffected so
    /// teardown can still run to completion.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn using_tls(&self) -> bool {
        self.using_tls
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn context(&self, index: usize) -> &RwLock<Option<Context>> {
        &self.contexts[index]
    }

    pub fn export_name(&self) -> Option<String> {
        self.export_name.lock().clone()
    }

    pub fn set_export_name(&self, name: impl Into<String>) {
        *self.export_name.lock() = Some(name.into());
    }

    /// Returns `index`'s cached `default_export` answer, if one was already
    /// resolved for that layer. `Some(None)` is a valid cached answer
    /// meaning "this layer has no opinion".
    pub fn cached_default_export(&self, index: usize) -> Option<Option<String>> {
        self.default_export[index].lock().clone()
    }

    pub fn cache_default_export(&self, index: usize, resolved: Option<String>) {
        let mut slot = self.default_export[index].lock();
        if slot.is_none() {
            *slot = Some(resolved);
        }
    }

    /// Drops every layer's context, as on connection teardown. Contexts are
    /// not individually `close`d here: the dispatcher's `close` walk must
    /// run first so each layer gets a chance to release its resources.
    pub fn clear_all_contexts(&self) {
        for slot in &self.contexts {
            *slot.write() = None;
        }
    }
}
