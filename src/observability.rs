//! Tracing spans for the chain-control path (spec §9-FULL). The data path
//! is intentionally left unlogged by default: `pread`/`pwrite` run on every
//! request and a span per call would dominate output at any real
//! throughput. A host wanting data-path visibility can wrap
//! [`crate::dispatcher::ChainDispatcher`] itself with its own spans.

use tracing::{span, Level, Span};

/// A debug-level span covering one chain-control call (`open`, `prepare`,
/// `finalize`, `close`, `reopen`). Named after the call so `RUST_LOG`
/// filtering can target a single one, e.g. `nbd_backend_chain[open]=debug`.
pub fn chain_control_span(op: &'static str, layer: &str, index: usize) -> Span {
    span!(Level::DEBUG, "chain_control", op, layer, index)
}

/// A warn-level span for the connection-teardown path, where errors are
/// logged but deliberately not propagated (spec §4.3: every layer's `close`
/// runs regardless of an earlier layer's failure).
pub fn teardown_span(layer: &str, index: usize) -> Span {
    span!(Level::WARN, "teardown", layer, index)
}
