//! The crate's error domain: a POSIX-errno-shaped enum for data-path
//! failures, plus the programming-error variants the dispatcher raises when
//! a layer or caller violates a precondition.

use std::fmt;

/// Stable classification every `ChainError` carries, independent of its
/// human-readable message. Mirrors the errno domain named in spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrnoKind {
    Io,
    Invalid,
    NoSpace,
    PermissionDenied,
    ShuttingDown,
    ReadOnly,
    NotSupported,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// A precondition was violated in a way that indicates a bug in a layer
    /// or caller rather than a runtime condition: non-contiguous extent
    /// adds, offsets beyond `INT64_MAX`, malformed layer names, and the
    /// like. Never retried by the dispatcher.
    #[error("range violation: {detail}")]
    Range { detail: String },

    /// A request-level precondition failed (unknown flag, bad size, stale
    /// capability assumption).
    #[error("invalid request: {detail}")]
    Invalid { detail: String },

    /// An operation was dispatched through a context whose `FAILED` flag is
    /// already set (spec §7, "fatal chain failures").
    #[error("context has already failed")]
    Failed,

    /// The chain (or this connection) began tearing down while the
    /// operation was in flight (spec §7, "Shutdown").
    #[error("shutting down")]
    ShuttingDown,

    /// A layer returned an error without the data-path wrapper being able
    /// to attribute it to a more specific kind.
    #[error("layer returned an error: {detail}")]
    Layer { kind: ErrnoKind, detail: String },

    /// The sanctioned "fast-zero not possible" channel (spec §4.6, §7):
    /// `ENOTSUP`/`EOPNOTSUPP` surfaced only from `zero` when `FAST_ZERO` was
    /// requested and the layer cannot honor it without falling back to a
    /// full `pwrite` of zeroes.
    #[error("fast zero not supported; retry without FAST_ZERO")]
    FastZeroNotSupported,

    /// Wraps an I/O failure surfaced by an external collaborator (e.g. a
    /// layer backed by a real file descriptor).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainError {
    pub fn range(detail: impl Into<String>) -> Self {
        ChainError::Range { detail: detail.into() }
    }

    pub fn invalid(detail: impl Into<String>) -> Self {
        ChainError::Invalid { detail: detail.into() }
    }

    pub fn layer(kind: ErrnoKind, detail: impl Into<String>) -> Self {
        ChainError::Layer { kind, detail: detail.into() }
    }

    /// The errno-domain classification a wire encoder would map this error
    /// to (spec §6). `Range`/`Invalid`/`Failed` all surface as `EINVAL` at
    /// the protocol boundary.
    pub fn errno_kind(&self) -> ErrnoKind {
        match self {
            ChainError::Range { .. } | ChainError::Invalid { .. } | ChainError::Failed => {
                ErrnoKind::Invalid
            }
            ChainError::ShuttingDown => ErrnoKind::ShuttingDown,
            ChainError::Layer { kind, .. } => *kind,
            ChainError::FastZeroNotSupported => ErrnoKind::NotSupported,
            ChainError::Io(_) => ErrnoKind::Io,
        }
    }
}

impl fmt::Display for ErrnoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrnoKind::Io => "EIO",
            ErrnoKind::Invalid => "EINVAL",
            ErrnoKind::NoSpace => "ENOSPC",
            ErrnoKind::PermissionDenied => "EPERM",
            ErrnoKind::ShuttingDown => "ESHUTDOWN",
            ErrnoKind::ReadOnly => "EROFS",
            ErrnoKind::NotSupported => "ENOTSUP",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
