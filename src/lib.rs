//! A backend chain dispatcher for a user-space NBD server: layered
//! plugin/filter composition, per-connection context, capability
//! negotiation with cross-capability defaults, and extent-list
//! bookkeeping.
//!
//! The crate has three layers:
//!
//! - [`layer`] defines the operation surface every plugin or filter
//!   implements ([`layer::LayerOps`]) and the ordered [`layer::Chain`]
//!   they form.
//! - [`context`] and [`connection`] hold the per-layer and per-connection
//!   state a live client session needs.
//! - [`dispatcher::ChainDispatcher`] is the stateless engine that walks a
//!   chain against a connection, enforcing every precondition a layer
//!   author is entitled to assume already holds: flag validation, range
//!   checking, capability caching, and the emulation fallbacks for
//!   `zero`, `cache`, and `extents`.
//!
//! This crate does not speak the NBD wire protocol itself, load shared
//! objects, or provide a plugin ABI; a host binds those concerns on top by
//! implementing [`layer::LayerOps`] for its own plugins and filters and
//! driving [`dispatcher::ChainDispatcher`] from its own connection loop.

#![deny(unsafe_code)]

pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod extent;
pub mod flags;
pub mod layer;
pub mod limits;
pub mod observability;
pub mod unload;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use connection::Connection;
pub use context::Context;
pub use dispatcher::ChainDispatcher;
pub use error::{ChainError, ErrnoKind, Result};
pub use extent::{ExtentList, ExtentRecord};
pub use flags::{DataOp, ExtentType, Flags, SupportLevel, TriState};
pub use layer::{Chain, LayerDescriptor, LayerKind, LayerOps, NextOps};
pub use limits::Limits;
