//! Wire-stable constants shared with the (external) wire codec: request
//! flag bits, capability tri-states, and extent-type bits. Values are fixed
//! by spec §6 and must never change once a wire codec depends on them.

/// Per-request flag bits. A given operation only accepts a subset of these
/// (see [`allowed_flags`]); anything else fails the request before it
/// reaches a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u32);

impl Flags {
    pub const FUA: Flags = Flags(1 << 0);
    pub const MAY_TRIM: Flags = Flags(1 << 1);
    pub const REQ_ONE: Flags = Flags(1 << 2);
    pub const FAST_ZERO: Flags = Flags(1 << 3);
    pub const NONE: Flags = Flags(0);

    pub const fn from_bits(bits: u32) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_subset_of(self, allowed: Flags) -> bool {
        self.0 & !allowed.0 == 0
    }

    pub const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

/// The client-visible operation a data-path call corresponds to, used only
/// to look up its allowed flag set (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOp {
    Pread,
    Pwrite,
    Flush,
    Trim,
    Zero,
    Extents,
    Cache,
}

/// The allowed flag set for a given data-path operation (spec §4.6):
/// `pread`: none; `pwrite`/`trim`: `FUA`; `zero`: `FUA | MAY_TRIM |
/// FAST_ZERO`; `extents`: `REQ_ONE`; `flush`/`cache`: none.
pub fn allowed_flags(op: DataOp) -> Flags {
    match op {
        DataOp::Pread | DataOp::Flush | DataOp::Cache => Flags::NONE,
        DataOp::Pwrite | DataOp::Trim => Flags::FUA,
        DataOp::Zero => Flags::FUA.union(Flags::MAY_TRIM).union(Flags::FAST_ZERO),
        DataOp::Extents => Flags::REQ_ONE,
    }
}

/// Tri-valued capability answer used by the plain `can_…`/`is_…` queries
/// (spec §4.1): `Yes`/`No` from a successful layer call, `Error` when the
/// layer's query itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    Error = -1,
    No = 0,
    Yes = 1,
}

impl TriState {
    pub fn is_yes(self) -> bool {
        matches!(self, TriState::Yes)
    }
}

/// `can_zero` / `can_fua` / `can_cache` share this three-level capability:
/// unsupported, emulated by the dispatcher, or natively handled by the
/// layer (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SupportLevel {
    None = 0,
    Emulate = 1,
    Native = 2,
}

/// Extent-type bits (spec §6): `0` is always the safe default (allocated
/// data); future bits must preserve that property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentType(pub u32);

impl ExtentType {
    pub const ALLOCATED: ExtentType = ExtentType(0);
    pub const HOLE: ExtentType = ExtentType(1 << 0);
    pub const ZERO: ExtentType = ExtentType(1 << 1);

    /// Union semantics of overlapping coverage is bitwise-AND: a byte is a
    /// hole only if all contributing sources agree it is (spec §3).
    pub fn merge(self, other: ExtentType) -> ExtentType {
        ExtentType(self.0 & other.0)
    }
}
