//! Shared primitive types.

/// Token content as decoded bytes.
pub type Token = Vec<u8>;

/// Token identifier.
pub type TokenId = u32;

/// DFA state label. Real states are non-negative; see [`DEAD_STATE`].
pub type StateId = i32;

/// Dense identifier of a byte equivalence class.
pub type SymbolId = u32;

/// Synthetic sentinel state: the walk ended or no transition is available.
/// Never a real DFA state.
pub const DEAD_STATE: StateId = -1;
