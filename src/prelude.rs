//! Library's interface essentials.

pub use bincode::{config, decode_from_slice, encode_to_vec, Decode, Encode};
pub use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

pub use super::{
    dfa::Dfa,
    index::{Instruction, LazyIndex},
    primitives::{StateId, SymbolId, Token, TokenId, DEAD_STATE},
    vocabulary::Vocabulary,
};
