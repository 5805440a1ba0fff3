//! Flat DFA descriptors and the pure token walker.

use std::collections::VecDeque;

use regex_automata::dfa::dense::DFA;
use regex_automata::dfa::Automaton;
use regex_automata::util::primitives::StateID as AutomataStateId;
use regex_automata::Anchored;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use crate::primitives::{StateId, SymbolId};
use crate::{Error, Result};

/// Flat description of a character-level DFA.
///
/// The transition table is keyed by `(state, symbol)` where a symbol is a
/// dense identifier of a byte equivalence class; absence of a key means
/// rejection. Bytes missing from `symbol_of_byte` belong to the
/// `anything_else` class, so `.`-style classes stay cheap to describe.
///
/// A descriptor is immutable and freely shareable across threads.
#[derive(Clone, Debug, PartialEq)]
pub struct Dfa {
    initial: StateId,
    finals: HashSet<StateId>,
    transitions: HashMap<(StateId, SymbolId), StateId>,
    symbol_of_byte: HashMap<u8, SymbolId>,
    anything_else: SymbolId,
}

impl Dfa {
    /// Compiles `regex` into a flat descriptor.
    ///
    /// States are renumbered densely in BFS order, so the initial state is
    /// always `0` and the numbering is reproducible across runs.
    pub fn from_regex(regex: &str) -> Result<Self> {
        let dfa = DFA::new(regex).map_err(Box::new)?;
        let start = match dfa.universal_start_state(Anchored::Yes) {
            Some(state) => state,
            None => return Err(Error::DfaHasNoStartState),
        };

        // The largest byte class becomes the catch-all symbol; its bytes stay
        // out of the explicit mapping.
        let classes = dfa.byte_classes();
        let mut class_sizes = vec![0usize; classes.alphabet_len()];
        for byte in 0..=255u8 {
            class_sizes[classes.get(byte) as usize] += 1;
        }
        let mut anything_else = 0usize;
        for (class, size) in class_sizes.iter().enumerate() {
            if *size > class_sizes[anything_else] {
                anything_else = class;
            }
        }
        let anything_else = anything_else as SymbolId;

        let mut symbol_of_byte: HashMap<u8, SymbolId> = HashMap::default();
        for byte in 0..=255u8 {
            let symbol = classes.get(byte) as SymbolId;
            if symbol != anything_else {
                symbol_of_byte.insert(byte, symbol);
            }
        }

        let mut ids: HashMap<AutomataStateId, StateId> = HashMap::default();
        ids.insert(start, 0);
        let mut queue: VecDeque<AutomataStateId> = VecDeque::from([start]);
        let mut transitions: HashMap<(StateId, SymbolId), StateId> = HashMap::default();
        let mut finals: HashSet<StateId> = HashSet::default();

        while let Some(state) = queue.pop_front() {
            let from = ids[&state];
            if dfa.is_match_state(dfa.next_eoi_state(state)) {
                finals.insert(from);
            }
            for byte in 0..=255u8 {
                let next = dfa.next_state(state, byte);
                if dfa.is_dead_state(next) || dfa.is_quit_state(next) {
                    continue;
                }
                let to = match ids.get(&next) {
                    Some(&id) => id,
                    None => {
                        let id = ids.len() as StateId;
                        ids.insert(next, id);
                        queue.push_back(next);
                        id
                    }
                };
                transitions.insert((from, classes.get(byte) as SymbolId), to);
            }
        }

        Ok(Self {
            initial: 0,
            finals,
            transitions,
            symbol_of_byte,
            anything_else,
        })
    }

    /// Wraps an externally built descriptor verbatim.
    ///
    /// No validation happens here; the index builder checks the table before
    /// scanning and fails the handle on inconsistencies.
    pub fn from_parts(
        initial: StateId,
        finals: HashSet<StateId>,
        transitions: HashMap<(StateId, SymbolId), StateId>,
        symbol_of_byte: HashMap<u8, SymbolId>,
        anything_else: SymbolId,
    ) -> Self {
        Self {
            initial,
            finals,
            transitions,
            symbol_of_byte,
            anything_else,
        }
    }

    /// Walks `token` byte by byte starting from `state`.
    ///
    /// Returns the destination state, or `None` as soon as a byte has no
    /// transition. One table lookup per byte, no allocation.
    pub fn walk(&self, mut state: StateId, token: &[u8]) -> Option<StateId> {
        debug_assert!(!token.is_empty(), "empty tokens are filtered by callers");
        for byte in token {
            let symbol = self
                .symbol_of_byte
                .get(byte)
                .copied()
                .unwrap_or(self.anything_else);
            state = *self.transitions.get(&(state, symbol))?;
        }
        Some(state)
    }

    pub fn initial(&self) -> StateId {
        self.initial
    }

    pub fn finals(&self) -> &HashSet<StateId> {
        &self.finals
    }

    pub fn is_final(&self, state: StateId) -> bool {
        self.finals.contains(&state)
    }

    pub fn transitions(&self) -> &HashMap<(StateId, SymbolId), StateId> {
        &self.transitions
    }

    /// Number of symbols in the (dense) alphabet, the catch-all included.
    pub fn symbol_count(&self) -> SymbolId {
        self.symbol_of_byte
            .values()
            .copied()
            .chain(std::iter::once(self.anything_else))
            .max()
            .map_or(0, |max| max + 1)
    }
}
