//! Lazy token-level index over a DFA and a vocabulary.
//!
//! [`LazyIndex`] is usable the moment it is created: a background build walks
//! the DFA breadth-first and publishes one state at a time, and queries block
//! only until the single state they need is finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::{Deserialize, Serialize};

use crate::dfa::Dfa;
use crate::primitives::{StateId, TokenId, DEAD_STATE};
use crate::vocabulary::Vocabulary;
use crate::{Error, Result};

mod builder;

/// Reply of [`LazyIndex::get_next_instruction`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Any of the listed tokens may be emitted next.
    Generate(Vec<TokenId>),
    /// Exactly this token sequence must be emitted.
    Write(Vec<TokenId>),
}

/// Build state shared between the handle and the workers.
///
/// Workers hold a strong reference to this state and nothing else; the handle
/// owns the other reference. Cancellation is a flag here, never a back-pointer
/// to the handle.
pub(crate) struct SharedState {
    inner: Mutex<IndexState>,
    finished: Condvar,
    cancel_flag: AtomicBool,
}

struct IndexState {
    /// Grows monotonically; a state's map never changes once inserted.
    states_to_tokens: HashMap<StateId, HashMap<TokenId, StateId>>,
    finished_states: HashSet<StateId>,
    completed: bool,
    cancelled: bool,
    failure: Option<String>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(IndexState {
                states_to_tokens: HashMap::default(),
                finished_states: HashSet::default(),
                completed: false,
                cancelled: false,
                failure: None,
            }),
            finished: Condvar::new(),
            cancel_flag: AtomicBool::new(false),
        }
    }

    /// Cheap check for workers to sample between states and shards.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    /// Makes `state` visible to readers, whole map at once.
    pub(crate) fn publish(&self, state: StateId, tokens: HashMap<TokenId, StateId>) {
        let mut inner = self.inner.lock();
        if inner.cancelled {
            return;
        }
        inner.states_to_tokens.insert(state, tokens);
        inner.finished_states.insert(state);
        self.finished.notify_all();
    }

    pub(crate) fn complete(&self) {
        let mut inner = self.inner.lock();
        if !inner.cancelled {
            inner.completed = true;
        }
        self.finished.notify_all();
    }

    pub(crate) fn fail(&self, reason: String) {
        self.cancel_with(Some(reason));
    }

    fn cancel_with(&self, failure: Option<String>) {
        let mut inner = self.inner.lock();
        if inner.completed || inner.cancelled {
            return;
        }
        inner.cancelled = true;
        inner.failure = failure;
        self.cancel_flag.store(true, Ordering::Relaxed);
        self.finished.notify_all();
    }
}

fn read_error(inner: &IndexState) -> Error {
    match &inner.failure {
        Some(reason) => Error::BuildFailed(reason.clone()),
        None => Error::Cancelled,
    }
}

/// Handle over an in-progress or finished token-level index.
///
/// ## Example
/// ```rust
/// use fsm_index::prelude::*;
///
/// # fn run() -> Result<(), fsm_index::Error> {
/// let mut vocabulary = Vocabulary::new(0);
/// for (token, id) in [("0", 1), ("1", 2), ("12", 3)] {
///     vocabulary.try_insert(token, id)?;
/// }
///
/// let index = LazyIndex::new("[0-9]+", &vocabulary)?;
/// let instruction = index.get_next_instruction(index.initial_state())?;
/// let state = index.get_next_state(index.initial_state(), 3)?;
/// # Ok(())
/// # }
/// ```
pub struct LazyIndex {
    shared: Arc<SharedState>,
    initial_state: StateId,
    final_states: HashSet<StateId>,
    eos_token_id: TokenId,
}

impl LazyIndex {
    /// Compiles `regex` and spawns the background build.
    ///
    /// Regex compilation happens synchronously so invalid patterns are
    /// reported here; the token-level scan runs on the worker pool.
    pub fn new(regex: &str, vocabulary: &Vocabulary) -> Result<Self> {
        Ok(Self::from_dfa(Dfa::from_regex(regex)?, vocabulary))
    }

    /// Spawns the background build over an externally constructed DFA.
    pub fn from_dfa(dfa: Dfa, vocabulary: &Vocabulary) -> Self {
        let shared = Arc::new(SharedState::new());
        let initial_state = dfa.initial();
        let final_states = dfa.finals().clone();
        let eos_token_id = vocabulary.eos_token_id();
        builder::spawn(
            Arc::new(dfa),
            Arc::new(vocabulary.clone()),
            Arc::clone(&shared),
        );
        Self {
            shared,
            initial_state,
            final_states,
            eos_token_id,
        }
    }

    /// Returns the state reached from `state` by emitting `token_id`, or
    /// [`DEAD_STATE`] when no transition is available.
    ///
    /// Blocks while `state` is still being computed.
    pub fn get_next_state(&self, state: StateId, token_id: TokenId) -> Result<StateId> {
        if state == DEAD_STATE || token_id == self.eos_token_id {
            return Ok(DEAD_STATE);
        }
        let inner = self.wait_for_state(state)?;
        Ok(inner
            .states_to_tokens
            .get(&state)
            .and_then(|tokens| tokens.get(&token_id))
            .copied()
            .unwrap_or(DEAD_STATE))
    }

    /// Returns what the decoder may emit from `state`.
    ///
    /// [`Instruction::Write`] forces the EOS token: the walk has ended
    /// (`state` is the sentinel, or unreachable, or its only edge is the EOS
    /// edge). Otherwise every token keyed in the state's map is allowed and
    /// returned as [`Instruction::Generate`] in sorted order.
    pub fn get_next_instruction(&self, state: StateId) -> Result<Instruction> {
        if state == DEAD_STATE {
            return Ok(Instruction::Write(vec![self.eos_token_id]));
        }
        let inner = self.wait_for_state(state)?;
        let Some(tokens) = inner.states_to_tokens.get(&state) else {
            return Ok(Instruction::Write(vec![self.eos_token_id]));
        };
        if tokens.len() == 1 && tokens.contains_key(&self.eos_token_id) {
            return Ok(Instruction::Write(vec![self.eos_token_id]));
        }
        let mut allowed: Vec<TokenId> = tokens.keys().copied().collect();
        allowed.sort_unstable();
        Ok(Instruction::Generate(allowed))
    }

    /// Blocks until `state` is finished, or the build completes or dies.
    pub fn await_state(&self, state: StateId) -> Result<()> {
        self.wait_for_state(state).map(|_| ())
    }

    /// Blocks until the whole index is built.
    pub fn await_finished(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        loop {
            if inner.cancelled {
                return Err(read_error(&inner));
            }
            if inner.completed {
                return Ok(());
            }
            self.shared.finished.wait(&mut inner);
        }
    }

    /// Cancels the build; a no-op once the build has completed.
    ///
    /// Cancellation is cooperative: in-flight state scans finish and are
    /// discarded, every blocked reader is released, and pending and later
    /// reads fail with [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.shared.cancel_with(None);
    }

    pub fn initial_state(&self) -> StateId {
        self.initial_state
    }

    /// Returns set of final states.
    pub fn final_states(&self) -> &HashSet<StateId> {
        &self.final_states
    }

    /// Checks if state is in final states set or not.
    pub fn is_final_state(&self, state: StateId) -> bool {
        self.final_states.contains(&state)
    }

    /// Gets the identifier of the special end of the sentence token.
    pub fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    /// Non-blocking peek at the allowed tokens of an already-finished state.
    pub fn allowed_tokens(&self, state: StateId) -> Option<Vec<TokenId>> {
        let inner = self.shared.inner.lock();
        inner
            .states_to_tokens
            .get(&state)
            .map(|tokens| tokens.keys().copied().collect())
    }

    /// Snapshot of every finished state's `token id -> next state` map.
    pub fn states_to_token_maps(&self) -> HashMap<StateId, HashMap<TokenId, StateId>> {
        self.shared.inner.lock().states_to_tokens.clone()
    }

    /// Snapshot of the states finished so far.
    pub fn finished_states(&self) -> HashSet<StateId> {
        self.shared.inner.lock().finished_states.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.shared.inner.lock().completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.inner.lock().cancelled
    }

    fn wait_for_state(&self, state: StateId) -> Result<MutexGuard<'_, IndexState>> {
        let mut inner = self.shared.inner.lock();
        loop {
            if inner.cancelled {
                return Err(read_error(&inner));
            }
            if inner.finished_states.contains(&state) || inner.completed {
                return Ok(inner);
            }
            self.shared.finished.wait(&mut inner);
        }
    }
}

impl Drop for LazyIndex {
    fn drop(&mut self) {
        // Without the handle nobody can read the results; let workers stop.
        self.shared.cancel_with(None);
    }
}

impl std::fmt::Display for LazyIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "LazyIndex object with finished transitions:")?;
        for (state_id, token_ids) in self.states_to_token_maps().iter() {
            writeln!(f, "{:?} -> {:#?}", state_id, token_ids)?;
        }
        Ok(())
    }
}
