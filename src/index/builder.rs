//! Background BFS build of the token-level index.
//!
//! One work unit per frontier state; for frontiers narrower than the pool the
//! vocabulary itself is sharded across workers so a single expensive state
//! does not serialize the layer. A state is published the moment its scan
//! finishes, whole map at once, so readers never observe a partial state.

use std::env;
use std::sync::Arc;
use std::thread;

use once_cell::sync::Lazy;
use rayon::prelude::*;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use tracing::{debug, error, trace};

use super::SharedState;
use crate::dfa::Dfa;
use crate::primitives::{StateId, TokenId, DEAD_STATE};
use crate::vocabulary::Vocabulary;

/// Worker pool shared by every build in the process.
static POOL: Lazy<rayon::ThreadPool> = Lazy::new(|| {
    let threads = worker_threads(env::var("WORKER_THREADS").ok().as_deref());
    let mut pool = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("index-worker-{i}"));
    if let Some(threads) = threads {
        pool = pool.num_threads(threads);
    }
    pool.build().expect("failed to spawn the index worker pool")
});

/// Parses the `WORKER_THREADS` override; `None` defers to hardware
/// parallelism.
fn worker_threads(value: Option<&str>) -> Option<usize> {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&threads| threads > 0)
}

pub(crate) fn spawn(dfa: Arc<Dfa>, vocabulary: Arc<Vocabulary>, shared: Arc<SharedState>) {
    thread::spawn(move || run(&dfa, &vocabulary, &shared));
}

fn run(dfa: &Dfa, vocabulary: &Vocabulary, shared: &SharedState) {
    if let Err(reason) = validate(dfa) {
        error!(target: "fsm_index::builder", %reason, "rejecting malformed DFA descriptor");
        shared.fail(reason);
        return;
    }

    let eos_token_id = vocabulary.eos_token_id();
    let mut seen: HashSet<StateId> = HashSet::from_iter([dfa.initial()]);
    let mut frontier: Vec<StateId> = vec![dfa.initial()];

    while !frontier.is_empty() && !shared.is_cancelled() {
        trace!(target: "fsm_index::builder", states = frontier.len(), "scanning BFS layer");
        let shard_vocabulary = frontier.len() < POOL.current_num_threads();

        let targets: Vec<Vec<StateId>> = POOL.install(|| {
            frontier
                .par_iter()
                .filter_map(|&state| {
                    if shared.is_cancelled() {
                        return None;
                    }
                    let tokens = if shard_vocabulary {
                        scan_state_sharded(dfa, vocabulary, state, eos_token_id)
                    } else {
                        scan_state(dfa, vocabulary, state, eos_token_id)
                    };
                    let discovered = tokens
                        .values()
                        .copied()
                        .filter(|&next| next != DEAD_STATE)
                        .collect();
                    shared.publish(state, tokens);
                    Some(discovered)
                })
                .collect()
        });

        frontier = targets
            .into_iter()
            .flatten()
            .filter(|state| seen.insert(*state))
            .collect();
    }

    if shared.is_cancelled() {
        debug!(target: "fsm_index::builder", "index build cancelled");
        return;
    }
    debug!(target: "fsm_index::builder", states = seen.len(), "token index build complete");
    shared.complete();
}

/// Scans one state against the whole vocabulary sequentially.
fn scan_state(
    dfa: &Dfa,
    vocabulary: &Vocabulary,
    state: StateId,
    eos_token_id: TokenId,
) -> HashMap<TokenId, StateId> {
    let mut tokens: HashMap<TokenId, StateId> = HashMap::default();
    for (token, ids) in vocabulary.tokens() {
        if let Some(next) = dfa.walk(state, token) {
            if next == DEAD_STATE {
                continue;
            }
            for &token_id in ids {
                tokens.insert(token_id, next);
            }
        }
    }
    if dfa.is_final(state) {
        tokens.insert(eos_token_id, DEAD_STATE);
    }
    tokens
}

/// Same scan with the vocabulary split across the pool. The walker is
/// side-effect free, so shards merge by plain union.
fn scan_state_sharded(
    dfa: &Dfa,
    vocabulary: &Vocabulary,
    state: StateId,
    eos_token_id: TokenId,
) -> HashMap<TokenId, StateId> {
    let mut tokens = vocabulary
        .tokens()
        .par_iter()
        .fold(
            HashMap::default,
            |mut shard: HashMap<TokenId, StateId>, (token, ids)| {
                if let Some(next) = dfa.walk(state, token) {
                    if next != DEAD_STATE {
                        for &token_id in ids {
                            shard.insert(token_id, next);
                        }
                    }
                }
                shard
            },
        )
        .reduce(HashMap::default, |mut left, right| {
            left.extend(right);
            left
        });
    if dfa.is_final(state) {
        tokens.insert(eos_token_id, DEAD_STATE);
    }
    tokens
}

/// Checks the descriptor before any scan; a violation fails the whole build.
fn validate(dfa: &Dfa) -> Result<(), String> {
    if dfa.initial() < 0 {
        return Err(format!("initial state {} is negative", dfa.initial()));
    }
    let symbols = dfa.symbol_count();
    for (&(state, symbol), &target) in dfa.transitions() {
        if state < 0 {
            return Err(format!("transition origin {state} is negative"));
        }
        if symbol >= symbols {
            return Err(format!(
                "transition ({state}, {symbol}) references an unknown symbol"
            ));
        }
        if target < DEAD_STATE {
            return Err(format!(
                "transition ({state}, {symbol}) targets invalid state {target}"
            ));
        }
    }
    Ok(())
}
