use thiserror::Error;

use crate::primitives::TokenId;

pub type Result<T, E = crate::Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to compile the regex into a DFA: {0}")]
    InvalidRegex(#[from] Box<regex_automata::dfa::dense::BuildError>),
    #[error("DFA has no anchored start state")]
    DfaHasNoStartState,
    #[error("EOS token id cannot be inserted as a regular token")]
    EosTokenDisallowed,
    #[error("Token id {0} is assigned to more than one token")]
    TokenIdCollision(TokenId),
    #[error("Index build was cancelled")]
    Cancelled,
    #[error("Index build failed: {0}")]
    BuildFailed(String),
    #[error(transparent)]
    EncodeError(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    DecodeError(#[from] bincode::error::DecodeError),
}

impl Error {
    /// Whether the error ends the life of a handle (every later read repeats it).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::BuildFailed(_))
    }
}
