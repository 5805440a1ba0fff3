//! Creates `Vocabulary` from raw token mappings.

use bincode::{Decode, Encode};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::prelude::*;
use crate::{Error, Result};

/// `Vocabulary` of an LLM.
///
/// Tokens are bucketed by their decoded byte string: several token ids may
/// decode to the same bytes (prefix-space variants, byte-fallback aliases) and
/// the index treats every id of a bucket identically.
///
/// ## Examples
///
/// ```rust
/// # use fsm_index::prelude::*;
/// #
/// let eos_token_id = 1;
/// let mut vocabulary = Vocabulary::new(eos_token_id);
///
/// vocabulary.try_insert("token", 0).expect("New token inserted");
/// assert_eq!(vocabulary.token_ids("token"), Some(&vec![0]));
/// assert_eq!(vocabulary.eos_token_id(), eos_token_id);
/// ```
#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct Vocabulary {
    eos_token_id: TokenId,
    tokens: HashMap<Token, Vec<TokenId>>,
    special_token_ids: HashSet<TokenId>,
    empty_token_ids: HashSet<TokenId>,
}

impl Vocabulary {
    /// Creates an empty vocabulary.
    pub fn new(eos_token_id: TokenId) -> Self {
        Self {
            eos_token_id,
            tokens: HashMap::default(),
            special_token_ids: HashSet::from_iter([eos_token_id]),
            empty_token_ids: HashSet::default(),
        }
    }

    /// Builds a vocabulary from a raw `id -> token bytes` mapping.
    ///
    /// Special tokens are not part of the regular language and are skipped.
    /// Every remaining token runs through `decoder`, which turns the stored
    /// token into its human-visible bytes (sub-word prefix markers and other
    /// tokenizer conventions live entirely in the decoder). Tokens that decode
    /// to nothing are kept aside in [`Self::empty_token_ids`].
    pub fn from_raw(
        tokens: impl IntoIterator<Item = (TokenId, Token)>,
        eos_token_id: TokenId,
        special_token_ids: HashSet<TokenId>,
        decoder: impl Fn(&[u8]) -> Token,
    ) -> Result<Self> {
        let mut vocabulary = Vocabulary::new(eos_token_id);
        vocabulary.special_token_ids.extend(special_token_ids);

        let mut seen: HashSet<TokenId> = HashSet::default();
        for (token_id, token) in tokens {
            if !seen.insert(token_id) {
                return Err(Error::TokenIdCollision(token_id));
            }
            if vocabulary.special_token_ids.contains(&token_id) {
                continue;
            }
            let decoded = decoder(&token);
            if decoded.is_empty() {
                vocabulary.empty_token_ids.insert(token_id);
            } else {
                vocabulary.tokens.entry(decoded).or_default().push(token_id);
            }
        }

        // Bucket order must not depend on the input iteration order.
        for ids in vocabulary.tokens.values_mut() {
            ids.sort_unstable();
        }
        Ok(vocabulary)
    }

    /// Inserts a token to the vocabulary with the specified identifier.
    pub fn try_insert(&mut self, token: impl Into<Token>, id: TokenId) -> Result<()> {
        if id == self.eos_token_id {
            return Err(Error::EosTokenDisallowed);
        }
        let token = token.into();
        if token.is_empty() {
            self.empty_token_ids.insert(id);
            return Ok(());
        }
        self.tokens.entry(token).or_default().push(id);
        Ok(())
    }

    /// Removes a given token from the vocabulary.
    pub fn remove(&mut self, token: impl Into<Token>) {
        let token = token.into();
        self.tokens.remove(&token);
    }

    /// Returns all decoded tokens with their token ids.
    pub fn tokens(&self) -> &HashMap<Token, Vec<TokenId>> {
        &self.tokens
    }

    /// Returns all token ids per provided token if available in the vocabulary.
    pub fn token_ids(&self, token: impl AsRef<[u8]>) -> Option<&Vec<TokenId>> {
        self.tokens.get(token.as_ref())
    }

    /// Gets the identifier of the special end of the sentence token.
    pub fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    /// Token ids excluded from indexing.
    pub fn special_token_ids(&self) -> &HashSet<TokenId> {
        &self.special_token_ids
    }

    /// Token ids whose decoded form is empty; they never reach the walker.
    pub fn empty_token_ids(&self) -> &HashSet<TokenId> {
        &self.empty_token_ids
    }

    pub fn len(&self) -> usize {
        // +1 for eos_token_id which is not in self.tokens map.
        self.tokens.values().map(|ids| ids.len()).sum::<usize>() + 1
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Stable digest over the vocabulary content.
    ///
    /// Identical raw inputs give the identical digest in any process, which
    /// makes it usable as a cache fingerprint component.
    pub fn digest(&self) -> [u8; 32] {
        let mut entries: Vec<(&Token, &Vec<TokenId>)> = self.tokens.iter().collect();
        entries.sort_by(|left, right| left.0.cmp(right.0));

        let mut hasher = Sha256::new();
        hasher.update(self.eos_token_id.to_le_bytes());
        for (token, ids) in entries {
            hasher.update((token.len() as u64).to_le_bytes());
            hasher.update(token);
            let mut ids = ids.clone();
            ids.sort_unstable();
            hasher.update((ids.len() as u64).to_le_bytes());
            for id in ids {
                hasher.update(id.to_le_bytes());
            }
        }
        for set in [&self.special_token_ids, &self.empty_token_ids] {
            let mut ids: Vec<TokenId> = set.iter().copied().collect();
            ids.sort_unstable();
            hasher.update((ids.len() as u64).to_le_bytes());
            for id in ids {
                hasher.update(id.to_le_bytes());
            }
        }
        hasher.finalize().into()
    }

    /// Serialises the vocabulary into an opaque blob.
    ///
    /// The blob is self-contained: deserialising it in another process needs
    /// no tokenizer and preserves every bucket, the EOS id and the digest.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(encode_to_vec(self, config::standard())?)
    }

    /// Recovers a vocabulary serialised with [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (vocabulary, _) = decode_from_slice(bytes, config::standard())?;
        Ok(vocabulary)
    }
}

impl std::fmt::Display for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Vocabulary object with eos_token_id={:?} and the following tokens to token_ids:",
            self.eos_token_id
        )?;
        for (token, token_ids) in self.tokens.iter() {
            writeln!(
                f,
                "{:?} -> {:?}",
                token
                    .iter()
                    .map(|b| format!("0x{:02X}", b))
                    .collect::<Vec<_>>(),
                token_ids
            )?;
        }
        Ok(())
    }
}

impl TryFrom<(TokenId, HashMap<Token, Vec<TokenId>>)> for Vocabulary {
    type Error = Error;

    fn try_from(values: (TokenId, HashMap<Token, Vec<TokenId>>)) -> Result<Self, Self::Error> {
        let (eos_token_id, tokens) = values;
        if tokens.iter().any(|(_, ids)| ids.contains(&eos_token_id)) {
            return Err(Error::EosTokenDisallowed);
        }
        Ok(Vocabulary {
            eos_token_id,
            tokens,
            special_token_ids: HashSet::from_iter([eos_token_id]),
            empty_token_ids: HashSet::default(),
        })
    }
}

impl TryFrom<(TokenId, HashMap<String, Vec<TokenId>>)> for Vocabulary {
    type Error = Error;

    fn try_from(values: (TokenId, HashMap<String, Vec<TokenId>>)) -> Result<Self, Self::Error> {
        let (eos_token_id, tokens) = values;
        let tokens = tokens
            .into_iter()
            .map(|(token, ids)| {
                if ids.contains(&eos_token_id) {
                    Err(Error::EosTokenDisallowed)
                } else {
                    Ok((token.into_bytes(), ids))
                }
            })
            .collect::<Result<HashMap<Token, Vec<TokenId>>, _>>()?;
        Self::try_from((eos_token_id, tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_interface() {
        let eos_token_id = 3;
        let mut vocabulary = Vocabulary::new(eos_token_id);

        match vocabulary.try_insert("eos-token", eos_token_id) {
            Err(Error::EosTokenDisallowed) => {}
            _ => unreachable!(),
        }

        // New empty vocabulary.
        assert_eq!(vocabulary.eos_token_id, eos_token_id);
        assert!(vocabulary.tokens.is_empty());

        for (token, id) in [("zero", 0), ("one", 1), ("two", 2)] {
            vocabulary.try_insert(token, id).expect("Insert failed");
            assert_eq!(vocabulary.token_ids(token), Some(&vec![id]));
        }
        assert_eq!(vocabulary.tokens.len(), 3);
        assert_eq!(vocabulary.len(), 4);

        // Confirm different types.
        vocabulary.try_insert(b"four", 4).expect("Insert failed");
        assert_eq!(vocabulary.token_ids("four"), Some(&vec![4]));

        vocabulary
            .try_insert(b"five".to_vec(), 5)
            .expect("Insert failed");
        assert_eq!(vocabulary.token_ids("five"), Some(&vec![5]));

        vocabulary.remove(b"four");
        assert_eq!(vocabulary.token_ids("four"), None);
    }

    #[test]
    fn empty_tokens_are_kept_aside() {
        let mut vocabulary = Vocabulary::new(0);
        vocabulary.try_insert("", 7).expect("Insert failed");
        assert!(vocabulary.tokens.is_empty());
        assert!(vocabulary.empty_token_ids().contains(&7));
    }

    #[test]
    fn from_raw_buckets_and_filters() {
        let raw = vec![
            (0, b"<s>".to_vec()),
            (1, b"a".to_vec()),
            (2, b"\xc4\xa0a".to_vec()),
            (3, b"ab".to_vec()),
            (4, b"</s>".to_vec()),
            (5, b"".to_vec()),
            (6, b"a".to_vec()),
        ];
        // Strips the GPT-2 style space marker so ` a` and `a` share a bucket.
        let decoder = |token: &[u8]| -> Token {
            match token.strip_prefix(b"\xc4\xa0".as_slice()) {
                Some(rest) => [&b" "[..], rest].concat(),
                None => token.to_vec(),
            }
        };
        let vocabulary = Vocabulary::from_raw(raw, 4, HashSet::from_iter([0]), decoder)
            .expect("Vocabulary failed");

        assert_eq!(vocabulary.eos_token_id(), 4);
        assert_eq!(vocabulary.token_ids("a"), Some(&vec![1, 6]));
        assert_eq!(vocabulary.token_ids(" a"), Some(&vec![2]));
        assert_eq!(vocabulary.token_ids("ab"), Some(&vec![3]));
        assert_eq!(vocabulary.token_ids("<s>"), None);
        assert_eq!(vocabulary.token_ids("</s>"), None);
        assert!(vocabulary.empty_token_ids().contains(&5));
        assert!(vocabulary.special_token_ids().contains(&4));
        assert!(vocabulary.special_token_ids().contains(&0));
    }

    #[test]
    fn from_raw_rejects_colliding_ids() {
        let raw = vec![(1, b"a".to_vec()), (1, b"b".to_vec())];
        match Vocabulary::from_raw(raw, 0, HashSet::default(), |t| t.to_vec()) {
            Err(Error::TokenIdCollision(1)) => {}
            other => panic!("expected TokenIdCollision, got {other:?}"),
        }
    }

    #[test]
    fn digest_is_stable_and_input_sensitive() {
        let build = |extra: Option<(&str, TokenId)>| {
            let mut vocabulary = Vocabulary::new(0);
            for (token, id) in [("a", 1), ("b", 2), ("ab", 3)] {
                vocabulary.try_insert(token, id).expect("Insert failed");
            }
            if let Some((token, id)) = extra {
                vocabulary.try_insert(token, id).expect("Insert failed");
            }
            vocabulary
        };

        assert_eq!(build(None).digest(), build(None).digest());
        assert_ne!(build(None).digest(), build(Some(("c", 4))).digest());
    }

    #[test]
    fn digest_ignores_insertion_order() {
        let mut forward = Vocabulary::new(0);
        let mut backward = Vocabulary::new(0);
        let entries = [("a", 1), ("b", 2), ("ab", 3)];
        for (token, id) in entries {
            forward.try_insert(token, id).expect("Insert failed");
        }
        for (token, id) in entries.iter().rev() {
            backward.try_insert(*token, *id).expect("Insert failed");
        }
        assert_eq!(forward.digest(), backward.digest());
    }

    #[test]
    fn blob_round_trip() {
        let raw = vec![
            (1, b"a".to_vec()),
            (2, b"b".to_vec()),
            (3, b"ab".to_vec()),
            (5, b"".to_vec()),
        ];
        let vocabulary = Vocabulary::from_raw(raw, 0, HashSet::from_iter([9]), |t| t.to_vec())
            .expect("Vocabulary failed");

        let blob = vocabulary.to_bytes().expect("Encode failed");
        let restored = Vocabulary::from_bytes(&blob).expect("Decode failed");

        assert_eq!(vocabulary, restored);
        assert_eq!(vocabulary.len(), restored.len());
        assert_eq!(vocabulary.eos_token_id(), restored.eos_token_id());
        assert_eq!(vocabulary.digest(), restored.digest());
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        assert!(Vocabulary::from_bytes(b"not a vocabulary").is_err());
    }

    #[test]
    fn try_from_rejects_eos_in_buckets() {
        let map: HashMap<Token, Vec<TokenId>> =
            HashMap::from_iter([(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![2])]);
        match Vocabulary::try_from((2u32, map)) {
            Err(Error::EosTokenDisallowed) => {}
            _ => unreachable!(),
        }
    }

    #[test]
    fn new_empty_vocabulary_from_hashmap() {
        let map: HashMap<Token, Vec<TokenId>> = HashMap::default();
        let vocabulary = Vocabulary::try_from((1u32, map)).expect("Vocabulary failed");
        assert_eq!(vocabulary.eos_token_id, 1);
        assert!(vocabulary.tokens.is_empty());
    }
}
