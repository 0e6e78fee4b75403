//! Local signer that refuses to double sign.
//!
//! Every signature is checked against the last signed height, round and step.
//! The signing state is persisted before a fresh signature is handed out, so a
//! restarted node can never produce a second, different signature for the
//! same step.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tbft_types::{
    differ_only_by_timestamp, Address, KeyPair, Proposal, PublicKey, Signature, Vote, VoteType,
};
use tracing::{debug, warn};

/// Step of the last signature, ordered within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignStep {
    #[default]
    None,
    Propose,
    Prevote,
    Precommit,
}

impl From<VoteType> for SignStep {
    fn from(vote_type: VoteType) -> Self {
        match vote_type {
            VoteType::Prevote => SignStep::Prevote,
            VoteType::Precommit => SignStep::Precommit,
        }
    }
}

/// What the signer last signed.
///
/// `last_sign_bytes` is empty when nothing was signed at the recorded step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignState {
    pub last_height: u64,
    pub last_round: u32,
    pub last_step: SignStep,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_signature: Option<Signature>,
    #[serde(default, with = "hex::serde")]
    pub last_sign_bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum SignStateStoreError {
    #[error("sign state I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sign state encoding: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("height regression: last {last}, requested {requested}")]
    HeightRegression { last: u64, requested: u64 },

    #[error("round regression at height {height}: last {last}, requested {requested}")]
    RoundRegression {
        height: u64,
        last: u32,
        requested: u32,
    },

    #[error("step regression at {height}/{round}: last {last:?}, requested {requested:?}")]
    StepRegression {
        height: u64,
        round: u32,
        last: SignStep,
        requested: SignStep,
    },

    #[error("no last signature found")]
    NoLastSignature,

    #[error("conflicting data at {height}/{round}/{step:?}")]
    ConflictingData {
        height: u64,
        round: u32,
        step: SignStep,
    },

    #[error(transparent)]
    Store(#[from] SignStateStoreError),
}

/// Durable home for a [`SignState`].
pub trait SignStateStore: Send + Sync {
    /// Load the last saved state, `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<SignState>, SignStateStoreError>;

    /// Persist `state`. Must be durable when it returns.
    fn save(&self, state: &SignState) -> Result<(), SignStateStoreError>;
}

/// In-memory store. Clones share the same slot, which lets tests model a
/// restart with a fresh [`PrivValidator`] over the same store.
#[derive(Debug, Clone, Default)]
pub struct MemorySignStateStore {
    slot: Arc<Mutex<Option<SignState>>>,
}

impl MemorySignStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignStateStore for MemorySignStateStore {
    fn load(&self) -> Result<Option<SignState>, SignStateStoreError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, state: &SignState) -> Result<(), SignStateStoreError> {
        *self.slot.lock() = Some(state.clone());
        Ok(())
    }
}

/// JSON file store. Writes go to a synced temporary file that is renamed over
/// the target; the directory is synced after the rename.
#[derive(Debug, Clone)]
pub struct FileSignStateStore {
    path: PathBuf,
}

impl FileSignStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Make the rename itself durable.
    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), SignStateStoreError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| self.io_error(e))
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<(), SignStateStoreError> {
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> SignStateStoreError {
        SignStateStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SignStateStore for FileSignStateStore {
    fn load(&self) -> Result<Option<SignState>, SignStateStoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn save(&self, state: &SignState) -> Result<(), SignStateStoreError> {
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.tmp_path();
        let mut file = File::create(&tmp).map_err(|e| self.io_error(e))?;
        file.write_all(&json).map_err(|e| self.io_error(e))?;
        file.sync_all().map_err(|e| self.io_error(e))?;
        drop(file);
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        self.sync_dir()
    }
}

/// Check a request to sign at `(height, round, step)` against `state`.
///
/// Returns true when the request is for exactly the last signed step.
///
/// # Panics
///
/// If the state records sign bytes without a signature.
pub fn check_hrs(
    state: &SignState,
    height: u64,
    round: u32,
    step: SignStep,
) -> Result<bool, SignError> {
    if state.last_height > height {
        return Err(SignError::HeightRegression {
            last: state.last_height,
            requested: height,
        });
    }
    if state.last_height < height {
        return Ok(false);
    }
    if state.last_round > round {
        return Err(SignError::RoundRegression {
            height,
            last: state.last_round,
            requested: round,
        });
    }
    if state.last_round < round {
        return Ok(false);
    }
    if state.last_step > step {
        return Err(SignError::StepRegression {
            height,
            round,
            last: state.last_step,
            requested: step,
        });
    }
    if state.last_step < step {
        return Ok(false);
    }
    if state.last_sign_bytes.is_empty() {
        return Err(SignError::NoLastSignature);
    }
    assert!(
        state.last_signature.is_some(),
        "sign state has sign bytes but no signature"
    );
    Ok(true)
}

enum Signed {
    Fresh(Signature),
    Reused(Signature),
    ReusedWithTimestamp(Signature, u64),
}

/// The node's own validator key plus its signing state.
pub struct PrivValidator {
    key: KeyPair,
    state: Mutex<SignState>,
    store: Box<dyn SignStateStore>,
}

impl std::fmt::Debug for PrivValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivValidator")
            .field("address", &self.address())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl PrivValidator {
    /// Signer with a fresh, memory-only state.
    pub fn new(key: KeyPair) -> Self {
        Self {
            key,
            state: Mutex::new(SignState::default()),
            store: Box::new(MemorySignStateStore::new()),
        }
    }

    /// Signer resuming from whatever `store` holds.
    pub fn with_store(key: KeyPair, store: Box<dyn SignStateStore>) -> Result<Self, SignError> {
        let state = store.load()?.unwrap_or_default();
        debug!(
            height = state.last_height,
            round = state.last_round,
            step = ?state.last_step,
            "Loaded sign state"
        );
        Ok(Self {
            key,
            state: Mutex::new(state),
            store,
        })
    }

    pub fn address(&self) -> Address {
        self.key.address()
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    pub fn sign_state(&self) -> SignState {
        self.state.lock().clone()
    }

    /// Sign `vote` in place.
    ///
    /// A repeat request for the last signed step gets the previous signature
    /// back, with the previous timestamp if only the timestamp changed.
    pub fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignError> {
        let step = SignStep::from(vote.vote_type);
        match self.sign(vote.height, vote.round, step, vote.sign_bytes(chain_id))? {
            Signed::Fresh(sig) | Signed::Reused(sig) => vote.signature = sig,
            Signed::ReusedWithTimestamp(sig, timestamp_ms) => {
                vote.timestamp_ms = timestamp_ms;
                vote.signature = sig;
            }
        }
        Ok(())
    }

    /// Sign `proposal` in place, with the same reuse rules as votes.
    pub fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignError> {
        let sign_bytes = proposal.sign_bytes(chain_id);
        match self.sign(proposal.height, proposal.round, SignStep::Propose, sign_bytes)? {
            Signed::Fresh(sig) | Signed::Reused(sig) => proposal.signature = sig,
            Signed::ReusedWithTimestamp(sig, timestamp_ms) => {
                proposal.timestamp_ms = timestamp_ms;
                proposal.signature = sig;
            }
        }
        Ok(())
    }

    fn sign(
        &self,
        height: u64,
        round: u32,
        step: SignStep,
        sign_bytes: Vec<u8>,
    ) -> Result<Signed, SignError> {
        let mut state = self.state.lock();

        if check_hrs(&state, height, round, step)? {
            let last = state.last_signature.ok_or(SignError::NoLastSignature)?;
            if state.last_sign_bytes == sign_bytes {
                return Ok(Signed::Reused(last));
            }
            if let Some(timestamp_ms) = differ_only_by_timestamp(&state.last_sign_bytes, &sign_bytes)
            {
                return Ok(Signed::ReusedWithTimestamp(last, timestamp_ms));
            }
            warn!(height, round, ?step, "Refusing to sign conflicting data");
            return Err(SignError::ConflictingData {
                height,
                round,
                step,
            });
        }

        let signature = self.key.sign(&sign_bytes);
        let next = SignState {
            last_height: height,
            last_round: round,
            last_step: step,
            last_signature: Some(signature),
            last_sign_bytes: sign_bytes,
        };
        self.store.save(&next)?;
        *state = next;
        Ok(Signed::Fresh(signature))
    }

    /// Forget the signing history, persisting the empty state.
    pub fn reset(&self) -> Result<(), SignError> {
        let mut state = self.state.lock();
        let empty = SignState::default();
        self.store.save(&empty)?;
        *state = empty;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbft_types::test_utils::{test_block_id, test_key};
    use tbft_types::{BlockId, PartSetHeader};

    const CHAIN: &str = "test-chain";

    fn vote(height: u64, round: u32, vote_type: VoteType, block_id: BlockId, ts: u64) -> Vote {
        Vote::new(test_key(0).address(), 0, height, round, ts, vote_type, block_id)
    }

    #[test]
    fn test_identical_payload_reuses_signature() {
        let pv = PrivValidator::new(test_key(0));
        let mut first = vote(5, 0, VoteType::Prevote, test_block_id(b"a"), 100);
        pv.sign_vote(CHAIN, &mut first).unwrap();

        let mut again = vote(5, 0, VoteType::Prevote, test_block_id(b"a"), 100);
        pv.sign_vote(CHAIN, &mut again).unwrap();
        assert_eq!(again.signature, first.signature);
    }

    #[test]
    fn test_timestamp_only_difference_reuses_last_timestamp() {
        let pv = PrivValidator::new(test_key(0));
        let mut first = vote(5, 0, VoteType::Prevote, test_block_id(b"a"), 100);
        pv.sign_vote(CHAIN, &mut first).unwrap();

        let mut later = vote(5, 0, VoteType::Prevote, test_block_id(b"a"), 250);
        pv.sign_vote(CHAIN, &mut later).unwrap();
        assert_eq!(later.timestamp_ms, 100);
        assert_eq!(later.signature, first.signature);
        assert!(later.verify(CHAIN, &pv.public_key()).is_ok());
    }

    #[test]
    fn test_conflicting_payload_is_refused() {
        let pv = PrivValidator::new(test_key(0));
        let mut first = vote(5, 0, VoteType::Prevote, test_block_id(b"a"), 100);
        pv.sign_vote(CHAIN, &mut first).unwrap();

        let mut other = vote(5, 0, VoteType::Prevote, test_block_id(b"b"), 100);
        let err = pv.sign_vote(CHAIN, &mut other).unwrap_err();
        assert!(matches!(err, SignError::ConflictingData { height: 5, .. }));
        assert!(other.signature.is_zero());
        assert_eq!(pv.sign_state().last_signature, Some(first.signature));
    }

    #[test]
    fn test_regressions_are_refused() {
        let pv = PrivValidator::new(test_key(0));
        let mut v = vote(5, 2, VoteType::Precommit, BlockId::nil(), 1);
        pv.sign_vote(CHAIN, &mut v).unwrap();

        let mut lower_height = vote(4, 9, VoteType::Precommit, BlockId::nil(), 1);
        assert!(matches!(
            pv.sign_vote(CHAIN, &mut lower_height),
            Err(SignError::HeightRegression {
                last: 5,
                requested: 4
            })
        ));

        let mut lower_round = vote(5, 1, VoteType::Precommit, BlockId::nil(), 1);
        assert!(matches!(
            pv.sign_vote(CHAIN, &mut lower_round),
            Err(SignError::RoundRegression { .. })
        ));

        let mut lower_step = vote(5, 2, VoteType::Prevote, BlockId::nil(), 1);
        assert!(matches!(
            pv.sign_vote(CHAIN, &mut lower_step),
            Err(SignError::StepRegression { .. })
        ));

        let mut next_round = vote(5, 3, VoteType::Prevote, BlockId::nil(), 1);
        pv.sign_vote(CHAIN, &mut next_round).unwrap();
    }

    #[test]
    fn test_proposal_signing_precedes_votes() {
        let pv = PrivValidator::new(test_key(0));
        let parts = PartSetHeader::new(1, test_block_id(b"a").hash);
        let mut proposal = Proposal::new(3, 0, 10, parts, None, BlockId::nil());
        pv.sign_proposal(CHAIN, &mut proposal).unwrap();
        assert!(proposal.verify(CHAIN, &pv.public_key()).is_ok());

        let mut prevote = vote(3, 0, VoteType::Prevote, test_block_id(b"a"), 11);
        pv.sign_vote(CHAIN, &mut prevote).unwrap();

        let mut late = Proposal::new(3, 0, 12, parts, None, BlockId::nil());
        assert!(matches!(
            pv.sign_proposal(CHAIN, &mut late),
            Err(SignError::StepRegression { .. })
        ));
    }

    #[test]
    fn test_no_last_signature_for_empty_step() {
        let state = SignState {
            last_height: 1,
            last_round: 0,
            last_step: SignStep::Prevote,
            last_signature: None,
            last_sign_bytes: Vec::new(),
        };
        assert!(matches!(
            check_hrs(&state, 1, 0, SignStep::Prevote),
            Err(SignError::NoLastSignature)
        ));
    }

    #[test]
    #[should_panic(expected = "sign bytes but no signature")]
    fn test_sign_bytes_without_signature_panics() {
        let state = SignState {
            last_height: 1,
            last_round: 0,
            last_step: SignStep::Prevote,
            last_signature: None,
            last_sign_bytes: vec![1, 2, 3],
        };
        let _ = check_hrs(&state, 1, 0, SignStep::Prevote);
    }

    #[test]
    fn test_restart_keeps_protection() {
        let store = MemorySignStateStore::new();
        let mut first = vote(7, 0, VoteType::Prevote, test_block_id(b"a"), 1);
        PrivValidator::with_store(test_key(0), Box::new(store.clone()))
            .unwrap()
            .sign_vote(CHAIN, &mut first)
            .unwrap();

        let restarted = PrivValidator::with_store(test_key(0), Box::new(store)).unwrap();
        let mut conflicting = vote(7, 0, VoteType::Prevote, test_block_id(b"b"), 1);
        assert!(restarted.sign_vote(CHAIN, &mut conflicting).is_err());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("priv_validator_state.json");
        let store = FileSignStateStore::new(&path);
        assert!(store.load().unwrap().is_none());

        let pv = PrivValidator::with_store(test_key(0), Box::new(store.clone())).unwrap();
        let mut v = vote(9, 1, VoteType::Precommit, test_block_id(b"a"), 5);
        pv.sign_vote(CHAIN, &mut v).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, pv.sign_state());
        assert_eq!(loaded.last_step, SignStep::Precommit);

        pv.reset().unwrap();
        assert_eq!(store.load().unwrap().unwrap(), SignState::default());
    }

    #[test]
    fn test_file_store_replaces_state_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSignStateStore::new(dir.path().join("priv_validator_state.json"));
        let pv = PrivValidator::with_store(test_key(0), Box::new(store.clone())).unwrap();

        let mut first = vote(3, 0, VoteType::Prevote, test_block_id(b"a"), 1);
        pv.sign_vote(CHAIN, &mut first).unwrap();
        let mut second = vote(3, 0, VoteType::Precommit, test_block_id(b"a"), 2);
        pv.sign_vote(CHAIN, &mut second).unwrap();

        assert_eq!(store.load().unwrap().unwrap().last_step, SignStep::Precommit);
        assert!(!store.tmp_path().exists());
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_file_store_save_failure_withholds_signature() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSignStateStore::new(dir.path().join("missing").join("state.json"));
        let pv = PrivValidator::with_store(test_key(0), Box::new(store)).unwrap();

        let mut v = vote(3, 0, VoteType::Prevote, test_block_id(b"a"), 1);
        assert!(pv.sign_vote(CHAIN, &mut v).is_err());
        assert!(v.signature.is_zero());
        assert_eq!(pv.sign_state(), SignState::default());
    }
}
