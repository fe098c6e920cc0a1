//! Run state persistence
//!
//! States are stored as one JSON document per inbound transaction hash and
//! replaced atomically (temp file + rename), so a crash never leaves a half
//! written state behind.

use crate::error::{Result, RouteError};
use crate::state::RunState;
use ledger_client::{Account, Address, TxHash};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Storage for run states and seed accounts
///
/// `save` runs synchronously on a runtime worker while the run lock is held,
/// once per edge status change. Implementations must return quickly: one
/// small local write, no network round trips.
pub trait RunStore: Send + Sync {
    /// Load the run started by `inbound`
    fn load(&self, inbound: &TxHash) -> Result<Option<RunState>>;

    /// Persist a run, replacing any previous version
    fn save(&self, state: &RunState) -> Result<()>;

    /// Persist a seed account until a route consumes it
    fn save_seed(&self, seed: &Account) -> Result<()>;

    /// Load a seed account by address
    fn load_seed(&self, address: &Address) -> Result<Option<Account>>;
}

/// JSON files under a state directory
///
/// Each save writes a few kilobytes and renames it into place.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    root: PathBuf,
}

impl FileRunStore {
    /// Open (and create) the store at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("runs"))?;
        std::fs::create_dir_all(root.join("seeds"))?;
        Ok(Self { root })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, inbound: &TxHash) -> Result<PathBuf> {
        Ok(self
            .root
            .join("runs")
            .join(format!("{}.json", file_stem(inbound.normalized().as_str())?)))
    }

    fn seed_path(&self, address: &Address) -> Result<PathBuf> {
        Ok(self
            .root
            .join("seeds")
            .join(format!("{}.json", file_stem(address.normalized().as_str())?)))
    }
}

fn file_stem(key: &str) -> Result<&str> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RouteError::Store(format!("Invalid storage key '{}'", key)));
    }
    Ok(key)
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl RunStore for FileRunStore {
    fn load(&self, inbound: &TxHash) -> Result<Option<RunState>> {
        read_json(&self.run_path(inbound)?)
    }

    fn save(&self, state: &RunState) -> Result<()> {
        let path = self.run_path(&state.inbound)?;
        write_atomic(&path, &serde_json::to_string_pretty(state)?)?;
        debug!("Saved run state {} to {}", state.run_id, path.display());
        Ok(())
    }

    fn save_seed(&self, seed: &Account) -> Result<()> {
        let path = self.seed_path(&seed.address)?;
        write_atomic(&path, &serde_json::to_string_pretty(seed)?)
    }

    fn load_seed(&self, address: &Address) -> Result<Option<Account>> {
        read_json(&self.seed_path(address)?)
    }
}

/// In-memory store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<TxHash, RunState>>,
    seeds: Mutex<HashMap<Address, Account>>,
}

impl MemoryRunStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    fn load(&self, inbound: &TxHash) -> Result<Option<RunState>> {
        Ok(self.runs.lock().get(&inbound.normalized()).cloned())
    }

    fn save(&self, state: &RunState) -> Result<()> {
        self.runs
            .lock()
            .insert(state.inbound.normalized(), state.clone());
        Ok(())
    }

    fn save_seed(&self, seed: &Account) -> Result<()> {
        self.seeds
            .lock()
            .insert(seed.address.normalized(), seed.clone());
        Ok(())
    }

    fn load_seed(&self, address: &Address) -> Result<Option<Account>> {
        Ok(self.seeds.lock().get(&address.normalized()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunPhase;
    use ledger_client::Amount;

    fn sample(hash: &str, value: Amount) -> RunState {
        RunState::new(
            TxHash::new(hash),
            value,
            Account::generate(),
            Address::new("0xrecipient"),
        )
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).unwrap();
        let mut state = sample("0xABC123", 1_000_000_000);
        state.phase = RunPhase::Completed { delivered: 999 };

        store.save(&state).unwrap();
        let loaded = store.load(&TxHash::new("0xabc123")).unwrap().unwrap();

        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.phase, state.phase);
        assert!(dir.path().join("runs").join("0xabc123.json").exists());
        assert!(!dir.path().join("runs").join("0xabc123.json.tmp").exists());
    }

    #[test]
    fn test_file_store_missing_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).unwrap();

        assert!(store.load(&TxHash::new("0xdead")).unwrap().is_none());
    }

    #[test]
    fn test_file_store_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).unwrap();

        let err = store.load(&TxHash::new("../escape")).unwrap_err();
        assert!(matches!(err, RouteError::Store(_)));
    }

    #[test]
    fn test_seed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).unwrap();
        let seed = Account::generate();

        store.save_seed(&seed).unwrap();
        let loaded = store.load_seed(&seed.address).unwrap().unwrap();

        assert_eq!(loaded.address, seed.address);
        assert_eq!(loaded.secret(), seed.secret());
    }

    #[test]
    fn test_memory_store_overwrites() {
        let store = MemoryRunStore::new();
        let mut state = sample("0x01", 10);
        store.save(&state).unwrap();
        state.inbound_value = 20;
        store.save(&state).unwrap();

        assert_eq!(store.load(&TxHash::new("0x01")).unwrap().unwrap().inbound_value, 20);
    }
}
