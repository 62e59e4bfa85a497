//! Durable account storage.
//!
//! The server only talks to accounts through [`CredentialStore`], a blocking
//! interface. Async callers go through [`call_blocking`] so password hashing
//! and disk writes never stall the runtime's worker threads.

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub username: String,
    pub password_hash: String,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_login: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account file i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("account file is corrupt: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("no account named {0}")]
    UnknownAccount(String),

    #[error("account store lock poisoned")]
    Poisoned,

    #[error("account store task failed: {0}")]
    Task(String),
}

pub trait CredentialStore: Send + Sync {
    /// Creates an account. Returns `false` if the username is taken.
    fn register(&self, username: &str, password: &str) -> Result<bool, StoreError>;

    /// Checks a password and records the login time when it matches.
    /// Returns `false` for unknown users and wrong passwords alike.
    fn authenticate(&self, username: &str, password: &str) -> Result<bool, StoreError>;

    fn increment_message_count(&self, username: &str) -> Result<(), StoreError>;

    fn account(&self, username: &str) -> Result<Option<Account>, StoreError>;

    fn exists(&self, username: &str) -> Result<bool, StoreError>;

    fn list_all(&self) -> Result<Vec<Account>, StoreError>;
}

pub type SharedStore = Arc<dyn CredentialStore>;

/// Runs a store operation on the blocking thread pool.
pub async fn call_blocking<T, F>(store: &SharedStore, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn CredentialStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
}

/// Accounts kept in memory and mirrored to a JSON file after every change.
pub struct JsonAccountStore {
    path: Option<PathBuf>,
    hasher: Argon2<'static>,
    accounts: Mutex<BTreeMap<String, Account>>,
}

impl JsonAccountStore {
    /// Loads `path` if it exists; otherwise starts empty and creates the file
    /// on the first registration.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let accounts = load_accounts(&path)?;
        debug!(path = %path.display(), accounts = accounts.len(), "loaded account store");
        Ok(Self {
            path: Some(path),
            hasher: Argon2::default(),
            accounts: Mutex::new(accounts),
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            hasher: Argon2::default(),
            accounts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Replaces the argon2id cost parameters used for new hashes. Existing
    /// hashes keep verifying with the parameters encoded in them.
    pub fn with_params(mut self, params: Params) -> Self {
        self.hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Account>>, StoreError> {
        self.accounts.lock().map_err(|_| StoreError::Poisoned)
    }

    fn persist(&self, accounts: &BTreeMap<String, Account>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let accounts: Vec<&Account> = accounts.values().collect();
        let encoded = serde_json::to_vec_pretty(&accounts)?;
        let staging = path.with_extension("tmp");
        fs::write(&staging, encoded)?;
        fs::rename(&staging, path)?;
        Ok(())
    }

    /// Persists `staged` and only then makes it the live state, so a failed
    /// write leaves memory matching the file.
    fn commit(
        &self,
        accounts: &mut BTreeMap<String, Account>,
        staged: BTreeMap<String, Account>,
    ) -> Result<(), StoreError> {
        self.persist(&staged)?;
        *accounts = staged;
        Ok(())
    }

    fn hash_password(&self, password: &str) -> Result<String, StoreError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .hasher
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| StoreError::Hash(err.to_string()))?;
        Ok(hash.to_string())
    }
}

impl CredentialStore for JsonAccountStore {
    fn register(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        // Hash outside the lock.
        let password_hash = self.hash_password(password)?;

        let mut accounts = self.lock()?;
        if accounts.contains_key(username) {
            return Ok(false);
        }

        let now = Utc::now();
        let mut staged = accounts.clone();
        staged.insert(
            username.to_string(),
            Account {
                username: username.to_string(),
                password_hash,
                message_count: 0,
                created_at: now,
                last_login: now,
            },
        );
        self.commit(&mut accounts, staged)?;
        Ok(true)
    }

    fn authenticate(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        let Some(stored_hash) = self.lock()?.get(username).map(|a| a.password_hash.clone()) else {
            return Ok(false);
        };

        if !verify_password(password, &stored_hash)? {
            return Ok(false);
        }

        let mut accounts = self.lock()?;
        let mut staged = accounts.clone();
        if let Some(account) = staged.get_mut(username) {
            account.last_login = Utc::now();
        }
        self.commit(&mut accounts, staged)?;
        Ok(true)
    }

    fn increment_message_count(&self, username: &str) -> Result<(), StoreError> {
        let mut accounts = self.lock()?;
        let mut staged = accounts.clone();
        let account = staged
            .get_mut(username)
            .ok_or_else(|| StoreError::UnknownAccount(username.to_string()))?;
        account.message_count += 1;
        self.commit(&mut accounts, staged)
    }

    fn account(&self, username: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.lock()?.get(username).cloned())
    }

    fn exists(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.contains_key(username))
    }

    fn list_all(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

fn load_accounts(path: &Path) -> Result<BTreeMap<String, Account>, StoreError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(err.into()),
    };

    let accounts: Vec<Account> = serde_json::from_slice(&raw)?;
    Ok(accounts
        .into_iter()
        .map(|account| (account.username.clone(), account))
        .collect())
}

fn verify_password(password: &str, hash: &str) -> Result<bool, StoreError> {
    let parsed = PasswordHash::new(hash).map_err(|err| StoreError::Hash(err.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Minimum argon2 cost; only for tests that register many accounts.
#[cfg(test)]
pub(crate) fn fast_params() -> Params {
    Params::new(Params::MIN_M_COST, Params::MIN_T_COST, Params::MIN_P_COST, None)
        .expect("minimum argon2 params are valid")
}
