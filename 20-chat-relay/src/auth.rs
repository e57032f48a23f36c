//! Credential checks behind the `login` request.
//!
//! The relay only needs one question answered: given a nickname and a
//! password, is this a new account, a wrong password, or a match? Unknown
//! nicknames are registered on the spot with the password they came with.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::AuthError;

/// Result of a login attempt. The numeric codes are what the client sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    /// The nickname was unknown; an account was created with this password.
    Created = 0,
    BadPassword = 1,
    Accepted = 2,
}

impl LoginStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the connection gets bound to the nickname.
    pub fn admits(self) -> bool {
        !matches!(self, LoginStatus::BadPassword)
    }
}

/// Account lookup used by the dispatcher.
///
/// Implementations may block; the relay calls them from the blocking pool.
pub trait AuthGateway: Send + Sync + 'static {
    fn verify(&self, name: &str, password: &str) -> Result<LoginStatus, AuthError>;
}

/// Accounts that live as long as the process. Passwords are kept as given.
#[derive(Debug, Default)]
pub struct MemoryAuthStore {
    accounts: Mutex<BTreeMap<String, String>>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthGateway for MemoryAuthStore {
    fn verify(&self, name: &str, password: &str) -> Result<LoginStatus, AuthError> {
        let mut accounts = lock(&self.accounts);
        let status = match accounts.get(name) {
            None => {
                accounts.insert(name.to_string(), password.to_string());
                LoginStatus::Created
            }
            Some(stored) if stored == password => LoginStatus::Accepted,
            Some(_) => LoginStatus::BadPassword,
        };
        Ok(status)
    }
}

/// Accounts persisted to a JSON file as Argon2 PHC strings.
///
/// The whole file is rewritten through a uniquely named temporary sibling and
/// a rename each time an account is created.
#[derive(Debug)]
pub struct FileAuthStore {
    path: PathBuf,
    accounts: Mutex<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountFile {
    accounts: BTreeMap<String, String>,
}

impl FileAuthStore {
    /// Loads `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref().to_path_buf();
        let file = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<AccountFile>(&bytes)?,
            Err(err) if err.kind() == ErrorKind::NotFound => AccountFile::default(),
            Err(err) => return Err(err.into()),
        };

        info!(path = %path.display(), accounts = file.accounts.len(), "account store loaded");
        Ok(Self {
            path,
            accounts: Mutex::new(file.accounts),
        })
    }

    fn persist(&self, accounts: &BTreeMap<String, String>) -> Result<(), AuthError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staging = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut staging, &AccountFileRef { accounts })?;
        staging.as_file().sync_all()?;
        staging.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct AccountFileRef<'a> {
    accounts: &'a BTreeMap<String, String>,
}

impl AuthGateway for FileAuthStore {
    fn verify(&self, name: &str, password: &str) -> Result<LoginStatus, AuthError> {
        let mut accounts = lock(&self.accounts);
        if let Some(stored) = accounts.get(name) {
            let status = if password_matches(password, stored)? {
                LoginStatus::Accepted
            } else {
                LoginStatus::BadPassword
            };
            return Ok(status);
        }

        accounts.insert(name.to_string(), hash_password(password)?);
        if let Err(err) = self.persist(&accounts) {
            accounts.remove(name);
            return Err(err);
        }
        debug!(nickname = name, "account created");
        Ok(LoginStatus::Created)
    }
}

fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Hash(err.to_string()))
}

fn password_matches(password: &str, stored: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(stored).map_err(|err| AuthError::Hash(err.to_string()))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(err) => Err(AuthError::Hash(err.to_string())),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
