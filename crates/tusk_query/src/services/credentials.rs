//! Credential resolution for connection profiles.
//!
//! Passwords live behind a `CredentialsProvider` chosen once at startup:
//!
//! - **File**: JSON file with owner-only permissions, for unsigned development builds where
//!   keychain prompts reappear on every rebuild
//! - **Keychain**: the OS credential store (macOS Keychain, Windows Credential Manager,
//!   Secret Service)
//! - **Session**: in-memory only, lost on exit
//!
//! The query core only ever reads through [`CredentialService::resolve`]. Secrets are never
//! logged and never appear in `Debug` output.

use crate::error::TuskError;
use crate::models::ConnectionProfile;

use keyring::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Service name used for keychain entries.
const KEYRING_SERVICE: &str = "dev.tusk.Tusk";

/// Environment variable that forces keychain usage in debug builds.
pub const FORCE_KEYCHAIN_ENV: &str = "TUSK_USE_KEYCHAIN";

/// Which provider backs the credential service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    /// File in debug builds (unless `TUSK_USE_KEYCHAIN=1`), keychain in release builds.
    #[default]
    Auto,
    /// JSON file under the Tusk config directory.
    File,
    /// OS keychain.
    Keychain,
    /// In-memory, per process.
    Session,
}

/// Authentication material for one profile.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login role.
    pub username: String,
    /// Password, if one is stored. Trust and peer authentication need none.
    pub password: Option<String>,
}

impl Credentials {
    /// Create credentials.
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self { username: username.into(), password }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A key/value secret store.
pub trait CredentialsProvider: Send + Sync {
    /// Store a secret.
    fn store(&self, key: &str, value: &str) -> Result<(), TuskError>;

    /// Get a secret.
    fn get(&self, key: &str) -> Result<Option<String>, TuskError>;

    /// Delete a secret. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<(), TuskError>;

    /// Check if a secret exists.
    fn exists(&self, key: &str) -> Result<bool, TuskError> {
        Ok(self.get(key)?.is_some())
    }

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

// ============================================================================
// FileCredentialsProvider
// ============================================================================

/// File-based secret storage.
#[derive(Debug)]
pub struct FileCredentialsProvider {
    file_path: PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    credentials: HashMap<String, String>,
}

impl FileCredentialsProvider {
    /// Open the default file, `<config dir>/tusk/dev_credentials.json`.
    pub fn open_default() -> Result<Self, TuskError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| TuskError::storage("Could not determine config directory", None))?
            .join("tusk");
        fs::create_dir_all(&config_dir)?;
        Self::open(config_dir.join("dev_credentials.json"))
    }

    /// Open (or lazily create) a credentials file at `file_path`.
    pub fn open(file_path: impl Into<PathBuf>) -> Result<Self, TuskError> {
        let file_path = file_path.into();
        let credentials = Self::load(&file_path)?;
        Ok(Self { file_path, cache: RwLock::new(credentials) })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn load(path: &Path) -> Result<HashMap<String, String>, TuskError> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        let file: CredentialsFile = serde_json::from_str(&contents)?;
        Ok(file.credentials)
    }

    /// Write the cache to disk, owner read/write only on Unix.
    fn save(&self, credentials: &HashMap<String, String>) -> Result<(), TuskError> {
        let file = CredentialsFile { credentials: credentials.clone() };
        let json = serde_json::to_string_pretty(&file)?;

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.file_path)?;
            file.write_all(json.as_bytes())?;
        }

        #[cfg(not(unix))]
        fs::write(&self.file_path, json)?;

        Ok(())
    }
}

impl CredentialsProvider for FileCredentialsProvider {
    fn store(&self, key: &str, value: &str) -> Result<(), TuskError> {
        let mut cache = self.cache.write();
        cache.insert(key.to_string(), value.to_string());
        self.save(&cache)?;
        tracing::debug!(key, "Credential stored in file");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, TuskError> {
        Ok(self.cache.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), TuskError> {
        let mut cache = self.cache.write();
        if cache.remove(key).is_some() {
            self.save(&cache)?;
            tracing::debug!(key, "Credential deleted from file");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

// ============================================================================
// KeychainCredentialsProvider
// ============================================================================

/// OS keychain storage.
#[derive(Debug)]
pub struct KeychainCredentialsProvider {
    service: String,
}

impl Default for KeychainCredentialsProvider {
    fn default() -> Self {
        Self { service: KEYRING_SERVICE.to_string() }
    }
}

impl KeychainCredentialsProvider {
    /// Create a keychain provider under the Tusk service name.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialsProvider for KeychainCredentialsProvider {
    fn store(&self, key: &str, value: &str) -> Result<(), TuskError> {
        Entry::new(&self.service, key)?.set_password(value)?;
        tracing::debug!(key, "Credential stored in keychain");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, TuskError> {
        match Entry::new(&self.service, key)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<(), TuskError> {
        match Entry::new(&self.service, key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "keychain"
    }
}

// ============================================================================
// SessionCredentialsProvider
// ============================================================================

/// In-memory storage; also the fallback when the file provider cannot be opened.
#[derive(Debug, Default)]
pub struct SessionCredentialsProvider {
    store: RwLock<HashMap<String, String>>,
}

impl SessionCredentialsProvider {
    /// Create an empty session store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialsProvider for SessionCredentialsProvider {
    fn store(&self, key: &str, value: &str) -> Result<(), TuskError> {
        self.store.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, TuskError> {
        Ok(self.store.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), TuskError> {
        self.store.write().remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "session"
    }
}

// ============================================================================
// CredentialService
// ============================================================================

fn keychain_forced() -> bool {
    std::env::var(FORCE_KEYCHAIN_ENV).map(|v| v == "1").unwrap_or(false)
}

fn file_or_session() -> Box<dyn CredentialsProvider> {
    match FileCredentialsProvider::open_default() {
        Ok(provider) => Box::new(provider),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to open credentials file, using session storage");
            Box::new(SessionCredentialsProvider::new())
        }
    }
}

fn select_provider(backend: CredentialBackend) -> Box<dyn CredentialsProvider> {
    match backend {
        CredentialBackend::File => file_or_session(),
        CredentialBackend::Keychain => Box::new(KeychainCredentialsProvider::new()),
        CredentialBackend::Session => Box::new(SessionCredentialsProvider::new()),
        CredentialBackend::Auto if keychain_forced() || !cfg!(debug_assertions) => {
            Box::new(KeychainCredentialsProvider::new())
        }
        CredentialBackend::Auto => file_or_session(),
    }
}

/// Resolves profiles to credentials through the active provider.
pub struct CredentialService {
    provider: Box<dyn CredentialsProvider>,
}

impl CredentialService {
    /// Create a service backed by the provider `backend` selects.
    pub fn from_backend(backend: CredentialBackend) -> Self {
        let provider = select_provider(backend);
        tracing::info!(provider = provider.name(), ?backend, "Credential service initialized");
        Self { provider }
    }

    /// Create a service over an explicit provider.
    pub fn with_provider(provider: Box<dyn CredentialsProvider>) -> Self {
        Self { provider }
    }

    /// Name of the active provider.
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    fn password_key(profile_id: Uuid) -> String {
        format!("db:{profile_id}")
    }

    /// Store the password for a profile.
    pub fn store_password(&self, profile_id: Uuid, password: &str) -> Result<(), TuskError> {
        self.provider.store(&Self::password_key(profile_id), password)?;
        tracing::debug!(%profile_id, "Password stored");
        Ok(())
    }

    /// Retrieve the password for a profile.
    pub fn get_password(&self, profile_id: Uuid) -> Result<Option<String>, TuskError> {
        self.provider.get(&Self::password_key(profile_id))
    }

    /// Delete the password for a profile.
    pub fn delete_password(&self, profile_id: Uuid) -> Result<(), TuskError> {
        self.provider.delete(&Self::password_key(profile_id))
    }

    /// Check if a password is stored for a profile.
    pub fn has_password(&self, profile_id: Uuid) -> Result<bool, TuskError> {
        self.provider.exists(&Self::password_key(profile_id))
    }

    /// Resolve a profile to authentication material.
    ///
    /// Provider failures surface as `TuskError::Authentication`; the provider's message is
    /// kept but no secret material is included.
    pub fn resolve(&self, profile: &ConnectionProfile) -> Result<Credentials, TuskError> {
        let password = self.get_password(profile.id).map_err(|e| {
            tracing::warn!(
                profile_id = %profile.id,
                provider = self.provider.name(),
                error = %e,
                "Credential lookup failed"
            );
            TuskError::authentication_with_hint(
                format!("Could not read the stored password for '{}': {e}", profile.name),
                e.hint().unwrap_or_else(|| "Re-enter the password for this connection".to_string()),
            )
        })?;

        if password.is_none() {
            tracing::debug!(profile_id = %profile.id, "No stored password, connecting without one");
        }

        Ok(Credentials::new(profile.username.clone(), password))
    }
}

impl std::fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialService").field("provider", &self.provider.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FailingProvider;

    impl CredentialsProvider for FailingProvider {
        fn store(&self, _key: &str, _value: &str) -> Result<(), TuskError> {
            Err(TuskError::keyring("locked", None))
        }

        fn get(&self, _key: &str) -> Result<Option<String>, TuskError> {
            Err(TuskError::keyring("The keychain is locked", Some("Unlock your keychain")))
        }

        fn delete(&self, _key: &str) -> Result<(), TuskError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn test_file_provider_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");

        {
            let provider = FileCredentialsProvider::open(&path).unwrap();
            provider.store("db:one", "secret").unwrap();
            provider.store("db:two", "other").unwrap();
            provider.delete("db:two").unwrap();
        }

        let provider = FileCredentialsProvider::open(&path).unwrap();
        assert_eq!(provider.get("db:one").unwrap().as_deref(), Some("secret"));
        assert!(!provider.exists("db:two").unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_provider_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");
        FileCredentialsProvider::open(&path).unwrap().store("db:x", "pw").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_provider_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");
        fs::write(&path, "{not json").unwrap();

        let err = FileCredentialsProvider::open(&path).unwrap_err();
        assert_eq!(err.category(), "Storage");
    }

    #[test]
    fn test_resolve_uses_profile_username_and_stored_password() {
        let service = CredentialService::with_provider(Box::new(SessionCredentialsProvider::new()));
        let profile = ConnectionProfile::new("local", "localhost", "postgres", "admin");

        let creds = service.resolve(&profile).unwrap();
        assert_eq!(creds.username, "admin");
        assert!(creds.password.is_none());

        service.store_password(profile.id, "hunter2").unwrap();
        assert!(service.has_password(profile.id).unwrap());
        let creds = service.resolve(&profile).unwrap();
        assert_eq!(creds.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_resolve_failure_is_authentication_error() {
        let service = CredentialService::with_provider(Box::new(FailingProvider));
        let profile = ConnectionProfile::new("prod", "db", "app", "app");

        let err = service.resolve(&profile).unwrap_err();
        assert_eq!(err.category(), "Authentication");
        assert_eq!(err.hint().as_deref(), Some("Unlock your keychain"));
    }

    #[test]
    fn test_debug_output_redacts_password() {
        let creds = Credentials::new("admin", Some("hunter2".to_string()));
        let debug = format!("{creds:?}");
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_explicit_session_backend() {
        let service = CredentialService::from_backend(CredentialBackend::Session);
        assert_eq!(service.provider_name(), "session");
    }
}
