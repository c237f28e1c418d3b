//! Queue credential resolution.
//!
//! Credentials come from an ordered chain of providers; the first provider
//! that yields a token wins:
//!
//! 1. explicit value from the config file
//! 2. environment variable (default `QUEUESYNC_TOKEN`)
//! 3. ambient credential file in the platform config directory
//!
//! A provider that finds nothing returns `Ok(None)` and the chain moves on.
//! A provider that finds something broken (an unreadable or malformed file)
//! stops the chain with an error instead of silently falling through.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use zeroize::Zeroize;

/// Default environment variable holding the queue token.
pub const DEFAULT_TOKEN_ENV: &str = "QUEUESYNC_TOKEN";

/// Default profile read from the ambient credential file.
pub const DEFAULT_PROFILE: &str = "default";

/// Credential errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No provider produced a token.
    #[error("no queue credentials found (tried: {})", tried.join(", "))]
    NotFound {
        /// Provider names in the order tried.
        tried: Vec<String>,
    },

    /// Credential file exists but cannot be read.
    #[error("cannot read credential file {path}: {source}")]
    Unreadable {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Credential file is not valid.
    #[error("invalid credential file {path}: {message}")]
    Malformed {
        /// File path.
        path: PathBuf,
        /// What is wrong.
        message: String,
    },
}

/// A resolved bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    /// Wrap a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// The bearer token.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

// Don't leak token in debug output
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials([REDACTED])")
    }
}

/// One source of credentials.
pub trait CredentialProvider: Send + Sync {
    /// Name used in logs and in [`CredentialError::NotFound`].
    fn name(&self) -> String;

    /// Look for credentials. `Ok(None)` means "not here, try the next one".
    fn resolve(&self) -> Result<Option<Credentials>, CredentialError>;
}

/// Token given directly in configuration.
#[derive(Debug, Clone)]
pub struct ExplicitProvider {
    token: Option<Credentials>,
}

impl ExplicitProvider {
    /// Provider for an optional configured token. Blank tokens count as absent.
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token
                .filter(|t| !t.trim().is_empty())
                .map(Credentials::new),
        }
    }
}

impl CredentialProvider for ExplicitProvider {
    fn name(&self) -> String {
        "config".to_string()
    }

    fn resolve(&self) -> Result<Option<Credentials>, CredentialError> {
        Ok(self.token.clone())
    }
}

/// Token read from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvProvider {
    var: String,
}

impl EnvProvider {
    /// Read `var`.
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialProvider for EnvProvider {
    fn name(&self) -> String {
        format!("env:{}", self.var)
    }

    fn resolve(&self) -> Result<Option<Credentials>, CredentialError> {
        Ok(std::env::var(&self.var)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(Credentials::new))
    }
}

/// Token read from a TOML credential file with named profiles.
///
/// ```toml
/// [default]
/// token = "..."
///
/// [staging]
/// token = "..."
/// ```
#[derive(Debug, Clone)]
pub struct ProfileFileProvider {
    path: PathBuf,
    profile: String,
}

#[derive(Deserialize)]
struct ProfileEntry {
    token: String,
}

impl ProfileFileProvider {
    /// Read `profile` from the file at `path`.
    pub fn new(path: impl Into<PathBuf>, profile: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            profile: profile.into(),
        }
    }

    /// The ambient credential file location: `<config dir>/credentials`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "ydun", "queuesync")
            .map(|dirs| dirs.config_dir().join("credentials"))
    }

    /// The file this provider reads.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialProvider for ProfileFileProvider {
    fn name(&self) -> String {
        format!("file:{}[{}]", self.path.display(), self.profile)
    }

    fn resolve(&self) -> Result<Option<Credentials>, CredentialError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CredentialError::Unreadable {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut profiles: HashMap<String, ProfileEntry> =
            toml::from_str(&contents).map_err(|e| CredentialError::Malformed {
                path: self.path.clone(),
                message: e.to_string(),
            })?;

        Ok(profiles
            .remove(&self.profile)
            .map(|entry| entry.token.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(Credentials::new))
    }
}

/// Ordered list of providers.
#[derive(Default)]
pub struct CredentialChain {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl CredentialChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard order: explicit, environment, ambient file.
    pub fn standard(explicit: Option<String>, env_var: &str, profile: &str) -> Self {
        let mut chain = Self::new()
            .with(ExplicitProvider::new(explicit))
            .with(EnvProvider::new(env_var));
        if let Some(path) = ProfileFileProvider::default_path() {
            chain = chain.with(ProfileFileProvider::new(path, profile));
        }
        chain
    }

    /// Append a provider.
    pub fn with(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Ask each provider in turn.
    pub fn resolve(&self) -> Result<Credentials, CredentialError> {
        let mut tried = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let name = provider.name();
            if let Some(credentials) = provider.resolve()? {
                tracing::debug!(source = %name, "queue credentials resolved");
                return Ok(credentials);
            }
            tried.push(name);
        }
        Err(CredentialError::NotFound { tried })
    }
}

impl fmt::Debug for CredentialChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("CredentialChain")
            .field("providers", &names)
            .finish()
    }
}
