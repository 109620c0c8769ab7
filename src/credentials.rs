//! Layered credential resolution and explicit SSH key material.
//!
//! Lookups go explicit values first, then a key/value store (a snapshot of
//! the process environment, or an injected map in tests). When neither has
//! the key, the caller's default is returned and the `aws`/`gh` CLIs fall
//! back to their own default chain (instance role, profile, stored login).

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::{NamedTempFile, TempDir};

/// Environment variables forwarded to the `aws` CLI when present.
const AWS_KEYS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_PROFILE",
    "AWS_CONFIG_FILE",
    "AWS_SHARED_CREDENTIALS_FILE",
];

/// Environment variables forwarded to the `gh` CLI when present.
const GITHUB_KEYS: &[&str] = &["GH_TOKEN", "GITHUB_TOKEN", "GH_HOST", "GH_CONFIG_DIR"];

/// Credential resolver shared by every provider.
#[derive(Clone, Default)]
pub struct Credentials {
    explicit: HashMap<String, String>,
    store: Arc<HashMap<String, String>>,
}

impl Credentials {
    /// Credentials with explicit values and an empty store.
    pub fn new(explicit: HashMap<String, String>) -> Self {
        Self {
            explicit,
            store: Arc::new(HashMap::new()),
        }
    }

    /// Snapshot of the process environment, taken once.
    pub fn from_env() -> Self {
        Self::default().with_store(std::env::vars().collect())
    }

    pub fn with_store(mut self, store: HashMap<String, String>) -> Self {
        self.store = Arc::new(store);
        self
    }

    /// Adds or replaces an explicit value.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.explicit.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str, default: Option<&str>) -> Option<String> {
        self.explicit
            .get(key)
            .or_else(|| self.store.get(key))
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| default.map(str::to_string))
    }

    /// Like [`get`](Self::get) but the key must resolve.
    pub fn require(&self, key: &str) -> Result<String> {
        self.get(key, None)
            .with_context(|| format!("Missing credential '{}'", key))
    }

    /// Variables for `aws` child processes. Region comes from config.
    pub fn aws_env(&self, region: &str) -> Vec<(String, String)> {
        let mut env = self.forward(AWS_KEYS);
        env.push(("AWS_REGION".to_string(), region.to_string()));
        env.push(("AWS_DEFAULT_REGION".to_string(), region.to_string()));
        env.push(("AWS_PAGER".to_string(), String::new()));
        env
    }

    /// Variables for `gh` child processes.
    pub fn github_env(&self) -> Vec<(String, String)> {
        let mut env = self.forward(GITHUB_KEYS);
        env.push(("GH_PROMPT_DISABLED".to_string(), "1".to_string()));
        env.push(("NO_COLOR".to_string(), "1".to_string()));
        env
    }

    fn forward(&self, keys: &[&str]) -> Vec<(String, String)> {
        keys.iter()
            .filter_map(|k| self.get(k, None).map(|v| (k.to_string(), v)))
            .collect()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.explicit.keys().collect();
        keys.sort();
        f.debug_struct("Credentials")
            .field("explicit_keys", &keys)
            .field("store_len", &self.store.len())
            .finish()
    }
}

/// An SSH private key held in memory.
#[derive(Clone)]
pub struct KeyMaterial {
    pub private_key: Arc<Vec<u8>>,
    pub passphrase: Option<String>,
}

impl KeyMaterial {
    pub fn new(private_key: impl Into<Vec<u8>>, passphrase: Option<String>) -> Self {
        Self {
            private_key: Arc::new(private_key.into()),
            passphrase,
        }
    }

    /// Reads a key from disk. `~` in the path is expanded.
    pub fn from_file(path: &str, passphrase: Option<String>) -> Result<Self> {
        let expanded = shellexpand::tilde(path).into_owned();
        let bytes = std::fs::read(&expanded)
            .with_context(|| format!("Failed to read SSH key: {}", expanded))?;
        Ok(Self::new(bytes, passphrase))
    }

    /// Writes the key into a private scratch directory for `ssh -i`.
    ///
    /// The files are removed when the returned value is dropped.
    pub fn materialize(&self) -> Result<MaterializedKey> {
        let dir = tempfile::Builder::new()
            .prefix("tasklift-key-")
            .tempdir()
            .context("Failed to create key directory")?;

        let mut key_file = NamedTempFile::new_in(dir.path()).context("Failed to create key file")?;
        set_private(key_file.path())?;
        key_file
            .write_all(&self.private_key)
            .context("Failed to write key file")?;
        if !self.private_key.ends_with(b"\n") {
            key_file.write_all(b"\n").context("Failed to write key file")?;
        }
        key_file.flush().context("Failed to write key file")?;

        let askpass = match &self.passphrase {
            Some(passphrase) => Some(write_askpass(dir.path(), passphrase)?),
            None => None,
        };

        Ok(MaterializedKey {
            key_file,
            askpass,
            _dir: dir,
        })
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("private_key", &format_args!("<{} bytes>", self.private_key.len()))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A key written to disk for the lifetime of a transport.
pub struct MaterializedKey {
    key_file: NamedTempFile,
    askpass: Option<PathBuf>,
    _dir: TempDir,
}

impl MaterializedKey {
    pub fn key_path(&self) -> &Path {
        self.key_file.path()
    }

    /// Variables that make `ssh` read the passphrase from the helper.
    pub fn askpass_env(&self) -> Vec<(String, String)> {
        match &self.askpass {
            Some(helper) => vec![
                ("SSH_ASKPASS".to_string(), helper.display().to_string()),
                ("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string()),
                ("DISPLAY".to_string(), ":0".to_string()),
            ],
            None => Vec::new(),
        }
    }
}

fn write_askpass(dir: &Path, passphrase: &str) -> Result<PathBuf> {
    let secret = dir.join("passphrase");
    std::fs::write(&secret, passphrase).context("Failed to write passphrase file")?;
    set_private(&secret)?;

    let helper = dir.join("askpass.sh");
    let script = format!(
        "#!/bin/sh\ncat {}\n",
        shell_words::quote(&secret.display().to_string())
    );
    std::fs::write(&helper, script).context("Failed to write askpass helper")?;
    set_mode(&helper, 0o700)?;
    Ok(helper)
}

fn set_private(path: &Path) -> Result<()> {
    set_mode(path, 0o600)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_explicit_wins_over_store() {
        let creds = Credentials::new(store(&[("AWS_PROFILE", "explicit")]))
            .with_store(store(&[("AWS_PROFILE", "env"), ("GH_TOKEN", "tok")]));
        assert_eq!(creds.get("AWS_PROFILE", None).as_deref(), Some("explicit"));
        assert_eq!(creds.get("GH_TOKEN", None).as_deref(), Some("tok"));
        assert_eq!(creds.get("MISSING", Some("dflt")).as_deref(), Some("dflt"));
        assert!(creds.get("MISSING", None).is_none());
    }

    #[test]
    fn test_empty_values_fall_through() {
        let creds = Credentials::new(store(&[("AWS_PROFILE", "")]))
            .with_store(store(&[("AWS_PROFILE", "dev")]));
        assert_eq!(creds.get("AWS_PROFILE", None).as_deref(), Some("dev"));
    }

    #[test]
    fn test_require_reports_key() {
        let err = Credentials::default().require("GH_TOKEN").unwrap_err();
        assert!(err.to_string().contains("GH_TOKEN"));
    }

    #[test]
    fn test_aws_env_forwards_only_known_keys() {
        let creds = Credentials::default().with_store(store(&[
            ("AWS_ACCESS_KEY_ID", "AKIA"),
            ("HOME", "/root"),
        ]));
        let env = creds.aws_env("eu-west-1");
        assert!(env.contains(&("AWS_ACCESS_KEY_ID".to_string(), "AKIA".to_string())));
        assert!(env.contains(&("AWS_REGION".to_string(), "eu-west-1".to_string())));
        assert!(!env.iter().any(|(k, _)| k == "HOME"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let key = KeyMaterial::new(b"secret-key".to_vec(), Some("pw".into()));
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("secret-key"));
        assert!(!rendered.contains("pw\""));
    }

    #[cfg(unix)]
    #[test]
    fn test_materialize_writes_private_file() {
        use std::os::unix::fs::PermissionsExt;

        let key = KeyMaterial::new(b"-----BEGIN KEY-----".to_vec(), Some("pw".into()));
        let materialized = key.materialize().unwrap();
        let meta = std::fs::metadata(materialized.key_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        let content = std::fs::read_to_string(materialized.key_path()).unwrap();
        assert_eq!(content, "-----BEGIN KEY-----\n");
        assert!(
            materialized
                .askpass_env()
                .iter()
                .any(|(k, _)| k == "SSH_ASKPASS")
        );

        let path = materialized.key_path().to_path_buf();
        drop(materialized);
        assert!(!path.exists());
    }
}
