//! Crypto state persistence for surviving restarts.
//!
//! # Storage structure
//!
//! ```text
//! {state_dir}/
//!     crypto_store.json     # Olm account, Olm sessions, Megolm outbound sessions
//! ```
//!
//! The file holds private key material and is written with owner-only
//! permissions on unix.

use std::collections::HashMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::megolm::OutboundSessionState;
use super::olm::AccountState;

/// Store format version.
const STORE_VERSION: u8 = 1;

const STORE_FILE: &str = "crypto_store.json";

/// Everything persisted by the crypto engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CryptoState {
    /// Format version.
    pub version: u8,
    /// Olm account and sessions.
    pub account: AccountState,
    /// Megolm outbound sessions keyed by room id.
    #[serde(default)]
    pub megolm_sessions: HashMap<String, OutboundSessionState>,
}

/// JSON file store under the state directory.
#[derive(Debug, Clone)]
pub struct CryptoStore {
    path: PathBuf,
}

impl CryptoStore {
    /// Store inside `state_dir`, creating the directory if necessary.
    pub fn open(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir).with_context(|| {
            format!("Failed to create state directory {}", state_dir.display())
        })?;
        Ok(Self {
            path: state_dir.join(STORE_FILE),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted state; `None` when nothing was stored yet.
    pub fn load(&self) -> Result<Option<CryptoState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let state: CryptoState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        if state.version != STORE_VERSION {
            anyhow::bail!(
                "Unsupported crypto store version {} (expected {})",
                state.version,
                STORE_VERSION
            );
        }
        Ok(Some(state))
    }

    /// Persist state atomically (write to a temp file, then rename).
    pub fn save(&self, state: &CryptoState) -> Result<()> {
        let mut state = state.clone();
        state.version = STORE_VERSION;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&state)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;

        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
