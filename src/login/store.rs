//! Auth context persistence
//!
//! The result of a login is kept in a single JSON file so later commands
//! (starting the proxy, `logout`) can reuse it.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// File name of the persisted context inside the store directory
const AUTH_FILE: &str = "auth.json";

/// The caller's active project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Project id
    pub id: String,
    /// URL slug
    #[serde(default)]
    pub slug: Option<String>,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
}

/// Tokens and selected project produced by a login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    /// Access token
    pub access_token: String,
    /// Refresh token, present when `offline_access` was granted
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry as a unix timestamp
    #[serde(default)]
    pub expires_at: Option<u64>,
    /// Selected project
    #[serde(default)]
    pub project: Option<Project>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl AuthContext {
    /// Expiry timestamp `expires_in` seconds from now
    #[must_use]
    pub fn expiry_from(expires_in: Option<u64>) -> Option<u64> {
        expires_in.map(|secs| now_secs() + secs)
    }

    /// Check if the access token is expired (with 60 second buffer)
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| now_secs() + 60 >= at)
    }

    /// Time until the access token expires
    #[must_use]
    pub fn time_until_expiry(&self) -> Option<Duration> {
        let now = now_secs();
        self.expires_at
            .filter(|at| *at > now)
            .map(|at| Duration::from_secs(at - now))
    }
}

/// File-backed store for the [`AuthContext`]
#[derive(Debug, Clone)]
pub struct AuthStore {
    path: PathBuf,
}

impl AuthStore {
    /// Store living in `dir`, created on first save
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(AUTH_FILE),
        }
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored context, if any
    ///
    /// An unreadable or corrupt file is treated as "not logged in".
    #[must_use]
    pub fn load(&self) -> Option<AuthContext> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No stored auth context");
            return None;
        }

        match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<AuthContext>(&content) {
                Ok(context) => {
                    debug!(expires_in = ?context.time_until_expiry(), "Loaded auth context");
                    Some(context)
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Failed to parse stored auth context");
                    None
                }
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read auth context");
                None
            }
        }
    }

    /// Persist `context`, readable by the owner only
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, context: &AuthContext) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = serde_json::to_string_pretty(context)?;
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;

        // The mode only applies on creation; tighten an older file too
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(content.as_bytes())?;

        info!(path = %self.path.display(), "Saved auth context");
        Ok(())
    }

    /// Remove the stored context
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .map_err(|e| Error::Internal(format!("Failed to delete auth context: {e}")))?;
            info!(path = %self.path.display(), "Deleted auth context");
        }
        Ok(())
    }
}
