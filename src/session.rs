//! Per-daemon scratch directory
//!
//! `$TMPDIR/redgreen.<pid>/` holds the bound result server address and the
//! minitest reporter plugin. The directory goes on the child's `-I` path so
//! minitest's plugin loader finds `minitest/redgreen_plugin.rb`.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Child-side reporter: registers `--server PID` and posts results to `AUTOTEST_SERVER`
pub const MINITEST_PLUGIN: &str = include_str!("../support/minitest/redgreen_plugin.rb");

const PLUGIN_PATH: &str = "minitest/redgreen_plugin.rb";
const ADDRESS_FILE: &str = "server.addr";

/// Where session `session`'s scratch directory lives under `base`
pub fn session_dir(base: &Path, session: u32) -> PathBuf {
    base.join(format!("redgreen.{}", session))
}

/// Where session `session` publishes its result server address
pub fn address_file(base: &Path, session: u32) -> PathBuf {
    session_dir(base, session).join(ADDRESS_FILE)
}

/// The scratch directory of a running daemon. Removed on drop.
#[derive(Debug)]
pub struct SessionDir {
    path: PathBuf,
}

impl SessionDir {
    /// Create the directory under the system temp dir and install the reporter plugin
    pub fn create(session: u32) -> Result<Self> {
        Self::create_in(&std::env::temp_dir(), session)
    }

    pub fn create_in(base: &Path, session: u32) -> Result<Self> {
        let path = session_dir(base, session);
        let plugin = path.join(PLUGIN_PATH);

        if let Some(parent) = plugin.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create session directory {}", parent.display()))?;
        }
        fs::write(&plugin, MINITEST_PLUGIN)
            .with_context(|| format!("Failed to install reporter plugin at {}", plugin.display()))?;

        tracing::debug!(path = %path.display(), "session directory ready");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory to add to the interpreter's load path
    pub fn lib_dir(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn address_file(&self) -> PathBuf {
        self.path.join(ADDRESS_FILE)
    }
}

impl Drop for SessionDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            tracing::debug!(path = %self.path.display(), "could not remove session directory: {}", e);
        }
    }
}
