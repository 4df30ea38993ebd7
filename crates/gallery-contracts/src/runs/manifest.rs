use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

use super::records::now_utc_iso;

/// Reproducibility record written next to every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub timestamp: String,
    pub argv: Vec<String>,
    pub version: String,
    pub git_sha: String,
    pub git_dirty: bool,
}

impl RunManifest {
    /// `repo_dir` is where git is asked about the checkout; failures are recorded, not raised.
    pub fn capture(argv: Vec<String>, repo_dir: &Path) -> Self {
        Self {
            timestamp: now_utc_iso(),
            argv,
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_sha: git_sha(repo_dir),
            git_dirty: git_dirty(repo_dir),
        }
    }
}

fn git_sha(repo_dir: &Path) -> String {
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|sha| !sha.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn git_dirty(repo_dir: &Path) -> bool {
    Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(repo_dir)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| !output.stdout.trim_ascii().is_empty())
        .unwrap_or(false)
}
