#![forbid(unsafe_code)]

//! Startup guards for the grabtube backend.

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;
use std::fs;
use std::path::Path;

/// Fails fast when a binary is started as root. The backend writes
/// client-named files into a shared directory, so it should only ever run
/// as an unprivileged service account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Creates the shared output root and proves it is writable before any job
/// is accepted. Failing here at startup beats failing inside the first
/// download task, where the error only surfaces over the progress stream.
pub fn ensure_writable_root(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let probe = dir.join(".write-probe");
    fs::write(&probe, b"ok").with_context(|| format!("{} is not writable", dir.display()))?;
    fs::remove_file(&probe).with_context(|| format!("cleaning up probe in {}", dir.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;
    use tempfile::tempdir;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn writable_root_is_created_and_left_clean() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("downloads");
        ensure_writable_root(&root).unwrap();
        assert!(root.is_dir());
        assert!(!root.join(".write-probe").exists());
    }

    #[test]
    fn writable_root_rejects_a_path_blocked_by_a_file() {
        let dir = tempdir().unwrap();
        let blocked = dir.path().join("downloads");
        std::fs::write(&blocked, "in the way").unwrap();
        assert!(ensure_writable_root(&blocked).is_err());
    }
}
