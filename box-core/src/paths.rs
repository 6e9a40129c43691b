//! Filesystem layout under `~/.box/`.
//!
//! Every directory is created with mode 0o700 on POSIX; key files and the
//! admin socket are 0o600. Callers pass an explicit home so tests can point
//! the whole tree at a tempdir.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Resolved `~/.box/` tree.
#[derive(Debug, Clone)]
pub struct BoxPaths {
    root: PathBuf,
}

impl BoxPaths {
    /// Layout rooted at `<home>/.box`.
    pub fn new(home: impl AsRef<Path>) -> Self {
        Self {
            root: home.as_ref().join(".box"),
        }
    }

    /// Layout rooted at the `HOME` environment variable.
    pub fn from_env() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .ok_or_else(|| Error::config("HOME is not set and no --home was given"))?;
        Ok(Self::new(home))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("Box.toml")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    pub fn node_identity_file(&self) -> PathBuf {
        self.keys_dir().join("node.identity.json")
    }

    pub fn client_identity_file(&self) -> PathBuf {
        self.keys_dir().join("client.identity.json")
    }

    pub fn queues_dir(&self) -> PathBuf {
        self.root.join("queues")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn admin_socket(&self) -> PathBuf {
        self.run_dir().join("boxd.socket")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create the tree (root, keys, queues, run, logs) with private modes.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.keys_dir(),
            self.queues_dir(),
            self.run_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
            restrict_dir(&dir)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_dir(dir: &Path) -> Result<()> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_contract() {
        let paths = BoxPaths::new("/home/alice");
        assert_eq!(paths.root(), Path::new("/home/alice/.box"));
        assert_eq!(
            paths.node_identity_file(),
            Path::new("/home/alice/.box/keys/node.identity.json")
        );
        assert_eq!(
            paths.admin_socket(),
            Path::new("/home/alice/.box/run/boxd.socket")
        );
    }

    #[cfg(unix)]
    #[test]
    fn ensure_creates_private_dirs() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let paths = BoxPaths::new(tmp.path());
        paths.ensure().unwrap();
        let mode = std::fs::metadata(paths.queues_dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
