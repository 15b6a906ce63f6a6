//! Control socket binding.

use std::future::Future;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use orca_deck_core::traits::{SocketError, SocketProvider};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// Default control socket path.
///
/// `$XDG_RUNTIME_DIR/orca-deck/socket`, or `/tmp/orca-deck-$UID/socket`
/// when no runtime directory is set.
pub fn default_socket_path() -> PathBuf {
    match dirs::runtime_dir() {
        Some(runtime_dir) => runtime_dir.join("orca-deck").join("socket"),
        None => {
            // SAFETY: getuid has no preconditions and cannot fail.
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/orca-deck-{}", uid)).join("socket")
        }
    }
}

/// Binds a Unix socket at a fixed path, owner-only.
pub struct UnixSocketProvider {
    path: PathBuf,
}

impl UnixSocketProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn bind(&self) -> Result<UnixListener, SocketError> {
        if self.path.as_os_str().is_empty() {
            return Err(SocketError::InvalidPath("empty socket path".to_string()));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SocketError::DirectoryCreationFailed)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                    .map_err(SocketError::DirectoryCreationFailed)?;
                debug!(path = %parent.display(), "Created socket directory");
            }
        }

        self.remove_stale().await?;

        let listener = UnixListener::bind(&self.path).map_err(SocketError::BindFailed)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            .map_err(SocketError::BindFailed)?;

        debug!(path = %self.path.display(), "Control socket bound");
        Ok(listener)
    }

    /// Remove a leftover socket file, unless a daemon still answers on it.
    async fn remove_stale(&self) -> Result<(), SocketError> {
        match std::fs::symlink_metadata(&self.path) {
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SocketError::BindFailed(e)),
            Ok(_) => {}
        }

        if UnixStream::connect(&self.path).await.is_ok() {
            return Err(SocketError::InUse(self.path.clone()));
        }

        warn!(path = %self.path.display(), "Removing stale control socket");
        std::fs::remove_file(&self.path).map_err(SocketError::BindFailed)
    }
}

impl Default for UnixSocketProvider {
    fn default() -> Self {
        Self::new(default_socket_path())
    }
}

impl SocketProvider for UnixSocketProvider {
    fn listen(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<UnixListener, SocketError>> + Send + '_>> {
        Box::pin(self.bind())
    }

    fn socket_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_owner_only_socket_in_new_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let socket_path = temp_dir.path().join("orca-deck").join("socket");

        let provider = UnixSocketProvider::new(&socket_path);
        let _listener = provider.listen().await.unwrap();

        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(socket_path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn replaces_stale_socket() {
        let temp_dir = tempfile::tempdir().unwrap();
        let socket_path = temp_dir.path().join("socket");

        let provider = UnixSocketProvider::new(&socket_path);
        drop(provider.listen().await.unwrap());
        assert!(socket_path.exists());

        let _listener = provider.listen().await.unwrap();
    }

    #[tokio::test]
    async fn refuses_live_socket() {
        let temp_dir = tempfile::tempdir().unwrap();
        let socket_path = temp_dir.path().join("socket");

        let provider = UnixSocketProvider::new(&socket_path);
        let _first = provider.listen().await.unwrap();

        let second = UnixSocketProvider::new(&socket_path);
        assert!(matches!(
            second.listen().await,
            Err(SocketError::InUse(path)) if path == socket_path
        ));
    }

    #[tokio::test]
    async fn empty_path_is_invalid() {
        let provider = UnixSocketProvider::new("");
        assert!(matches!(
            provider.listen().await,
            Err(SocketError::InvalidPath(_))
        ));
    }

    #[test]
    fn default_path_ends_in_orca_deck_socket() {
        let provider = UnixSocketProvider::default();
        let path = provider.socket_path().unwrap();
        assert!(path.ends_with("socket"));
        assert!(path
            .parent()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("orca-deck"));
    }
}
