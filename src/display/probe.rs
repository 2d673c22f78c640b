//! # Display server probing and watching.
//!
//! The registry never talks to a display server directly; it goes through the
//! [`DisplayBackend`] seam. The default backend works at the socket level: a
//! probe is a short-lived connect-then-disconnect against the server's Unix
//! socket, and a watcher is this same executable re-invoked with an internal
//! subcommand that connects and blocks until the server goes away.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

use crate::protocol::types::{DisplayKind, DisplaySelection};

/// Capability probe and watcher factory for display servers.
#[async_trait]
pub trait DisplayBackend: Send + Sync {
    /// Whether this daemon can monitor the given display kind at all.
    fn supports(&self, kind: DisplayKind) -> bool;

    /// Validates the selection by briefly connecting to the display server.
    async fn probe(&self, selection: &DisplaySelection) -> std::io::Result<()>;

    /// Spawns the watcher child whose exit signals that the display is gone.
    fn spawn_watcher(&self, selection: &DisplaySelection) -> std::io::Result<Child>;
}

/// Socket-level backend used by the daemon.
pub struct SocketDisplayBackend;

#[async_trait]
impl DisplayBackend for SocketDisplayBackend {
    fn supports(&self, kind: DisplayKind) -> bool {
        matches!(kind, DisplayKind::Xorg | DisplayKind::Wayland)
    }

    async fn probe(&self, selection: &DisplaySelection) -> std::io::Result<()> {
        let path = display_socket_path(selection)?;
        UnixStream::connect(&path).await.map(|_| ())
    }

    fn spawn_watcher(&self, selection: &DisplaySelection) -> std::io::Result<Child> {
        let subcommand = match selection.kind {
            DisplayKind::Xorg => "watchxorg",
            DisplayKind::Wayland => "watchwayland",
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "display kind has no watcher",
                ))
            }
        };

        let exe = std::env::current_exe()?;
        Command::new(exe)
            .args(["internal", subcommand, &selection.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Detach from our process group so terminal signals to the
            // daemon do not cascade to the watcher.
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
    }
}

/// Resolves the Unix socket a display server listens on.
///
/// Xorg display `:N[.S]` maps to `/tmp/.X11-unix/XN`; wayland names resolve
/// under `$XDG_RUNTIME_DIR` unless absolute.
pub fn display_socket_path(selection: &DisplaySelection) -> std::io::Result<PathBuf> {
    let invalid = |msg: String| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg);

    match selection.kind {
        DisplayKind::Xorg => {
            let name = &selection.name;
            let rest = name
                .strip_prefix(':')
                .ok_or_else(|| invalid(format!("unsupported xorg display name {name:?}")))?;
            let number = rest.split('.').next().unwrap_or(rest);
            if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid(format!("unsupported xorg display name {name:?}")));
            }
            Ok(PathBuf::from(format!("/tmp/.X11-unix/X{number}")))
        }
        DisplayKind::Wayland => {
            let name = &selection.name;
            if name.is_empty() {
                return Err(invalid("empty wayland display name".to_string()));
            }
            if name.starts_with('/') {
                return Ok(PathBuf::from(name));
            }
            let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
                .map_err(|_| invalid("XDG_RUNTIME_DIR is not set".to_string()))?;
            Ok(PathBuf::from(runtime_dir).join(name))
        }
        DisplayKind::Headless | DisplayKind::Unspecified => {
            Err(invalid("display selection has no socket".to_string()))
        }
    }
}

/// Connects to the display server's socket and blocks until it goes away.
/// Body of the `internal watchxorg` / `internal watchwayland` subcommands.
pub async fn watch_display(selection: &DisplaySelection) -> std::io::Result<()> {
    let path = display_socket_path(selection)?;
    let mut stream = UnixStream::connect(&path).await?;

    let mut buf = [0u8; 256];
    loop {
        // The server never sends us anything meaningful; EOF or a reset
        // means it is gone.
        match stream.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorg_socket_path_parses_display_numbers() {
        let path = display_socket_path(&DisplaySelection::xorg(":0")).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/.X11-unix/X0"));

        let path = display_socket_path(&DisplaySelection::xorg(":10.2")).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/.X11-unix/X10"));

        assert!(display_socket_path(&DisplaySelection::xorg("remote:0")).is_err());
        assert!(display_socket_path(&DisplaySelection::xorg(":abc")).is_err());
    }

    #[test]
    fn wayland_socket_path_uses_runtime_dir() {
        let abs = display_socket_path(&DisplaySelection::wayland("/run/user/1/wayland-9")).unwrap();
        assert_eq!(abs, PathBuf::from("/run/user/1/wayland-9"));

        assert!(display_socket_path(&DisplaySelection::wayland("")).is_err());
    }

    #[test]
    fn headless_has_no_socket() {
        assert!(display_socket_path(&DisplaySelection::headless()).is_err());
    }

    #[tokio::test]
    async fn probe_connects_to_a_listening_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("wayland-7");
        let _listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let backend = SocketDisplayBackend;
        let selection = DisplaySelection::wayland(socket.to_string_lossy());
        backend.probe(&selection).await.unwrap();

        let missing = DisplaySelection::wayland(dir.path().join("nope").to_string_lossy());
        assert!(backend.probe(&missing).await.is_err());
    }
}
