//! Socket front-end: binds the session's listeners and feeds accepted
//! transports into the session actor. The CLI wrapping these entry
//! points lives outside the core.

use std::path::PathBuf;

use log::{info, warn};
use proto::Transport;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

use crate::error::{Error, Result};
use crate::session::SessionHandle;

pub use proto::DEFAULT_PORT;

/// Per-session runtime directory: `$XDG_RUNTIME_DIR/xpra/<display>/`.
pub fn session_dir(display: &str) -> Result<PathBuf> {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let dir = base.join("xpra").join(display.trim_start_matches(':'));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[derive(Debug, Clone)]
pub struct BindOptions {
    /// TCP bind address, e.g. `0.0.0.0:14500`; `None` disables TCP.
    pub tcp: Option<String>,
    /// Unix socket below the session directory; `None` disables it.
    pub unix_display: Option<String>,
}

impl Default for BindOptions {
    fn default() -> Self {
        BindOptions {
            tcp: Some(format!("127.0.0.1:{DEFAULT_PORT}")),
            unix_display: None,
        }
    }
}

/// Accept loops feeding one session. Dropping the server stops accepting
/// new connections; established clients stay with the session.
pub struct Server {
    tasks: Vec<tokio::task::JoinHandle<()>>,
    local_addr: Option<std::net::SocketAddr>,
}

impl Server {
    pub async fn bind(options: BindOptions, session: SessionHandle) -> Result<Server> {
        let mut tasks = Vec::new();
        let mut local_addr = None;

        if let Some(addr) = &options.tcp {
            let listener = TcpListener::bind(addr).await?;
            local_addr = Some(listener.local_addr()?);
            info!("listening on tcp:{}", listener.local_addr()?);
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            if session.attach_transport(Transport::tcp(stream)).await.is_err() {
                                return;
                            }
                            log::debug!("accepted tcp connection from {peer}");
                        }
                        Err(e) => {
                            warn!("tcp accept failed: {e}");
                            return;
                        }
                    }
                }
            }));
        }

        #[cfg(unix)]
        if let Some(display) = &options.unix_display {
            let dir = session_dir(display)?;
            let path = dir.join("socket");
            // A previous unclean shutdown leaves the node behind.
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)?;
            restrict_socket_mode(&path)?;
            info!("listening on {}", path.display());
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            if session.attach_transport(Transport::unix(stream)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("unix accept failed: {e}");
                            return;
                        }
                    }
                }
            }));
        }

        if tasks.is_empty() {
            return Err(Error::ErrSessionState("no listeners configured".into()));
        }
        Ok(Server { tasks, local_addr })
    }

    /// Bound TCP address, when TCP is enabled.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(unix)]
fn restrict_socket_mode(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(0o600);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}
