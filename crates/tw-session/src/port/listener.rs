//! Local TCP and Unix-domain listeners

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

use tw_core::{LocalConnectionType, LocalEndpoint, PortParameters, SessionError, TunnelError};

/// A local connection of either kind
pub trait LocalStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LocalStream for T {}

/// Boxed local connection
pub type LocalConnection = Box<dyn LocalStream>;

/// Listener bound for a port session
#[derive(Debug)]
pub enum LocalListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl LocalListener {
    /// Bind the listener described by `params`
    ///
    /// TCP listeners bind to loopback; port 0 lets the OS choose. A stale
    /// socket file left at a Unix socket path is removed first.
    pub async fn bind(params: &PortParameters) -> Result<Self, TunnelError> {
        match params.local_connection_type {
            LocalConnectionType::Tcp => {
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, params.local_port_number));
                let listener = TcpListener::bind(addr).await?;
                tracing::debug!("Listening on {}", listener.local_addr()?);
                Ok(LocalListener::Tcp(listener))
            }
            LocalConnectionType::Unix => {
                let path = params.local_unix_socket.clone().ok_or_else(|| {
                    SessionError::InvalidParameters("unix listener requires a socket path".into())
                })?;
                Self::bind_unix(path)
            }
        }
    }

    #[cfg(unix)]
    fn bind_unix(path: PathBuf) -> Result<Self, TunnelError> {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        tracing::debug!("Listening on {}", path.display());
        Ok(LocalListener::Unix { listener, path })
    }

    #[cfg(not(unix))]
    fn bind_unix(_path: PathBuf) -> Result<Self, TunnelError> {
        Err(SessionError::InvalidParameters(
            "unix sockets are not supported on this platform".into(),
        )
        .into())
    }

    /// Where connections are accepted
    pub fn local_endpoint(&self) -> io::Result<LocalEndpoint> {
        match self {
            LocalListener::Tcp(listener) => listener.local_addr().map(LocalEndpoint::Tcp),
            #[cfg(unix)]
            LocalListener::Unix { path, .. } => Ok(LocalEndpoint::Unix(path.clone())),
        }
    }

    /// Accept the next local connection
    pub async fn accept(&self) -> io::Result<(LocalConnection, String)> {
        match self {
            LocalListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            LocalListener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let LocalListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
