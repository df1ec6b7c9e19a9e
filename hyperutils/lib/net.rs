//! `hyperutils::net` contains the transport addresses used to reach a guest agent.
//!
//! A guest is reachable either over a local unix socket created by the hypervisor, or over a
//! virtual socket addressed by guest context id and port. Addresses are written as
//! `unix:<path>` (or a bare path) and `vsock:<cid>:<port>`.

use std::{
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::UnixStream,
    time::Instant,
};

use crate::{HyperutilsError, HyperutilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The address prefix for unix domain sockets.
pub const UNIX_SOCKET_PREFIX: &str = "unix:";

/// The address prefix for virtual sockets.
pub const VSOCK_SOCKET_PREFIX: &str = "vsock:";

/// How long to wait between connection attempts.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A byte stream connected to a guest.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

/// A boxed transport.
pub type BoxedTransport = Box<dyn Transport>;

/// The address of a guest-facing socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    /// A unix domain socket at the given path.
    Unix(PathBuf),

    /// A virtual socket.
    Vsock {
        /// The guest context id.
        cid: u32,

        /// The port the guest listens on.
        port: u32,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SocketAddress {
    /// Connects to the address once.
    pub async fn connect(&self) -> HyperutilsResult<BoxedTransport> {
        match self {
            SocketAddress::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
            SocketAddress::Vsock { cid, port } => connect_vsock(*cid, *port).await,
        }
    }

    /// Connects to the address, retrying until `timeout` elapses.
    ///
    /// The socket usually appears some time after the hypervisor process is started, so
    /// refused or missing sockets are retried rather than reported immediately.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> HyperutilsResult<BoxedTransport> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.connect().await {
                Ok(conn) => return Ok(conn),
                Err(HyperutilsError::UnsupportedTransport(e)) => {
                    return Err(HyperutilsError::UnsupportedTransport(e))
                }
                Err(e) => {
                    if Instant::now() + CONNECT_RETRY_INTERVAL > deadline {
                        tracing::debug!(address = %self, error = %e, "giving up connecting");
                        return Err(HyperutilsError::ConnectTimeout(self.to_string()));
                    }
                    tracing::trace!(address = %self, error = %e, "socket not ready, retrying");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

#[cfg(target_os = "linux")]
async fn connect_vsock(cid: u32, port: u32) -> HyperutilsResult<BoxedTransport> {
    let addr = tokio_vsock::VsockAddr::new(cid, port);
    let stream = tokio_vsock::VsockStream::connect(addr).await?;
    Ok(Box::new(stream))
}

#[cfg(not(target_os = "linux"))]
async fn connect_vsock(cid: u32, port: u32) -> HyperutilsResult<BoxedTransport> {
    Err(HyperutilsError::UnsupportedTransport(format!(
        "vsock:{cid}:{port} requires linux"
    )))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

impl Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Unix(path) => write!(f, "{UNIX_SOCKET_PREFIX}{}", path.display()),
            SocketAddress::Vsock { cid, port } => write!(f, "{VSOCK_SOCKET_PREFIX}{cid}:{port}"),
        }
    }
}

impl FromStr for SocketAddress {
    type Err = HyperutilsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(VSOCK_SOCKET_PREFIX) {
            let (cid, port) = rest
                .split_once(':')
                .ok_or_else(|| HyperutilsError::InvalidSocketAddress(s.to_string()))?;
            let cid = cid
                .parse()
                .map_err(|_| HyperutilsError::InvalidSocketAddress(s.to_string()))?;
            let port = port
                .parse()
                .map_err(|_| HyperutilsError::InvalidSocketAddress(s.to_string()))?;
            return Ok(SocketAddress::Vsock { cid, port });
        }

        let path = s.strip_prefix(UNIX_SOCKET_PREFIX).unwrap_or(s);
        if path.is_empty() {
            return Err(HyperutilsError::InvalidSocketAddress(s.to_string()));
        }

        Ok(SocketAddress::Unix(PathBuf::from(path)))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::UnixListener,
    };

    use super::*;

    #[test]
    fn test_socket_address_parsing() -> anyhow::Result<()> {
        assert_eq!(
            "vsock:3:2718".parse::<SocketAddress>()?,
            SocketAddress::Vsock { cid: 3, port: 2718 }
        );
        assert_eq!(
            "unix:/var/run/hyper/vm-1/hyper.sock".parse::<SocketAddress>()?,
            SocketAddress::Unix(PathBuf::from("/var/run/hyper/vm-1/hyper.sock"))
        );
        assert_eq!(
            "/tmp/tty.sock".parse::<SocketAddress>()?,
            SocketAddress::Unix(PathBuf::from("/tmp/tty.sock"))
        );

        assert!("vsock:3".parse::<SocketAddress>().is_err());
        assert!("vsock:x:2718".parse::<SocketAddress>().is_err());
        assert!("unix:".parse::<SocketAddress>().is_err());

        let addr = SocketAddress::Vsock { cid: 7, port: 2719 };
        assert_eq!(addr.to_string().parse::<SocketAddress>()?, addr);

        Ok(())
    }

    #[tokio::test]
    async fn test_connect_retries_until_socket_appears() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hyper.sock");
        let addr = SocketAddress::Unix(path.clone());

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let listener = UnixListener::bind(&path)?;
            let (mut conn, _) = listener.accept().await?;
            conn.write_all(b"ready").await?;
            anyhow::Ok(())
        });

        let mut conn = addr.connect_with_timeout(Duration::from_secs(5)).await?;
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ready");
        server.await??;

        Ok(())
    }

    #[tokio::test]
    async fn test_connect_times_out() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let addr = SocketAddress::Unix(dir.path().join("missing.sock"));

        let result = addr.connect_with_timeout(Duration::from_millis(300)).await;
        assert!(matches!(result, Err(HyperutilsError::ConnectTimeout(_))));

        Ok(())
    }
}
