//! Shared networking constants and helpers used by server and client.
//!
//! Two transports carry the same newline-delimited JSON frames: TCP for network clients and a
//! Unix domain socket ("local channel") for clients on the same machine. [`Stream`] hides the
//! difference so the connection code on both sides is written once.
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 8222;

/// Helper to format an address with a port like "ip:port".
pub fn addr(ip: &str, port: u16) -> String {
    format!("{}:{}", ip, port)
}

/// Process-scoped name of the local channel for `port`.
pub fn local_channel_name(port: u16) -> String {
    format!("mtbridge_{}.sock", port)
}

/// Full path of the local channel for `port` inside `dir`.
pub fn local_channel_path(dir: &Path, port: u16) -> PathBuf {
    dir.join(local_channel_name(port))
}

/// Where a client connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Network channel.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// Port.
        port: u16,
    },
    /// Same-machine channel.
    Local {
        /// Socket path.
        path: PathBuf,
    },
}

impl Endpoint {
    /// Network endpoint.
    pub fn tcp(host: &str, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.to_string(),
            port,
        }
    }

    /// Local channel of `port` in the default runtime directory.
    pub fn local(port: u16) -> Self {
        Endpoint::Local {
            path: local_channel_path(&std::env::temp_dir(), port),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}", addr(host, *port)),
            Endpoint::Local { path } => write!(f, "local://{}", path.display()),
        }
    }
}

/// Connected duplex byte stream over either transport.
#[derive(Debug)]
pub enum Stream {
    /// TCP connection.
    Tcp(TcpStream),
    /// Unix domain socket connection.
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    /// Opens a connection to `endpoint`, bounded by `connect_timeout` for TCP.
    pub fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> io::Result<Stream> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let mut last_err = None;
                for socket_addr in (host.as_str(), *port).to_socket_addrs()? {
                    match TcpStream::connect_timeout(&socket_addr, connect_timeout) {
                        Ok(stream) => {
                            stream.set_nodelay(true)?;
                            return Ok(Stream::Tcp(stream));
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
                }))
            }
            #[cfg(unix)]
            Endpoint::Local { path } => Ok(Stream::Unix(UnixStream::connect(path)?)),
            #[cfg(not(unix))]
            Endpoint::Local { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "local channel is not available on this platform",
            )),
        }
    }

    /// Second handle to the same connection, used to split reading and writing.
    pub fn try_clone(&self) -> io::Result<Stream> {
        match self {
            Stream::Tcp(s) => s.try_clone().map(Stream::Tcp),
            #[cfg(unix)]
            Stream::Unix(s) => s.try_clone().map(Stream::Unix),
        }
    }

    /// Shuts both directions down, waking any thread blocked on the stream.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }

    /// Read and write timeouts; `None` blocks forever.
    pub fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            #[cfg(unix)]
            Stream::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    /// Peer description for logs.
    pub fn peer_label(&self) -> String {
        match self {
            Stream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            #[cfg(unix)]
            Stream::Unix(_) => "local".to_string(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}
