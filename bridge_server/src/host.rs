//! Listener hosting: one accept loop per local or network address, all feeding one [`Service`].
//!
//! Opened listeners:
//! - the local channel, a Unix domain socket named after the port (Unix targets only);
//! - `127.0.0.1:<port>`;
//! - `<ip>:<port>` for every IPv4 address the host name resolves to.
//!
//! Every bind is best effort. Accept loops poll a non-blocking listener so they can observe the
//! stop flag without a wake-up connection.
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use mtbridge_common::net::{Stream, addr, local_channel_path};
use mtbridge_common::{BridgeError, Result};

use crate::config::ServerConfig;
use crate::connection::{ConnectionSet, spawn_connection};
use crate::service::Service;

const ACCEPT_POLL: Duration = Duration::from_millis(25);

enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Acceptor {
    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Acceptor::Tcp(l) => l.set_nonblocking(true),
            #[cfg(unix)]
            Acceptor::Unix(l) => l.set_nonblocking(true),
        }
    }

    fn accept(&self) -> io::Result<Stream> {
        match self {
            Acceptor::Tcp(l) => {
                let (stream, _) = l.accept()?;
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            #[cfg(unix)]
            Acceptor::Unix(l) => {
                let (stream, _) = l.accept()?;
                stream.set_nonblocking(false)?;
                Ok(Stream::Unix(stream))
            }
        }
    }
}

struct Listener {
    label: String,
    tcp_addr: Option<SocketAddr>,
    socket_path: Option<PathBuf>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Open listeners of one server and the connections they accepted.
pub struct Host {
    listeners: Vec<Listener>,
    connections: Arc<ConnectionSet>,
    close_timeout: Duration,
}

impl Host {
    /// Opens every configured listener. Fails only when none could be opened.
    pub fn open(config: &ServerConfig, service: Arc<Service>) -> Result<Host> {
        let connections = Arc::new(ConnectionSet::new());
        let mut listeners = Vec::new();

        if config.local_channel {
            match bind_local(&config.runtime_dir, config.port) {
                Ok(Some((acceptor, path))) => listeners.push(start_listener(
                    acceptor,
                    format!("local://{}", path.display()),
                    None,
                    Some(path),
                    config,
                    &service,
                    &connections,
                )?),
                Ok(None) => warn!("Local channel is not available on this platform"),
                Err(e) => warn!("Local channel for port {} not opened: {}", config.port, e),
            }
        }

        let mut ips: Vec<IpAddr> = Vec::new();
        if config.loopback {
            ips.push(IpAddr::from([127, 0, 0, 1]));
        }
        if config.network_interfaces {
            for ip in interface_addresses(config.port) {
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }
        for ip in ips {
            let bind_to = addr(&ip.to_string(), config.port);
            match TcpListener::bind(&bind_to) {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    listeners.push(start_listener(
                        Acceptor::Tcp(listener),
                        format!("tcp://{}", local),
                        Some(local),
                        None,
                        config,
                        &service,
                        &connections,
                    )?);
                }
                Err(e) => warn!("Listener on {} not opened: {}", bind_to, e),
            }
        }

        if listeners.is_empty() {
            return Err(BridgeError::Connection(format!(
                "no listener could be opened for port {}",
                config.port
            )));
        }
        Ok(Host {
            listeners,
            connections,
            close_timeout: config.close_timeout,
        })
    }

    /// Human-readable addresses of the open listeners.
    pub fn addresses(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.label.clone()).collect()
    }

    /// Bound TCP addresses.
    pub fn tcp_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(|l| l.tcp_addr).collect()
    }

    /// Path of the local channel, when open.
    pub fn local_path(&self) -> Option<&Path> {
        self.listeners.iter().find_map(|l| l.socket_path.as_deref())
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> Result<usize> {
        self.connections.len()
    }

    /// Stops accepting and lets every connection flush before closing it.
    pub fn close(&mut self) -> Result<()> {
        self.stop_listeners();
        self.connections.close_all(self.close_timeout)
    }

    /// Stops accepting and drops every connection at once.
    pub fn abort(&mut self) {
        self.stop_listeners();
        if let Err(e) = self.connections.abort_all() {
            error!("Abort failed: {}", e);
        }
    }

    fn stop_listeners(&mut self) {
        for listener in &mut self.listeners {
            listener.stop.store(true, Ordering::Release);
        }
        for listener in &mut self.listeners {
            if let Some(thread) = listener.thread.take() {
                if thread.join().is_err() {
                    error!("Accept loop of {} panicked", listener.label);
                }
                info!("Listener {} closed", listener.label);
            }
            if let Some(path) = &listener.socket_path {
                if let Err(e) = std::fs::remove_file(path) {
                    debug!("Removing {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.stop_listeners();
    }
}

#[cfg(unix)]
fn bind_local(dir: &Path, port: u16) -> io::Result<Option<(Acceptor, PathBuf)>> {
    let path = local_channel_path(dir, port);
    // A socket file left by a previous run blocks the bind.
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    let listener = UnixListener::bind(&path)?;
    Ok(Some((Acceptor::Unix(listener), path)))
}

#[cfg(not(unix))]
fn bind_local(_dir: &Path, _port: u16) -> io::Result<Option<(Acceptor, PathBuf)>> {
    Ok(None)
}

fn start_listener(
    acceptor: Acceptor,
    label: String,
    tcp_addr: Option<SocketAddr>,
    socket_path: Option<PathBuf>,
    config: &ServerConfig,
    service: &Arc<Service>,
    connections: &Arc<ConnectionSet>,
) -> Result<Listener> {
    acceptor.set_nonblocking()?;
    let stop = Arc::new(AtomicBool::new(false));
    let thread = {
        let stop = Arc::clone(&stop);
        let service = Arc::clone(service);
        let connections = Arc::clone(connections);
        let io_timeout = config.io_timeout;
        let label = label.clone();
        thread::Builder::new()
            .name(format!("accept-{label}"))
            .spawn(move || accept_loop(acceptor, &label, &stop, service, connections, io_timeout))?
    };
    info!("Listening on {}", label);
    Ok(Listener {
        label,
        tcp_addr,
        socket_path,
        stop,
        thread: Some(thread),
    })
}

fn accept_loop(
    acceptor: Acceptor,
    label: &str,
    stop: &AtomicBool,
    service: Arc<Service>,
    connections: Arc<ConnectionSet>,
    io_timeout: Duration,
) {
    while !stop.load(Ordering::Acquire) {
        match acceptor.accept() {
            Ok(stream) => {
                if let Err(e) = spawn_connection(
                    stream,
                    Arc::clone(&service),
                    Arc::clone(&connections),
                    io_timeout,
                ) {
                    error!("{}: connection setup failed: {}", label, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                error!("{}: accept failed: {}", label, e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Non-loopback IPv4 addresses the host name resolves to.
fn interface_addresses(port: u16) -> Vec<IpAddr> {
    let Some(name) = hostname::get().ok().and_then(|h| h.into_string().ok()) else {
        warn!("Host name unavailable; only loopback and local listeners are opened");
        return Vec::new();
    };
    match (name.as_str(), port).to_socket_addrs() {
        Ok(resolved) => {
            let mut ips: Vec<IpAddr> = Vec::new();
            for ip in resolved.map(|a| a.ip()) {
                if ip.is_ipv4() && !ip.is_loopback() && !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
            ips
        }
        Err(e) => {
            warn!("Cannot resolve host name {}: {}", name, e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::FanoutHub;
    use crate::model::executor::NoopWaker;
    use crate::model::registry::SessionRegistry;
    use std::net::TcpStream;

    fn service() -> Arc<Service> {
        Arc::new(Service::new(
            Arc::new(SessionRegistry::new(Arc::new(NoopWaker))),
            Arc::new(FanoutHub::new()),
            Duration::from_secs(1),
        ))
    }

    fn loopback_only() -> ServerConfig {
        ServerConfig {
            port: 0,
            local_channel: false,
            network_interfaces: false,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn opens_loopback_and_accepts() {
        let mut host = Host::open(&loopback_only(), service()).unwrap();
        let addrs = host.tcp_addrs();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].ip().is_loopback());

        let _client = TcpStream::connect(addrs[0]).unwrap();
        for _ in 0..100 {
            if host.connection_count().unwrap() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(host.connection_count().unwrap(), 1);
        host.close().unwrap();
    }

    #[test]
    fn nothing_to_open_is_an_error() {
        let config = ServerConfig {
            loopback: false,
            ..loopback_only()
        };
        assert!(Host::open(&config, service()).err().unwrap().is_connection());
    }

    #[test]
    fn failed_bind_is_skipped() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = ServerConfig {
            port,
            ..loopback_only()
        };
        // The only candidate is taken, so nothing opens.
        assert!(Host::open(&config, service()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn local_channel_is_named_after_the_port() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            port: 9123,
            runtime_dir: dir.path().to_path_buf(),
            local_channel: true,
            loopback: false,
            network_interfaces: false,
            ..ServerConfig::default()
        };
        let mut host = Host::open(&config, service()).unwrap();
        let path = host.local_path().unwrap().to_path_buf();
        assert_eq!(path, dir.path().join("mtbridge_9123.sock"));
        assert!(path.exists());
        host.close().unwrap();
        assert!(!path.exists());
    }
}
