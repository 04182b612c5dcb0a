//! HTTP/WS server construction: socket tuning and TLS termination, shared by
//! the supervisor and every user process.

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::Path,
    time::Duration,
};

use axum_server::{tls_rustls::RustlsConfig, Handle};
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use thiserror::Error;
use tokio::{
    net::{lookup_host, TcpSocket, ToSocketAddrs},
    task::JoinHandle,
};
use tracing::{debug, debug_span, error, info, Instrument};

use crate::{
    errors::IoError,
    signal::{SignalError, SignalStream},
};

/// Error type returned by [`ServerBuilder`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerBuilderError {
    /// Unable to parse endpoint address.
    #[error("Unable to parse endpoint address: {0}")]
    AddressParse(IoError),
    /// Unable to resolve DNS name.
    #[error("Unable to resolve DNS name: {0}")]
    Resolve(String),
    /// Unable to create socket.
    #[error("Unable to create socket: {0}")]
    SocketCreate(IoError),
    /// Unable to bind socket to local address.
    #[error("Unable to bind socket to local address {0}: {1}")]
    BindAddr(SocketAddr, IoError),
    /// Unable to listen on socket.
    #[error("Unable to listen on socket {0}: {1}")]
    Listen(SocketAddr, IoError),
    /// Unable to perform conversion into std listener.
    #[error("Unable to perform conversion into std listener: {0}")]
    ConvertListener(IoError),
    /// Unable to set SO_REUSEADDR.
    #[error("Unable to set SO_REUSEADDR: {0}")]
    SetReuseAddr(IoError),
    /// Unable to set SO_RCVBUF.
    #[error("Unable to set SO_RCVBUF: {0}")]
    SetRecvBuffer(IoError),
    /// Unable to set SO_SNDBUF.
    #[error("Unable to set SO_SNDBUF: {0}")]
    SetSendBuffer(IoError),
    /// Unable to set SO_KEEPALIVE.
    #[error("Unable to set SO_KEEPALIVE: {0}")]
    SetKeepAlive(IoError),
    /// Unable to set TCP_NODELAY.
    #[error("Unable to set TCP_NODELAY: {0}")]
    SetNoDelay(IoError),
    /// Unable to load TLS certificate/key material.
    #[error("Unable to load TLS certificate/key material: {0}")]
    TlsLoad(#[source] std::io::Error),
    /// Signal handler error.
    #[error(transparent)]
    SignalHandler(#[from] SignalError),
}

/// Builder for the HTTP/WS server shared by the supervisor and each user
/// process. Socket tuning mirrors the ambient stack's approach of exposing
/// every relevant `setsockopt` as a config knob rather than hardcoding one
/// choice.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ServerBuilder {
    /// Host/address and port to listen on.
    #[serde(default = "ServerBuilder::default_listen")]
    pub listen: String,
    /// Size of the TCP receive buffer, in bytes.
    #[serde(default)]
    pub recv_buffer: Option<NonZeroUsize>,
    /// Size of the TCP send buffer, in bytes.
    #[serde(default)]
    pub send_buffer: Option<NonZeroUsize>,
    /// TCP-level socket configuration.
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            recv_buffer: None,
            send_buffer: None,
            tcp: TcpConfig::default(),
        }
    }
}

impl ServerBuilder {
    /// Default value for [`Self::listen`].
    #[must_use]
    #[inline]
    fn default_listen() -> String {
        "0.0.0.0:8080".into()
    }

    /// Create a new server builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the configured listen address, applying socket tuning.
    ///
    /// # Errors
    ///
    /// Returns `Err` if DNS resolution, socket creation, or any
    /// `setsockopt` call fails.
    async fn bind(&self) -> Result<std::net::TcpListener, ServerBuilderError> {
        let (sock, addr) = socket(&self.listen).await?;
        let sref = SockRef::from(&sock);
        if let Some(sz) = self.recv_buffer {
            sref.set_recv_buffer_size(sz.get())
                .map_err(|err| ServerBuilderError::SetRecvBuffer(err.into()))?;
        }
        if let Some(sz) = self.send_buffer {
            sref.set_send_buffer_size(sz.get())
                .map_err(|err| ServerBuilderError::SetSendBuffer(err.into()))?;
        }
        if let Some(idle) = self.tcp.keepalive.idle {
            let mut tcp_keepalive = socket2::TcpKeepalive::new().with_time(idle);
            if let Some(interval) = self.tcp.keepalive.interval {
                tcp_keepalive = tcp_keepalive.with_interval(interval);
            }
            if let Some(retries) = self.tcp.keepalive.retries {
                tcp_keepalive = tcp_keepalive.with_retries(retries.get());
            }
            sref.set_tcp_keepalive(&tcp_keepalive)
                .map_err(|err| ServerBuilderError::SetKeepAlive(err.into()))?;
        } else {
            sref.set_keepalive(false)
                .map_err(|err| ServerBuilderError::SetKeepAlive(err.into()))?;
        }
        sock.bind(addr)
            .map_err(|err| ServerBuilderError::BindAddr(addr, err.into()))?;
        sock.set_nodelay(self.tcp.nodelay)
            .map_err(|err| ServerBuilderError::SetNoDelay(err.into()))?;
        sock.listen(self.tcp.backlog.get())
            .map_err(|err| ServerBuilderError::Listen(addr, err.into()))?
            .into_std()
            .map_err(|err| ServerBuilderError::ConvertListener(err.into()))
    }

    /// Build a plain (non-TLS) server.
    ///
    /// # Errors
    ///
    /// See [`Self::bind`].
    pub async fn build_plain(&self) -> Result<axum_server::Server, ServerBuilderError> {
        let span = debug_span!("build_server", tls = false);
        async move {
            let listener = self.bind().await?;
            info!("finished building plain server");
            Ok(axum_server::from_tcp(listener))
        }
        .instrument(span)
        .await
    }

    /// Build a TLS-terminating server from a PEM certificate chain and key.
    ///
    /// # Errors
    ///
    /// See [`Self::bind`]; also returns `Err` if the crypto provider cannot
    /// be installed (only the first call in a process succeeds; subsequent
    /// calls are no-ops handled internally by `rustls`) or the cert/key
    /// files cannot be read.
    pub async fn build_tls(
        &self,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<axum_server::Server<axum_server::tls_rustls::RustlsAcceptor>, ServerBuilderError>
    {
        let span = debug_span!("build_server", tls = true);
        async move {
            let listener = self.bind().await?;
            let tls_config = load_tls_config(cert_file, key_file).await?;
            info!("finished building TLS server");
            Ok(axum_server::from_tcp_rustls(listener, tls_config))
        }
        .instrument(span)
        .await
    }

    /// Launch a task that captures common UNIX signals and gracefully shuts
    /// down the server on a termination signal.
    ///
    /// # Errors
    ///
    /// Returns `Err` if signal handlers cannot be registered with the OS.
    pub fn spawn_signal_handler(
        &self,
        handle: Handle,
        grace: Duration,
    ) -> Result<JoinHandle<()>, ServerBuilderError> {
        let span = debug_span!("signal_handler");
        let mut sig = SignalStream::new()?;
        Ok(tokio::spawn(
            async move {
                loop {
                    match sig.next().await {
                        Ok(sig) if sig.is_shutdown() => {
                            info!("received {}, shutting down server", sig.name());
                            handle.graceful_shutdown(Some(grace));
                            break;
                        }
                        Ok(sig) => {
                            debug!("don't know what to do with signal {}, ignoring", sig.name());
                        }
                        Err(err) => {
                            error!("error in signal handler: {err}");
                        }
                    }
                }
            }
            .instrument(span),
        ))
    }
}

/// Install the process-wide rustls crypto provider and load a PEM
/// certificate chain and key into a [`RustlsConfig`].
///
/// Idempotent: rustls ignores a second `install_default` call rather than
/// erroring, so this is safe to call from both the supervisor and a user
/// process within the same process tree without coordination.
async fn load_tls_config(
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> Result<RustlsConfig, ServerBuilderError> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    RustlsConfig::from_pem_file(cert_file, key_file)
        .await
        .map_err(ServerBuilderError::TlsLoad)
}

/// TCP-level socket configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct TcpConfig {
    /// Set `TCP_NODELAY` for accepted connections.
    ///
    /// Kept on by default: this server emits many small, latency-sensitive
    /// frames (gamer/video_caller traffic, ping probes); Nagle's algorithm
    /// would add exactly the jitter those archetypes are meant to avoid.
    #[serde(default = "crate::util::default_true")]
    pub nodelay: bool,
    /// Size of the TCP backlog queue.
    #[serde(default = "TcpConfig::default_backlog")]
    pub backlog: NonZeroU32,
    /// TCP keep-alive socket options.
    #[serde(default)]
    pub keepalive: TcpKeepaliveConfig,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            backlog: Self::default_backlog(),
            keepalive: TcpKeepaliveConfig::default(),
        }
    }
}

impl TcpConfig {
    #[must_use]
    #[inline]
    #[allow(clippy::unwrap_used)]
    fn default_backlog() -> NonZeroU32 {
        NonZeroU32::new(1024).unwrap()
    }
}

/// TCP keepalive configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct TcpKeepaliveConfig {
    /// Duration to remain idle before sending TCP keepalive probes.
    ///
    /// TCP keepalive is disabled if this is not provided.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub idle: Option<Duration>,
    /// Duration between successive keepalive retransmissions.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub interval: Option<Duration>,
    /// Retransmissions to attempt before declaring the remote end gone.
    pub retries: Option<NonZeroU32>,
}

/// Resolve a host:port string into a bound, listening [`TcpSocket`], trying
/// each resolved address in order.
async fn socket<O>(origin: O) -> Result<(TcpSocket, SocketAddr), ServerBuilderError>
where
    O: ToSocketAddrs + ToString,
{
    let mut ret_err = None;
    let ret = resolve(&origin)
        .await?
        .find_map(|addr| match sock_create(&addr) {
            Ok(sock) => Some((sock, addr)),
            Err(err) => {
                ret_err = Some(err);
                None
            }
        });
    match ret {
        Some(pair) => Ok(pair),
        None => match ret_err {
            Some(err) => Err(err),
            None => Err(ServerBuilderError::Resolve(origin.to_string())),
        },
    }
}

async fn resolve<O>(origin: &O) -> Result<impl Iterator<Item = SocketAddr> + '_, ServerBuilderError>
where
    O: ToSocketAddrs + ToString,
{
    lookup_host(origin)
        .await
        .map_err(|err| ServerBuilderError::AddressParse(err.into()))
}

fn sock_create(addr: &SocketAddr) -> Result<TcpSocket, ServerBuilderError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|err| ServerBuilderError::SocketCreate(err.into()))?;

    #[cfg(not(windows))]
    socket
        .set_reuseaddr(true)
        .map_err(|err| ServerBuilderError::SetReuseAddr(err.into()))?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listen_is_wildcard() {
        assert_eq!(ServerBuilder::default().listen, "0.0.0.0:8080");
    }

    #[test]
    fn tcp_config_defaults_nodelay_on() {
        assert!(TcpConfig::default().nodelay);
    }
}
