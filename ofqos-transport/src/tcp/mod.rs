//! Plain TCP transport.

use std::{
    io,
    net::SocketAddr,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use ofqos_common::async_error;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::{PeerAddress, Transport};

/// Options of the [`Tcp`] transport.
#[derive(Debug, Clone)]
pub struct Config {
    /// Disables Nagle's algorithm on accepted connections. OpenFlow messages are small and
    /// latency sensitive, so this is on by default.
    pub nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

/// Accepts switch connections on a TCP listener.
#[derive(Debug, Default)]
pub struct Tcp {
    config: Config,
    listener: Option<TcpListener>,
}

impl Tcp {
    /// Creates an unbound transport.
    pub fn new(config: Config) -> Self {
        Self { config, listener: None }
    }
}

impl PeerAddress<SocketAddr> for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.peer_addr()
    }
}

#[async_trait::async_trait]
impl Transport<SocketAddr> for Tcp {
    type Io = TcpStream;

    type Error = io::Error;

    type Accept = BoxFuture<'static, Result<Self::Io, Self::Error>>;

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    async fn bind(&mut self, addr: SocketAddr) -> Result<(), Self::Error> {
        let listener = TcpListener::bind(addr).await?;

        self.listener = Some(listener);

        Ok(())
    }

    fn poll_accept(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Accept> {
        let this = self.get_mut();

        let Some(ref listener) = this.listener else {
            return Poll::Ready(async_error(io::ErrorKind::NotConnected.into()));
        };

        match listener.poll_accept(cx) {
            Poll::Ready(Ok((io, addr))) => {
                debug!("Accepted connection from {}", addr);

                let nodelay = this.config.nodelay;
                Poll::Ready(Box::pin(async move {
                    io.set_nodelay(nodelay)?;
                    Ok(io)
                }))
            }
            Poll::Ready(Err(e)) => Poll::Ready(async_error(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}
