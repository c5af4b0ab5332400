//! Transports that accept switch connections.

use std::{
    fmt::Debug,
    future::Future,
    hash::Hash,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use futures::future::poll_fn;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod tcp;

/// A trait for address types that transports can bind to.
pub trait Address: Clone + Debug + Send + Sync + Unpin + Hash + Eq + 'static {}

impl Address for SocketAddr {}

/// Returns the address of the remote end of a connection.
pub trait PeerAddress<A: Address> {
    fn peer_addr(&self) -> io::Result<A>;
}

/// A server-side transport. Switches dial the controller, so the controller only ever
/// listens and accepts.
#[async_trait::async_trait]
pub trait Transport<A: Address>: Send + Sync + Unpin + 'static {
    /// The result of a successful accept.
    type Io: AsyncRead + AsyncWrite + PeerAddress<A> + Debug + Send + Unpin + 'static;
    /// An error that can occur when binding or accepting.
    type Error: std::error::Error + From<io::Error> + Send + Sync + 'static;
    /// The future that finishes setting up an accepted connection.
    type Accept: Future<Output = Result<Self::Io, Self::Error>> + Send + Unpin;

    /// Returns the local address this transport is bound to, if any.
    fn local_addr(&self) -> Option<A>;

    /// Binds to the given address.
    async fn bind(&mut self, addr: A) -> Result<(), Self::Error>;

    /// Polls for a new incoming connection.
    fn poll_accept(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Accept>;
}

/// Convenience methods on top of [`Transport`].
#[async_trait::async_trait]
pub trait TransportExt<A: Address>: Transport<A> {
    /// Waits for the next incoming connection and completes its setup.
    async fn accept(&mut self) -> Result<Self::Io, Self::Error> {
        let accept = poll_fn(|cx| Pin::new(&mut *self).poll_accept(cx)).await;
        accept.await
    }
}

impl<A: Address, T: Transport<A>> TransportExt<A> for T {}
