use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// The session's multicast group. Every datagram is exactly one frame, sent to all members of
///  the group.
///
/// This is an abstraction over the UDP socket, introduced to facilitate mocking the I/O part away
///  for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataPlane: Send + Sync + 'static {
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()>;

    /// Waits for the next datagram, returning its length. This is cancel safe: dropping the
    ///  future before it completes loses no data.
    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<usize>;

    /// leaves the multicast group, after which the data plane must not be used any more
    async fn leave(&self) -> anyhow::Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataPlaneFactory: Send + Sync + 'static {
    async fn open(&self, group: Ipv4Addr, port: u16) -> anyhow::Result<Arc<dyn DataPlane>>;
}
