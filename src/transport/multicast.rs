use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::config::NodeConfig;
use crate::transport::data_plane::{DataPlane, DataPlaneFactory};

/// UDP multicast data plane: one socket that is bound to the group's port, joined to the group,
///  and sends to the group address.
pub struct MulticastDataPlane {
    socket: UdpSocket,
    group: SocketAddrV4,
    interface: Ipv4Addr,
}

impl MulticastDataPlane {
    pub fn open(group: Ipv4Addr, port: u16, config: &NodeConfig) -> anyhow::Result<MulticastDataPlane> {
        if !group.is_multicast() {
            bail!("{} is not a multicast address", group);
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // several nodes on one host share the group's port
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.set_recv_buffer_size(config.receive_buffer_size)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;

        socket.join_multicast_v4(&group, &config.multicast_interface)?;
        socket.set_multicast_loop_v4(config.multicast_loop)?;
        socket.set_multicast_ttl_v4(config.multicast_ttl)?;
        if !config.multicast_interface.is_unspecified() {
            socket.set_multicast_if_v4(&config.multicast_interface)?;
        }

        let socket = UdpSocket::from_std(socket.into())?;
        info!("joined multicast group {}:{} on interface {}", group, port, config.multicast_interface);

        Ok(MulticastDataPlane {
            socket,
            group: SocketAddrV4::new(group, port),
            interface: config.multicast_interface,
        })
    }
}

#[async_trait]
impl DataPlane for MulticastDataPlane {
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        trace!("sending {} bytes to {}", buf.len(), self.group);
        self.socket.send_to(buf, self.group).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let (len, from) = self.socket.recv_from(buf).await?;
        trace!("received {} bytes from {:?}", len, from);
        Ok(len)
    }

    async fn leave(&self) -> anyhow::Result<()> {
        debug!("leaving multicast group {}", self.group);
        self.socket.leave_multicast_v4(*self.group.ip(), self.interface)?;
        Ok(())
    }
}

pub struct MulticastDataPlaneFactory {
    config: Arc<NodeConfig>,
}
impl MulticastDataPlaneFactory {
    pub fn new(config: Arc<NodeConfig>) -> MulticastDataPlaneFactory {
        MulticastDataPlaneFactory { config }
    }
}

#[async_trait]
impl DataPlaneFactory for MulticastDataPlaneFactory {
    async fn open(&self, group: Ipv4Addr, port: u16) -> anyhow::Result<Arc<dyn DataPlane>> {
        Ok(Arc::new(MulticastDataPlane::open(group, port, &self.config)?))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NodeConfig {
        NodeConfig::new("test", "127.0.0.1:8000".parse().unwrap(), "127.0.0.1:8001".parse().unwrap())
    }

    #[tokio::test]
    async fn test_open_rejects_unicast_address() {
        assert!(MulticastDataPlane::open(Ipv4Addr::new(10, 0, 0, 1), 5000, &config()).is_err());
    }
}
