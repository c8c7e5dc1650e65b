//! [`Allocator`] of relay sockets.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use tokio::net::UdpSocket;

use crate::{Error, transport};

/// [`Allocator`] binds relay sockets when creating an allocation.
#[derive(Clone, Debug)]
pub struct Allocator {
    /// IP address reported to clients as the relayed transport address.
    pub relay_address: IpAddr,

    /// IP address the relay sockets are bound to.
    pub bind_address: IpAddr,

    /// Minimum port to allocate.
    pub min_port: u16,

    /// Maximum (inclusive) port to allocate.
    pub max_port: u16,
}

impl Allocator {
    /// Binds a relay socket to the provided `port` of the
    /// [`Allocator::bind_address`].
    ///
    /// Returns the bound socket along with its relayed transport address,
    /// which carries the [`Allocator::relay_address`].
    ///
    /// # Errors
    ///
    /// With [`Error::Transport`] if failed to bind to the specified port.
    pub async fn bind(
        &self,
        port: u16,
    ) -> Result<(Arc<UdpSocket>, SocketAddr), Error> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_address, port))
            .await
            .map_err(transport::Error::from)?;
        let mut relay_addr =
            socket.local_addr().map_err(transport::Error::from)?;
        relay_addr.set_ip(self.relay_address);

        Ok((Arc::new(socket), relay_addr))
    }
}
