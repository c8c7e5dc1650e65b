mod conf;
mod log;

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use secrecy::SecretString;
use tokio::{
    net::{TcpListener, UdpSocket},
    signal,
};
use turn_relay::{
    AuthMode, Config, Rfc3489Addresses, Server, ServerConfig,
    StaticAuthHandler, Transport,
    relay::Allocator,
    transport::{Framing, TcpServer, Udp},
};

use crate::conf::Conf;

#[tokio::main(flavor = "current_thread")] // single thread is enough
async fn main() -> anyhow::Result<()> {
    drop(dotenvy::dotenv().ok());
    let conf = Conf::parse()?;

    log::init(conf.log.clone());

    tracing::info!("STUN config: {:?}", conf.stun);

    let primary = SocketAddr::new(conf.stun.bind_ip, conf.stun.bind_port);
    let rfc3489 = conf.stun.alternate_ip.map(|ip| Rfc3489Addresses {
        primary,
        alternate: SocketAddr::new(ip, conf.stun.alternate_port),
    });

    let connections = bind_connections(&conf.stun, primary, rfc3489).await?;
    for c in &connections {
        tracing::info!(
            "Listening on {}/{}",
            c.local_addr(),
            c.transport_type(),
        );
    }

    let users = conf
        .turn
        .users
        .iter()
        .map(|(name, pass)| (name.clone(), SecretString::from(pass.clone())));
    let server = Server::new(Config {
        connections,
        relay: Allocator {
            relay_address: conf.turn.relay_ip.unwrap_or(conf.stun.bind_ip),
            bind_address: conf.stun.bind_ip,
            min_port: conf.turn.min_port,
            max_port: conf.turn.max_port,
        },
        auth_handler: Arc::new(StaticAuthHandler::new(users)),
        server: ServerConfig {
            realm: conf.turn.realm.clone(),
            auth_mode: match conf.turn.auth {
                conf::AuthMode::None => AuthMode::None,
                conf::AuthMode::ShortTerm => AuthMode::ShortTerm,
                conf::AuthMode::LongTerm => AuthMode::LongTerm,
            },
            default_lifetime: Duration::from_secs(conf.turn.default_lifetime),
            max_lifetime: Duration::from_secs(conf.turn.max_lifetime),
            nonce_lifetime: conf.turn.nonce_lifetime(),
            rfc3489,
            require_channel_confirmation: conf
                .turn
                .require_channel_confirmation,
            ..ServerConfig::default()
        },
        alloc_close_notify: None,
    });

    wait_for_shutdown().await?;

    tracing::info!("Shutting down");
    server.close().await;

    Ok(())
}

/// Binds all the [`Transport`]s to listen on.
///
/// With `rfc3489` addresses configured, UDP sockets are bound to every
/// combination of the primary and the alternate IPs and ports.
async fn bind_connections(
    stun: &conf::Stun,
    primary: SocketAddr,
    rfc3489: Option<Rfc3489Addresses>,
) -> anyhow::Result<Vec<Arc<dyn Transport + Send + Sync>>> {
    let mut udp_addrs = vec![primary];
    if let Some(addrs) = rfc3489 {
        let alt = addrs.alternate;
        udp_addrs.extend([
            SocketAddr::new(alt.ip(), primary.port()),
            SocketAddr::new(primary.ip(), alt.port()),
            alt,
        ]);
    }

    let mut connections: Vec<Arc<dyn Transport + Send + Sync>> = Vec::new();
    for addr in udp_addrs {
        connections.push(Arc::new(Udp::new(UdpSocket::bind(addr).await?)?));
    }
    if stun.tcp {
        let framing = if stun.legacy_framing {
            Framing::Legacy
        } else {
            Framing::Rfc5766
        };
        connections.push(Arc::new(TcpServer::new(
            TcpListener::bind(primary).await?,
            framing,
        )?));
    }

    Ok(connections)
}

#[cfg(unix)]
/// Waits for [SIGINT] or [SIGTERM].
///
/// [SIGINT]: https://en.wikipedia.org/wiki/Signal_(IPC)#SIGINT
/// [SIGTERM]: https://en.wikipedia.org/wiki/Signal_(IPC)#SIGTERM
async fn wait_for_shutdown() -> io::Result<()> {
    use tokio::signal::unix;

    let mut sigterm = unix::signal(unix::SignalKind::terminate())?;
    let sigint = signal::ctrl_c();

    tokio::select! {
        _ = sigint => {}
        _ = sigterm.recv() => {}
    }

    Ok(())
}

#[cfg(not(unix))]
/// Waits for a [`signal::ctrl_c`].
async fn wait_for_shutdown() -> io::Result<()> {
    signal::ctrl_c().await
}
