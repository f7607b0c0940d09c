//! Bundled UDP transport.
//!
//! Each host runs three tasks: a network receiver that turns datagrams into
//! [`TransportEvent`]s, a network sender that executes [`Outgoing`] requests,
//! and a keepalive task (timeouts and heartbeats on the server, connect
//! retries and heartbeats on the client).
//!
//! Delivery is best effort: the reliability flag is carried to the receiving
//! side but nothing is retransmitted.

use super::peer_table::PeerTable;
use super::{host_pair, Host, HostLink, Outgoing, Role, TransportEvent};
use crate::config::MultiplayerConfig;
use crate::error::RpcError;
use log::{debug, error, info, warn};
use rand::Rng;
use shared::{Datagram, PeerId, SERVER_PEER_ID};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, RwLock};

const MAX_DATAGRAM_SIZE: usize = 65_536;

async fn send_datagram(socket: &UdpSocket, datagram: &Datagram, addr: SocketAddr) -> Result<(), RpcError> {
    let data = datagram.to_bytes()?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

/// Binds a server socket on `addr` and starts serving.
pub async fn listen(addr: &str, config: &MultiplayerConfig) -> Result<Host, RpcError> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local_addr = socket.local_addr()?;
    info!("Server listening on {}", local_addr);

    let (host, link) = host_pair(Role::Server, SERVER_PEER_ID, config.packet_queue_size);
    let server = ServerHost {
        socket,
        peers: Arc::new(RwLock::new(PeerTable::new(
            config.max_clients,
            config.refuse_connections,
        ))),
        config: config.clone(),
    };
    server.spawn(link);

    Ok(host.with_local_addr(local_addr))
}

/// Starts connecting to the server at `addr` under a random peer id. The
/// outcome arrives later as a `Connect { peer: 1 }` or `ConnectionFailed`
/// event.
pub async fn connect(addr: &str, config: &MultiplayerConfig) -> Result<Host, RpcError> {
    let server_addr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| RpcError::Transport(format!("cannot resolve {}", addr)))?;
    let bind_addr = if server_addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    socket.connect(server_addr).await?;
    let local_addr = socket.local_addr()?;

    // Stay within the positive i32 range so the id fits a routing target.
    let unique_id: PeerId = rand::thread_rng().gen_range(2..=i32::MAX as PeerId);
    info!("Connecting to {} as peer {}", server_addr, unique_id);

    let (host, link) = host_pair(Role::Client, unique_id, config.packet_queue_size);
    let client = ClientHost {
        socket,
        unique_id,
        state: Arc::new(RwLock::new(ClientState::new())),
        config: config.clone(),
    };
    client.spawn(link);

    Ok(host.with_local_addr(local_addr))
}

/// Server end of the UDP binding: one socket shared by three tasks
struct ServerHost {
    socket: Arc<UdpSocket>,
    peers: Arc<RwLock<PeerTable>>,
    config: MultiplayerConfig,
}

impl ServerHost {
    /// Starts the receiver, sender and timeout tasks; the sender owns the stop signal
    fn spawn(self, link: HostLink) {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.spawn_network_receiver(link.events.clone(), stop_rx.clone());
        self.spawn_timeout_checker(link.events, stop_rx);
        self.spawn_network_sender(link.outgoing, stop_tx);
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&self, events: mpsc::Sender<TransportEvent>, mut stop: watch::Receiver<bool>) {
        let socket = Arc::clone(&self.socket);
        let peers = Arc::clone(&self.peers);

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                let (len, addr) = tokio::select! {
                    _ = stop.changed() => break,
                    received = socket.recv_from(&mut buffer) => match received {
                        Ok(received) => received,
                        Err(e) => {
                            error!("Error receiving datagram: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                    },
                };

                let datagram = match Datagram::from_bytes(&buffer[..len]) {
                    Ok(datagram) => datagram,
                    Err(_) => {
                        warn!("Failed to deserialize datagram from {}", addr);
                        continue;
                    }
                };

                if let Some(event) = Self::handle_datagram(&socket, &peers, datagram, addr).await {
                    if events.send(event).await.is_err() {
                        debug!("Event queue closed, server receiver exiting");
                        break;
                    }
                }
            }
        });
    }

    /// Handles one datagram: admission, heartbeats, goodbyes and payloads
    ///
    /// Payloads from addresses that never connected are dropped.
    async fn handle_datagram(
        socket: &UdpSocket,
        peers: &RwLock<PeerTable>,
        datagram: Datagram,
        addr: SocketAddr,
    ) -> Option<TransportEvent> {
        match datagram {
            Datagram::Connect { unique_id } => {
                let admitted = peers.write().await.admit(unique_id, addr);
                let (reply, event) = match admitted {
                    Ok(is_new) => (
                        Datagram::Accepted { peer_id: unique_id },
                        is_new.then_some(TransportEvent::Connect { peer: unique_id }),
                    ),
                    Err(refusal) => {
                        warn!("Refused connection from {}: {}", addr, refusal);
                        (
                            Datagram::Refused {
                                reason: refusal.to_string(),
                            },
                            None,
                        )
                    }
                };
                if let Err(e) = send_datagram(socket, &reply, addr).await {
                    error!("Failed to answer connect from {}: {}", addr, e);
                }
                event
            }
            Datagram::Heartbeat => {
                peers.write().await.touch_addr(addr);
                None
            }
            Datagram::Disconnect => {
                let mut peers = peers.write().await;
                let peer = peers.find_by_addr(addr)?;
                peers.remove(peer);
                Some(TransportEvent::Disconnect { peer })
            }
            Datagram::Payload {
                channel,
                reliable,
                data,
            } => match peers.write().await.touch_addr(addr) {
                Some(peer) => Some(TransportEvent::Receive {
                    peer,
                    channel,
                    data,
                    reliable,
                }),
                None => {
                    warn!("Payload from unknown address {}", addr);
                    None
                }
            },
            Datagram::Accepted { .. } | Datagram::Refused { .. } => {
                warn!("Unexpected datagram from {}", addr);
                None
            }
        }
    }

    /// Spawns task that processes outgoing requests until close
    fn spawn_network_sender(&self, mut outgoing: mpsc::UnboundedReceiver<Outgoing>, stop: watch::Sender<bool>) {
        let socket = Arc::clone(&self.socket);
        let peers = Arc::clone(&self.peers);

        tokio::spawn(async move {
            while let Some(request) = outgoing.recv().await {
                match request {
                    Outgoing::Send {
                        peer,
                        channel,
                        data,
                        reliable,
                    } => {
                        let addr = peers.read().await.addr_of(peer);
                        let Some(addr) = addr else {
                            debug!("Dropping packet for unknown peer {}", peer);
                            continue;
                        };
                        let datagram = Datagram::Payload {
                            channel,
                            reliable,
                            data,
                        };
                        if let Err(e) = send_datagram(&socket, &datagram, addr).await {
                            error!("Failed to send to peer {}: {}", peer, e);
                        }
                    }
                    Outgoing::Broadcast {
                        channel,
                        data,
                        reliable,
                    } => {
                        let datagram = Datagram::Payload {
                            channel,
                            reliable,
                            data,
                        };
                        let addrs = peers.read().await.addrs();
                        for (peer, addr) in addrs {
                            if let Err(e) = send_datagram(&socket, &datagram, addr).await {
                                error!("Failed to send to peer {}: {}", peer, e);
                            }
                        }
                    }
                    Outgoing::Disconnect { peer } => {
                        let removed = peers.write().await.remove(peer);
                        if let Some(removed) = removed {
                            if let Err(e) = send_datagram(&socket, &Datagram::Disconnect, removed.addr).await {
                                error!("Failed to notify peer {}: {}", peer, e);
                            }
                        }
                    }
                    Outgoing::StopPolling => {
                        let _ = stop.send(true);
                    }
                    Outgoing::Close => break,
                }
            }

            let _ = stop.send(true);
            let addrs = peers.read().await.addrs();
            for (_, addr) in addrs {
                let _ = send_datagram(&socket, &Datagram::Disconnect, addr).await;
            }
            info!("Server host closed");
        });
    }

    /// Spawns task that heartbeats clients and reports silent ones as disconnected
    fn spawn_timeout_checker(&self, events: mpsc::Sender<TransportEvent>, mut stop: watch::Receiver<bool>) {
        let socket = Arc::clone(&self.socket);
        let peers = Arc::clone(&self.peers);
        let heartbeat_interval = self.config.heartbeat_interval;
        let peer_timeout = self.config.peer_timeout;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);

            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {}
                }

                let (timed_out, addrs) = {
                    let mut peers = peers.write().await;
                    (peers.check_timeouts(peer_timeout), peers.addrs())
                };

                for (peer, addr) in addrs {
                    if let Err(e) = send_datagram(&socket, &Datagram::Heartbeat, addr).await {
                        debug!("Heartbeat to peer {} failed: {}", peer, e);
                    }
                }

                for peer in timed_out {
                    warn!("Peer {} timed out", peer);
                    if events.send(TransportEvent::Disconnect { peer }).await.is_err() {
                        return;
                    }
                }
            }
        });
    }
}

#[derive(Debug)]
struct ClientState {
    accepted: bool,
    /// A terminal event (failure or disconnect) has been reported.
    finished: bool,
    started: Instant,
    last_seen: Instant,
}

impl ClientState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            accepted: false,
            finished: false,
            started: now,
            last_seen: now,
        }
    }

    /// Marks the session over; true only for the first caller.
    fn finish(&mut self) -> bool {
        let first = !self.finished;
        self.finished = true;
        first
    }
}

enum Keepalive {
    Send(Datagram),
    Failed,
    Lost,
}

/// Client end of the UDP binding, connected to a single server address
struct ClientHost {
    socket: Arc<UdpSocket>,
    unique_id: PeerId,
    state: Arc<RwLock<ClientState>>,
    config: MultiplayerConfig,
}

impl ClientHost {
    /// Starts the receiver, keepalive and sender tasks
    fn spawn(self, link: HostLink) {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.spawn_network_receiver(link.events.clone(), stop_rx.clone());
        self.spawn_keepalive(link.events, stop_rx);
        self.spawn_network_sender(link.outgoing, stop_tx);
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&self, events: mpsc::Sender<TransportEvent>, mut stop: watch::Receiver<bool>) {
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        let unique_id = self.unique_id;

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                let len = tokio::select! {
                    _ = stop.changed() => break,
                    received = socket.recv(&mut buffer) => match received {
                        Ok(len) => len,
                        Err(e) => {
                            // Connected UDP sockets surface ICMP errors here
                            // while the server is not up yet.
                            debug!("Error receiving datagram: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                    },
                };

                let datagram = match Datagram::from_bytes(&buffer[..len]) {
                    Ok(datagram) => datagram,
                    Err(_) => {
                        warn!("Failed to deserialize datagram from server");
                        continue;
                    }
                };

                let (event, done) = {
                    let mut state = state.write().await;
                    let event = Self::handle_datagram(&mut state, unique_id, datagram);
                    (event, state.finished)
                };

                if let Some(event) = event {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                if done {
                    break;
                }
            }
        });
    }

    /// Turns one datagram from the server into at most one event
    fn handle_datagram(state: &mut ClientState, unique_id: PeerId, datagram: Datagram) -> Option<TransportEvent> {
        if state.finished {
            return None;
        }
        match datagram {
            Datagram::Accepted { peer_id } => {
                state.last_seen = Instant::now();
                if state.accepted {
                    return None;
                }
                if peer_id != unique_id {
                    warn!("Server accepted peer {} but we are {}", peer_id, unique_id);
                    return None;
                }
                state.accepted = true;
                info!("Connected to server as peer {}", unique_id);
                Some(TransportEvent::Connect {
                    peer: SERVER_PEER_ID,
                })
            }
            Datagram::Refused { reason } => {
                if state.accepted {
                    return None;
                }
                state.finish();
                warn!("Server refused connection: {}", reason);
                Some(TransportEvent::ConnectionFailed { reason })
            }
            Datagram::Heartbeat => {
                state.last_seen = Instant::now();
                None
            }
            Datagram::Disconnect => {
                if !state.accepted {
                    return None;
                }
                state.finish();
                info!("Server closed the connection");
                Some(TransportEvent::Disconnect {
                    peer: SERVER_PEER_ID,
                })
            }
            Datagram::Payload {
                channel,
                reliable,
                data,
            } => {
                if !state.accepted {
                    return None;
                }
                state.last_seen = Instant::now();
                Some(TransportEvent::Receive {
                    peer: SERVER_PEER_ID,
                    channel,
                    data,
                    reliable,
                })
            }
            Datagram::Connect { .. } => {
                warn!("Unexpected connect datagram from server");
                None
            }
        }
    }

    /// Spawns task that retries the handshake, then heartbeats and watches for server silence
    fn spawn_keepalive(&self, events: mpsc::Sender<TransportEvent>, mut stop: watch::Receiver<bool>) {
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        let unique_id = self.unique_id;
        let connect_timeout = self.config.connect_timeout;
        let peer_timeout = self.config.peer_timeout;
        let heartbeat_interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);

            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {}
                }

                let action = {
                    let mut state = state.write().await;
                    if state.finished {
                        break;
                    }
                    if !state.accepted {
                        if state.started.elapsed() > connect_timeout {
                            state.finish();
                            Keepalive::Failed
                        } else {
                            Keepalive::Send(Datagram::Connect { unique_id })
                        }
                    } else if state.last_seen.elapsed() > peer_timeout {
                        state.finish();
                        Keepalive::Lost
                    } else {
                        Keepalive::Send(Datagram::Heartbeat)
                    }
                };

                match action {
                    Keepalive::Send(datagram) => {
                        let sent = match datagram.to_bytes() {
                            Ok(data) => socket.send(&data).await.map(|_| ()).map_err(RpcError::from),
                            Err(e) => Err(RpcError::from(e)),
                        };
                        if let Err(e) = sent {
                            debug!("Keepalive send failed: {}", e);
                        }
                    }
                    Keepalive::Failed => {
                        warn!("Timed out connecting to server");
                        let _ = events
                            .send(TransportEvent::ConnectionFailed {
                                reason: "connection timed out".into(),
                            })
                            .await;
                        break;
                    }
                    Keepalive::Lost => {
                        warn!("Server timed out");
                        let _ = events
                            .send(TransportEvent::Disconnect {
                                peer: SERVER_PEER_ID,
                            })
                            .await;
                        break;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing requests until close
    fn spawn_network_sender(&self, mut outgoing: mpsc::UnboundedReceiver<Outgoing>, stop: watch::Sender<bool>) {
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            while let Some(request) = outgoing.recv().await {
                let datagram = match request {
                    Outgoing::Send {
                        peer,
                        channel,
                        data,
                        reliable,
                    } => {
                        if peer != SERVER_PEER_ID {
                            debug!("Clients only talk to the server, dropping packet for {}", peer);
                            continue;
                        }
                        Datagram::Payload {
                            channel,
                            reliable,
                            data,
                        }
                    }
                    Outgoing::Broadcast {
                        channel,
                        data,
                        reliable,
                    } => Datagram::Payload {
                        channel,
                        reliable,
                        data,
                    },
                    Outgoing::Disconnect { peer } if peer == SERVER_PEER_ID => break,
                    Outgoing::Disconnect { .. } => continue,
                    Outgoing::StopPolling => {
                        let _ = stop.send(true);
                        continue;
                    }
                    Outgoing::Close => break,
                };

                let sent = match datagram.to_bytes() {
                    Ok(data) => socket.send(&data).await.map(|_| ()).map_err(RpcError::from),
                    Err(e) => Err(RpcError::from(e)),
                };
                if let Err(e) = sent {
                    error!("Failed to send to server: {}", e);
                }
            }

            let _ = stop.send(true);
            let accepted = state.read().await.accepted;
            if accepted {
                if let Ok(data) = Datagram::Disconnect.to_bytes() {
                    let _ = socket.send(&data).await;
                }
            }
            info!("Client host closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Channel;

    fn fast_config() -> MultiplayerConfig {
        MultiplayerConfig {
            heartbeat_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(300),
            ..MultiplayerConfig::default()
        }
    }

    async fn next_event(host: &mut Host) -> TransportEvent {
        for _ in 0..50 {
            if let Some(event) = host.poll_event(Duration::from_millis(100)).await.unwrap() {
                return event;
            }
        }
        panic!("no transport event within 5s");
    }

    #[test]
    fn test_client_state_finishes_once() {
        let mut state = ClientState::new();
        assert!(state.finish());
        assert!(!state.finish());
    }

    #[test]
    fn test_client_ignores_payload_before_accept() {
        let mut state = ClientState::new();
        let payload = Datagram::Payload {
            channel: 1,
            reliable: true,
            data: vec![1],
        };
        assert_eq!(ClientHost::handle_datagram(&mut state, 5, payload.clone()), None);

        assert_eq!(
            ClientHost::handle_datagram(&mut state, 5, Datagram::Accepted { peer_id: 5 }),
            Some(TransportEvent::Connect { peer: SERVER_PEER_ID })
        );
        assert!(matches!(
            ClientHost::handle_datagram(&mut state, 5, payload),
            Some(TransportEvent::Receive { peer: SERVER_PEER_ID, .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let config = fast_config();
        let mut server = listen("127.0.0.1:0", &config).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let mut client = connect(&addr, &config).await.unwrap();
        let client_id = client.local_id();
        assert!(client_id >= 2);

        assert_eq!(
            next_event(&mut client).await,
            TransportEvent::Connect { peer: SERVER_PEER_ID }
        );
        assert_eq!(
            next_event(&mut server).await,
            TransportEvent::Connect { peer: client_id }
        );

        client.send(SERVER_PEER_ID, Channel::Reliable, vec![1, 2, 3], true).unwrap();
        assert_eq!(
            next_event(&mut server).await,
            TransportEvent::Receive {
                peer: client_id,
                channel: 1,
                data: vec![1, 2, 3],
                reliable: true
            }
        );

        server.send(client_id, Channel::Unreliable, vec![4], false).unwrap();
        assert_eq!(
            next_event(&mut client).await,
            TransportEvent::Receive {
                peer: SERVER_PEER_ID,
                channel: 2,
                data: vec![4],
                reliable: false
            }
        );

        client.close();
        assert_eq!(
            next_event(&mut server).await,
            TransportEvent::Disconnect { peer: client_id }
        );
        server.close();
    }

    #[tokio::test]
    async fn test_refused_when_closed() {
        let config = MultiplayerConfig {
            refuse_connections: true,
            ..fast_config()
        };
        let server = listen("127.0.0.1:0", &config).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let mut client = connect(&addr, &config).await.unwrap();
        assert!(matches!(
            next_event(&mut client).await,
            TransportEvent::ConnectionFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_server() {
        let config = fast_config();
        // Bind and drop to get a port nobody listens on.
        let port = {
            let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let mut client = connect(&format!("127.0.0.1:{}", port), &config).await.unwrap();
        assert_eq!(
            next_event(&mut client).await,
            TransportEvent::ConnectionFailed {
                reason: "connection timed out".into()
            }
        );
    }
}
