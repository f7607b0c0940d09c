//! The coordinator: the single task that owns peer state and path caches,
//! routes inbound packets and serialises every outbound one.

use crate::config::MultiplayerConfig;
use crate::error::RpcError;
use crate::path_cache::PathCache;
use crate::relay;
use crate::rpc::{Dispatch, Dispatcher, DynamicMethod, NativeFactory};
use crate::transport::{udp, Host, TransportEvent};
use crate::tree::{Node, SceneTree, TreeError};
use log::{debug, info, warn};
use shared::packet::{self, ControlMessage, MAX_CACHE_ID};
use shared::variant::{encode_arguments, MAX_ARGUMENTS};
use shared::{
    Channel, Command, NodeAddress, PacketHeader, PeerId, ProtocolError, RoutingTarget, SystemMessage,
    Variant, SERVER_PEER_ID,
};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Notifications published by a running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiplayerEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    /// The server accepted this client.
    ConnectionSucceeded,
    ConnectionFailed(String),
    ServerDisconnected,
    RawPacket { source: PeerId, data: Vec<u8> },
}

#[derive(Debug)]
pub(crate) enum ApiCommand {
    Rpc {
        path: String,
        target: RoutingTarget,
        name: String,
        args: Vec<Variant>,
        reliable: bool,
    },
    Raw {
        target: RoutingTarget,
        data: Vec<u8>,
        reliable: bool,
    },
    DisconnectPeer(PeerId),
    Shutdown,
}

/// Cloneable way into a running instance. Procedure bodies get one through
/// their call context.
#[derive(Debug, Clone)]
pub struct MultiplayerHandle {
    commands: mpsc::UnboundedSender<ApiCommand>,
}

impl MultiplayerHandle {
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<ApiCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { commands }, rx)
    }

    fn request(&self, command: ApiCommand) -> Result<(), RpcError> {
        self.commands
            .send(command)
            .map_err(|_| RpcError::Transport("multiplayer instance has stopped".into()))
    }

    /// Calls `name` on the node at `path` on every peer `target` selects.
    ///
    /// Fails right away when `args` has more than [`MAX_ARGUMENTS`] entries.
    pub fn send_rpc(
        &self,
        path: &str,
        target: RoutingTarget,
        name: &str,
        args: Vec<Variant>,
        reliable: bool,
    ) -> Result<(), RpcError> {
        if args.len() > MAX_ARGUMENTS {
            return Err(ProtocolError::TooManyArguments(args.len()).into());
        }
        self.request(ApiCommand::Rpc {
            path: path.to_owned(),
            target,
            name: name.to_owned(),
            args,
            reliable,
        })
    }

    pub fn send_raw(&self, target: RoutingTarget, data: Vec<u8>, reliable: bool) -> Result<(), RpcError> {
        self.request(ApiCommand::Raw {
            target,
            data,
            reliable,
        })
    }

    /// Server only: drops a client.
    pub fn disconnect_peer(&self, peer: PeerId) -> Result<(), RpcError> {
        self.request(ApiCommand::DisconnectPeer(peer))
    }

    pub fn shutdown(&self) {
        let _ = self.request(ApiCommand::Shutdown);
    }
}

pub struct MultiplayerApi {
    config: MultiplayerConfig,
    host: Host,
    dispatcher: Dispatcher,
    cache: PathCache,
    /// Server: every client. Client: the server plus peers learned by gossip.
    connected: BTreeSet<PeerId>,
    commands_tx: mpsc::UnboundedSender<ApiCommand>,
    commands_rx: mpsc::UnboundedReceiver<ApiCommand>,
    events_tx: mpsc::UnboundedSender<MultiplayerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<MultiplayerEvent>>,
}

impl MultiplayerApi {
    /// Wraps an already started transport.
    pub fn new(host: Host, tree: SceneTree, config: MultiplayerConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = MultiplayerHandle {
            commands: commands_tx.clone(),
        };
        let cache = PathCache::with_reoffer_interval(config.path_reoffer_interval);

        Self {
            config,
            host,
            dispatcher: Dispatcher::new(tree, handle),
            cache,
            connected: BTreeSet::new(),
            commands_tx,
            commands_rx,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Starts a server on `addr` using the bundled UDP transport.
    pub async fn listen(addr: &str, tree: SceneTree, config: MultiplayerConfig) -> Result<Self, RpcError> {
        let host = udp::listen(addr, &config).await?;
        Ok(Self::new(host, tree, config))
    }

    /// Starts connecting to the server at `addr`.
    pub async fn connect(addr: &str, tree: SceneTree, config: MultiplayerConfig) -> Result<Self, RpcError> {
        let host = udp::connect(addr, &config).await?;
        Ok(Self::new(host, tree, config))
    }

    pub fn handle(&self) -> MultiplayerHandle {
        MultiplayerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Takes the notification stream. Events are only published once it
    /// has been taken.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<MultiplayerEvent>> {
        self.events_rx.take()
    }

    pub fn tree(&self) -> &SceneTree {
        self.dispatcher.tree()
    }

    pub fn local_id(&self) -> PeerId {
        self.host.local_id()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.host.local_addr()
    }

    pub fn is_server(&self) -> bool {
        self.host.is_server()
    }

    pub fn connected_peers(&self) -> &BTreeSet<PeerId> {
        &self.connected
    }

    pub fn path_cache(&self) -> &PathCache {
        &self.cache
    }

    pub fn register_native_handler(
        &self,
        path: &str,
        name: &str,
        factory: NativeFactory,
    ) -> Result<Arc<Node>, TreeError> {
        self.tree().register_native_handler(path, name, factory)
    }

    pub fn register_method(&self, path: &str, name: &str, method: DynamicMethod) -> Result<Arc<Node>, TreeError> {
        self.tree().register_method(path, name, method)
    }

    /// Serves until shut down, until a client loses its server, or until the
    /// transport goes away.
    pub async fn run(mut self) -> Result<(), RpcError> {
        info!(
            "Multiplayer {} running as peer {}",
            self.host.role(),
            self.host.local_id()
        );

        let result = loop {
            tokio::select! {
                polled = self.host.poll_event(self.config.poll_timeout) => match polled {
                    Ok(Some(event)) => {
                        if self.handle_transport_event(event).is_break() {
                            break Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Transport stopped: {}", e);
                        break Err(e);
                    }
                },
                Some(command) = self.commands_rx.recv() => {
                    if self.handle_command(command).is_break() {
                        break Ok(());
                    }
                }
            }
        };

        self.shutdown_transport().await;
        result
    }

    async fn shutdown_transport(&mut self) {
        self.host.stop_polling();
        // Whatever the transport queued before stopping is still processed.
        while let Ok(Some(event)) = self.host.poll_event(self.config.poll_timeout).await {
            let _ = self.handle_transport_event(event);
        }
        self.host.close();
        info!("Multiplayer {} stopped", self.host.role());
    }

    fn emit(&self, event: MultiplayerEvent) {
        if self.events_rx.is_some() {
            return;
        }
        debug!("Event {:?}", event);
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn handle_transport_event(&mut self, event: TransportEvent) -> ControlFlow<()> {
        match event {
            TransportEvent::Connect { peer } => {
                self.on_peer_connected(peer);
                ControlFlow::Continue(())
            }
            TransportEvent::Disconnect { peer } => self.on_peer_disconnected(peer),
            TransportEvent::Receive {
                peer,
                channel,
                data,
                reliable,
            } => {
                match Channel::try_from(channel) {
                    Ok(Channel::Config) => self.on_control(peer, &data),
                    Ok(channel) => self.on_data(peer, channel, data, reliable),
                    Err(channel) => warn!("Dropped packet from peer {} on unknown channel {}", peer, channel),
                }
                ControlFlow::Continue(())
            }
            TransportEvent::ConnectionFailed { reason } => {
                warn!("Connection failed: {}", reason);
                self.emit(MultiplayerEvent::ConnectionFailed(reason));
                ControlFlow::Break(())
            }
        }
    }

    fn on_peer_connected(&mut self, peer: PeerId) {
        if peer == self.host.local_id() || !self.connected.insert(peer) {
            warn!("Ignoring duplicate connect for peer {}", peer);
            return;
        }
        self.cache.add_peer(peer);
        info!("Peer {} connected", peer);

        if !self.host.is_server() && peer == SERVER_PEER_ID {
            self.emit(MultiplayerEvent::ConnectionSucceeded);
        }
        self.emit(MultiplayerEvent::PeerConnected(peer));

        if self.host.is_server() && self.config.server_relay {
            for &other in self.connected.iter().filter(|&&other| other != peer) {
                self.send_control(peer, packet::encode_peer_notice(SystemMessage::AddPeer, other));
                self.send_control(other, packet::encode_peer_notice(SystemMessage::AddPeer, peer));
            }
        }
    }

    fn forget_peer(&mut self, peer: PeerId) -> bool {
        if !self.connected.remove(&peer) {
            return false;
        }
        self.cache.drop_peer(peer);
        info!("Peer {} disconnected", peer);
        self.emit(MultiplayerEvent::PeerDisconnected(peer));
        true
    }

    fn on_peer_disconnected(&mut self, peer: PeerId) -> ControlFlow<()> {
        if !self.host.is_server() && peer == SERVER_PEER_ID {
            let peers: Vec<PeerId> = self.connected.iter().copied().collect();
            for peer in peers {
                self.forget_peer(peer);
            }
            warn!("Lost connection to the server");
            self.emit(MultiplayerEvent::ServerDisconnected);
            return ControlFlow::Break(());
        }

        if self.forget_peer(peer) && self.host.is_server() && self.config.server_relay {
            for &other in &self.connected {
                self.send_control(other, packet::encode_peer_notice(SystemMessage::RemovePeer, peer));
            }
        }
        ControlFlow::Continue(())
    }

    fn on_control(&mut self, from: PeerId, data: &[u8]) {
        let message = match packet::decode_control(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropped control frame from peer {}: {}", from, e);
                return;
            }
        };

        match message {
            ControlMessage::AddPeer(_) | ControlMessage::RemovePeer(_) if self.host.is_server() => {
                warn!("Ignoring membership gossip from client {}", from);
            }
            ControlMessage::AddPeer(peer) => {
                if peer != self.host.local_id() && peer != SERVER_PEER_ID && self.connected.insert(peer) {
                    self.cache.add_peer(peer);
                    debug!("Learned about peer {}", peer);
                    self.emit(MultiplayerEvent::PeerConnected(peer));
                }
            }
            ControlMessage::RemovePeer(peer) => {
                self.forget_peer(peer);
            }
            ControlMessage::PathCache { header, payload } => {
                if !self.host.is_server() {
                    self.process_path_control(header.source, payload);
                    return;
                }
                if let Err(e) = relay::verify_source(header.source, from) {
                    warn!("Dropped path cache frame: {}", e);
                    return;
                }
                match header.target.unicast() {
                    Some(SERVER_PEER_ID) => self.process_path_control(from, payload),
                    Some(dest) if self.config.server_relay && self.connected.contains(&dest) => {
                        self.send_control(dest, data.to_vec());
                    }
                    _ => warn!(
                        "Dropped path cache frame from peer {} for target {}",
                        from, header.target.0
                    ),
                }
            }
        }
    }

    fn process_path_control(&mut self, source: PeerId, payload: &[u8]) {
        match payload.first().map(|&byte| Command::try_from(byte)) {
            Some(Ok(Command::SimplifyPath)) | Some(Ok(Command::ConfirmPath)) => self.deliver(source, payload),
            _ => warn!("Dropped non path cache command on control channel from peer {}", source),
        }
    }

    fn on_data(&mut self, from: PeerId, channel: Channel, data: Vec<u8>, reliable: bool) {
        let (header, payload) = match PacketHeader::decode(&data) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropped packet from peer {}: {}", from, e);
                return;
            }
        };

        if !self.host.is_server() {
            self.deliver(header.source, payload);
            return;
        }

        if let Err(e) = relay::verify_source(header.source, from) {
            warn!("Dropped packet: {}", e);
            return;
        }
        let decision = relay::route(from, header.target, &self.connected, self.config.server_relay);
        if !decision.deliver_locally && decision.forward_to.is_empty() {
            debug!("Packet from peer {} for target {} goes nowhere", from, header.target.0);
        }
        for peer in decision.forward_to {
            if let Err(e) = self.host.send(peer, channel, data.clone(), reliable) {
                warn!("Failed to relay packet to peer {}: {}", peer, e);
            }
        }
        if decision.deliver_locally {
            self.deliver(from, payload);
        }
    }

    fn deliver(&mut self, source: PeerId, payload: &[u8]) {
        match self.dispatcher.process_packet(&mut self.cache, source, payload) {
            Ok(Dispatch::PathCached { reply }) => self.send_path_control(source, &reply),
            Ok(Dispatch::Raw(data)) => self.emit(MultiplayerEvent::RawPacket { source, data }),
            Ok(outcome) => debug!("Packet from peer {} handled: {:?}", source, outcome),
            Err(e) => warn!("Dropped packet from peer {}: {}", source, e),
        }
    }

    fn send_control(&self, peer: PeerId, frame: Vec<u8>) {
        if let Err(e) = self.host.send(peer, Channel::Config, frame, true) {
            warn!("Failed to send control frame to peer {}: {}", peer, e);
        }
    }

    /// Sends a SimplifyPath/ConfirmPath payload to `dest`. Clients go through
    /// the server, which forwards it.
    fn send_path_control(&self, dest: PeerId, payload: &[u8]) {
        let header = PacketHeader::new(self.host.local_id(), RoutingTarget::peer(dest));
        let frame = packet::encode_path_control(header, payload);
        let via = if self.host.is_server() { dest } else { SERVER_PEER_ID };
        self.send_control(via, frame);
    }

    pub(crate) fn handle_command(&mut self, command: ApiCommand) -> ControlFlow<()> {
        let result = match command {
            ApiCommand::Rpc {
                path,
                target,
                name,
                args,
                reliable,
            } => self.send_rpc(path, target, &name, &args, reliable),
            ApiCommand::Raw {
                target,
                data,
                reliable,
            } => self.send_application(target, &packet::encode_raw(&data), reliable),
            ApiCommand::DisconnectPeer(peer) => self.disconnect_peer(peer),
            ApiCommand::Shutdown => {
                info!("Shutdown requested");
                return ControlFlow::Break(());
            }
        };
        if let Err(e) = result {
            warn!("Send failed: {}", e);
        }
        ControlFlow::Continue(())
    }

    fn send_rpc(
        &mut self,
        path: String,
        target: RoutingTarget,
        name: &str,
        args: &[Variant],
        reliable: bool,
    ) -> Result<(), RpcError> {
        let mut encoded = Vec::new();
        encode_arguments(args, &mut encoded)?;

        let path = self
            .tree()
            .get_node(&path)
            .map(|node| node.path())
            .unwrap_or(path);

        let status = self.cache.confirmation_status(&path, target, &self.connected);
        for &peer in &status.needs_simplify {
            self.send_path_control(peer, &packet::encode_simplify_path(status.cache_id, &path));
        }

        // A target nobody here knows about is vacuously confirmed; send it in full.
        let known_target = self.connected.iter().any(|&peer| target.admits(peer));
        let address = if known_target && status.all_confirmed && status.cache_id <= MAX_CACHE_ID {
            NodeAddress::Cached(status.cache_id)
        } else {
            NodeAddress::Literal(path)
        };
        debug!("Calling {} via {:?} for target {}", name, address, target.0);

        let payload = packet::encode_call(Command::RemoteCall, &address, name, &encoded);
        self.send_application(target, &payload, reliable)
    }

    fn send_application(&self, target: RoutingTarget, payload: &[u8], reliable: bool) -> Result<(), RpcError> {
        let packet = PacketHeader::new(self.host.local_id(), target).frame(payload);
        let channel = Channel::for_reliability(reliable);

        if !self.host.is_server() {
            return self.host.send(SERVER_PEER_ID, channel, packet, reliable);
        }
        let decision = relay::route(SERVER_PEER_ID, target, &self.connected, true);
        for peer in decision.forward_to {
            self.host.send(peer, channel, packet.clone(), reliable)?;
        }
        Ok(())
    }

    fn disconnect_peer(&mut self, peer: PeerId) -> Result<(), RpcError> {
        if !self.host.is_server() {
            return Err(RpcError::NotImplemented("clients cannot disconnect other peers"));
        }
        self.host.disconnect(peer)?;
        let _ = self.on_peer_disconnected(peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::dynamic_method;
    use crate::transport::{host_pair, HostLink, Outgoing, Role};
    use shared::packet::decode_call;
    use std::sync::Mutex;
    use std::time::Duration;

    fn server() -> (MultiplayerApi, HostLink) {
        server_with(MultiplayerConfig::default())
    }

    fn server_with(config: MultiplayerConfig) -> (MultiplayerApi, HostLink) {
        let (host, link) = host_pair(Role::Server, SERVER_PEER_ID, 16);
        let mut api = MultiplayerApi::new(host, SceneTree::new(), config);
        api.events_rx.take();
        (api, link)
    }

    fn client(id: PeerId) -> (MultiplayerApi, HostLink) {
        let (host, link) = host_pair(Role::Client, id, 16);
        let tree = SceneTree::new();
        tree.create_node("/root/Game").unwrap();
        let mut api = MultiplayerApi::new(host, tree, MultiplayerConfig::default());
        api.events_rx.take();
        (api, link)
    }

    fn sent(link: &mut HostLink) -> Vec<Outgoing> {
        let mut out = Vec::new();
        while let Ok(request) = link.outgoing.try_recv() {
            out.push(request);
        }
        out
    }

    fn control_to(peer: PeerId, frame: Vec<u8>) -> Outgoing {
        Outgoing::Send {
            peer,
            channel: Channel::Config.into(),
            data: frame,
            reliable: true,
        }
    }

    fn receive(peer: PeerId, channel: Channel, data: Vec<u8>) -> TransportEvent {
        TransportEvent::Receive {
            peer,
            channel: channel.into(),
            data,
            reliable: true,
        }
    }

    fn subscribe(api: &mut MultiplayerApi) -> mpsc::UnboundedReceiver<MultiplayerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        api.events_tx = tx;
        rx
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<MultiplayerEvent>) -> Vec<MultiplayerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_server_gossips_membership() {
        let (mut api, mut link) = server();
        let mut rx = subscribe(&mut api);

        let _ = api.handle_transport_event(TransportEvent::Connect { peer: 2 });
        assert!(sent(&mut link).is_empty());

        let _ = api.handle_transport_event(TransportEvent::Connect { peer: 3 });
        assert_eq!(
            sent(&mut link),
            vec![
                control_to(3, packet::encode_peer_notice(SystemMessage::AddPeer, 2)),
                control_to(2, packet::encode_peer_notice(SystemMessage::AddPeer, 3)),
            ]
        );

        let _ = api.handle_transport_event(TransportEvent::Disconnect { peer: 2 });
        assert_eq!(
            sent(&mut link),
            vec![control_to(3, packet::encode_peer_notice(SystemMessage::RemovePeer, 2))]
        );
        assert_eq!(api.connected_peers().iter().copied().collect::<Vec<_>>(), vec![3]);
        assert!(!api.path_cache().has_peer(2));

        assert_eq!(
            events(&mut rx),
            vec![
                MultiplayerEvent::PeerConnected(2),
                MultiplayerEvent::PeerConnected(3),
                MultiplayerEvent::PeerDisconnected(2),
            ]
        );
    }

    #[test]
    fn test_no_gossip_without_relay() {
        let (mut api, mut link) = server_with(MultiplayerConfig::default().with_server_relay(false));
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: 2 });
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: 3 });
        assert!(sent(&mut link).is_empty());
    }

    #[test]
    fn test_server_relays_broadcast_and_delivers_locally() {
        let (mut api, mut link) = server();
        let mut rx = subscribe(&mut api);
        for peer in [2, 3, 4] {
            let _ = api.handle_transport_event(TransportEvent::Connect { peer });
        }
        sent(&mut link);
        events(&mut rx);

        let packet = PacketHeader::new(2, RoutingTarget::BROADCAST).frame(&packet::encode_raw(&[5]));
        let _ = api.handle_transport_event(receive(2, Channel::Reliable, packet.clone()));

        let forwarded: Vec<PeerId> = sent(&mut link)
            .into_iter()
            .map(|request| match request {
                Outgoing::Send { peer, channel, data, reliable } => {
                    assert_eq!(channel, 1);
                    assert!(reliable);
                    assert_eq!(data, packet);
                    peer
                }
                other => panic!("unexpected request {:?}", other),
            })
            .collect();
        assert_eq!(forwarded, vec![3, 4]);
        assert_eq!(
            events(&mut rx),
            vec![MultiplayerEvent::RawPacket { source: 2, data: vec![5] }]
        );
    }

    #[test]
    fn test_spoofed_source_dropped() {
        let (mut api, mut link) = server();
        let mut rx = subscribe(&mut api);
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: 2 });
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: 3 });
        sent(&mut link);
        events(&mut rx);

        let packet = PacketHeader::new(3, RoutingTarget::BROADCAST).frame(&packet::encode_raw(&[1]));
        let _ = api.handle_transport_event(receive(2, Channel::Reliable, packet));
        assert!(sent(&mut link).is_empty());
        assert!(events(&mut rx).is_empty());
    }

    #[test]
    fn test_relay_disabled_drops_peer_traffic() {
        let (mut api, mut link) = server_with(MultiplayerConfig::default().with_server_relay(false));
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: 2 });
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: 3 });

        let packet = PacketHeader::new(2, RoutingTarget::peer(3)).frame(&packet::encode_raw(&[1]));
        let _ = api.handle_transport_event(receive(2, Channel::Reliable, packet));
        assert!(sent(&mut link).is_empty());
    }

    #[test]
    fn test_client_path_handshake() {
        let (mut api, mut link) = client(5);
        let mut rx = subscribe(&mut api);
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: SERVER_PEER_ID });
        assert_eq!(
            events(&mut rx),
            vec![
                MultiplayerEvent::ConnectionSucceeded,
                MultiplayerEvent::PeerConnected(SERVER_PEER_ID)
            ]
        );

        let rpc = || ApiCommand::Rpc {
            path: "/Game".into(),
            target: RoutingTarget::SERVER,
            name: "ping".into(),
            args: vec![Variant::Int(1)],
            reliable: true,
        };
        let _ = api.handle_command(rpc());

        let requests = sent(&mut link);
        assert_eq!(requests.len(), 2);
        let simplify = packet::encode_path_control(
            PacketHeader::new(5, RoutingTarget::SERVER),
            &packet::encode_simplify_path(1, "/root/Game"),
        );
        assert_eq!(requests[0], control_to(SERVER_PEER_ID, simplify));
        match &requests[1] {
            Outgoing::Send { peer, channel, data, .. } => {
                assert_eq!(*peer, SERVER_PEER_ID);
                assert_eq!(*channel, 1);
                let (header, payload) = PacketHeader::decode(data).unwrap();
                assert_eq!(header, PacketHeader::new(5, RoutingTarget::SERVER));
                let call = decode_call(payload).unwrap();
                assert_eq!(call.address, NodeAddress::Literal("/root/Game".into()));
                assert_eq!(call.name, "ping");
            }
            other => panic!("unexpected request {:?}", other),
        }

        // Not confirmed yet: still literal, and no second SimplifyPath.
        let _ = api.handle_command(rpc());
        let requests = sent(&mut link);
        assert_eq!(requests.len(), 1);

        let confirm = packet::encode_path_control(
            PacketHeader::new(SERVER_PEER_ID, RoutingTarget::peer(5)),
            &packet::encode_confirm_path("/root/Game"),
        );
        let _ = api.handle_transport_event(receive(SERVER_PEER_ID, Channel::Config, confirm));
        assert!(api.path_cache().is_confirmed("/root/Game", SERVER_PEER_ID));

        let _ = api.handle_command(rpc());
        let requests = sent(&mut link);
        assert_eq!(requests.len(), 1);
        match &requests[0] {
            Outgoing::Send { data, .. } => {
                let (_, payload) = PacketHeader::decode(data).unwrap();
                assert_eq!(decode_call(payload).unwrap().address, NodeAddress::Cached(1));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    fn call_address(request: &Outgoing) -> NodeAddress {
        match request {
            Outgoing::Send { peer, channel, data, .. } => {
                assert_eq!(*peer, SERVER_PEER_ID);
                assert_eq!(*channel, 1);
                let (_, payload) = PacketHeader::decode(data).unwrap();
                decode_call(payload).unwrap().address
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_minus_one_waits_for_server_confirmation() {
        let (mut api, mut link) = client(5);
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: SERVER_PEER_ID });
        let add = packet::encode_peer_notice(SystemMessage::AddPeer, 7);
        let _ = api.handle_transport_event(receive(SERVER_PEER_ID, Channel::Config, add));

        let rpc = || ApiCommand::Rpc {
            path: "/root/Game".into(),
            target: RoutingTarget(-1),
            name: "ping".into(),
            args: vec![],
            reliable: true,
        };
        let _ = api.handle_command(rpc());

        // The server delivers -1 locally, so it is offered the path too.
        let requests = sent(&mut link);
        assert_eq!(requests.len(), 3);
        for (request, dest) in requests.iter().zip([SERVER_PEER_ID, 7]) {
            let simplify = packet::encode_path_control(
                PacketHeader::new(5, RoutingTarget::peer(dest)),
                &packet::encode_simplify_path(1, "/root/Game"),
            );
            assert_eq!(*request, control_to(SERVER_PEER_ID, simplify));
        }
        assert_eq!(call_address(&requests[2]), NodeAddress::Literal("/root/Game".into()));

        let confirm_from = |peer: PeerId| {
            packet::encode_path_control(
                PacketHeader::new(peer, RoutingTarget::peer(5)),
                &packet::encode_confirm_path("/root/Game"),
            )
        };
        let _ = api.handle_transport_event(receive(SERVER_PEER_ID, Channel::Config, confirm_from(7)));
        let _ = api.handle_command(rpc());
        let requests = sent(&mut link);
        assert_eq!(requests.len(), 1);
        assert_eq!(call_address(&requests[0]), NodeAddress::Literal("/root/Game".into()));

        let _ = api.handle_transport_event(receive(
            SERVER_PEER_ID,
            Channel::Config,
            confirm_from(SERVER_PEER_ID),
        ));
        let _ = api.handle_command(rpc());
        let requests = sent(&mut link);
        assert_eq!(requests.len(), 1);
        assert_eq!(call_address(&requests[0]), NodeAddress::Cached(1));
    }

    #[test]
    fn test_unanswered_simplify_is_offered_again() {
        let (host, mut link) = host_pair(Role::Client, 5, 16);
        let config = MultiplayerConfig {
            path_reoffer_interval: Duration::ZERO,
            ..MultiplayerConfig::default()
        };
        let mut api = MultiplayerApi::new(host, SceneTree::new(), config);
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: SERVER_PEER_ID });

        let simplify = packet::encode_path_control(
            PacketHeader::new(5, RoutingTarget::SERVER),
            &packet::encode_simplify_path(1, "/root/Game"),
        );
        for _ in 0..2 {
            let _ = api.handle_command(ApiCommand::Rpc {
                path: "/root/Game".into(),
                target: RoutingTarget::SERVER,
                name: "ping".into(),
                args: vec![],
                reliable: true,
            });
            let requests = sent(&mut link);
            assert_eq!(requests.len(), 2);
            assert_eq!(requests[0], control_to(SERVER_PEER_ID, simplify.clone()));
        }
    }

    #[test]
    fn test_too_many_arguments_rejected() {
        let (mut api, mut link) = client(5);
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: SERVER_PEER_ID });

        let args = vec![Variant::Int(0); MAX_ARGUMENTS + 1];
        let err = api
            .handle()
            .send_rpc("/root/Game", RoutingTarget::SERVER, "ping", args.clone(), true)
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol(ProtocolError::TooManyArguments(256))));

        let flow = api.handle_command(ApiCommand::Rpc {
            path: "/root/Game".into(),
            target: RoutingTarget::SERVER,
            name: "ping".into(),
            args,
            reliable: true,
        });
        assert!(flow.is_continue());
        assert!(sent(&mut link).is_empty());
        assert!(api.commands_rx.try_recv().is_err());
    }

    #[test]
    fn test_server_answers_simplify_path() {
        let (mut api, mut link) = server();
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: 2 });

        let simplify = packet::encode_path_control(
            PacketHeader::new(2, RoutingTarget::SERVER),
            &packet::encode_simplify_path(4, "/root/Game"),
        );
        let _ = api.handle_transport_event(receive(2, Channel::Config, simplify));

        assert_eq!(api.path_cache().resolve_received(2, 4), Ok("/root/Game"));
        let confirm = packet::encode_path_control(
            PacketHeader::new(SERVER_PEER_ID, RoutingTarget::peer(2)),
            &packet::encode_confirm_path("/root/Game"),
        );
        assert_eq!(sent(&mut link), vec![control_to(2, confirm)]);
    }

    #[test]
    fn test_server_forwards_path_control_between_clients() {
        let (mut api, mut link) = server();
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: 2 });
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: 3 });
        sent(&mut link);

        let simplify = packet::encode_path_control(
            PacketHeader::new(2, RoutingTarget::peer(3)),
            &packet::encode_simplify_path(1, "/root/Game"),
        );
        let _ = api.handle_transport_event(receive(2, Channel::Config, simplify.clone()));
        assert_eq!(sent(&mut link), vec![control_to(3, simplify)]);
        assert!(api.path_cache().resolve_received(2, 1).is_err());
    }

    #[test]
    fn test_client_applies_gossip() {
        let (mut api, _link) = client(5);
        let mut rx = subscribe(&mut api);
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: SERVER_PEER_ID });
        events(&mut rx);

        let add = packet::encode_peer_notice(SystemMessage::AddPeer, 7);
        let _ = api.handle_transport_event(receive(SERVER_PEER_ID, Channel::Config, add));
        let own = packet::encode_peer_notice(SystemMessage::AddPeer, 5);
        let _ = api.handle_transport_event(receive(SERVER_PEER_ID, Channel::Config, own));
        assert_eq!(
            api.connected_peers().iter().copied().collect::<Vec<_>>(),
            vec![SERVER_PEER_ID, 7]
        );

        let remove = packet::encode_peer_notice(SystemMessage::RemovePeer, 7);
        let _ = api.handle_transport_event(receive(SERVER_PEER_ID, Channel::Config, remove));
        assert_eq!(
            events(&mut rx),
            vec![MultiplayerEvent::PeerConnected(7), MultiplayerEvent::PeerDisconnected(7)]
        );
    }

    #[test]
    fn test_client_stops_when_server_leaves() {
        let (mut api, _link) = client(5);
        let mut rx = subscribe(&mut api);
        let _ = api.handle_transport_event(TransportEvent::Connect { peer: SERVER_PEER_ID });
        events(&mut rx);

        let flow = api.handle_transport_event(TransportEvent::Disconnect { peer: SERVER_PEER_ID });
        assert!(flow.is_break());
        assert!(api.connected_peers().is_empty());
        assert_eq!(
            events(&mut rx),
            vec![
                MultiplayerEvent::PeerDisconnected(SERVER_PEER_ID),
                MultiplayerEvent::ServerDisconnected
            ]
        );
    }

    #[test]
    fn test_connection_failure_stops() {
        let (mut api, _link) = client(5);
        let mut rx = subscribe(&mut api);
        let flow = api.handle_transport_event(TransportEvent::ConnectionFailed {
            reason: "refused".into(),
        });
        assert!(flow.is_break());
        assert_eq!(
            events(&mut rx),
            vec![MultiplayerEvent::ConnectionFailed("refused".into())]
        );
    }

    #[tokio::test]
    async fn test_run_dispatches_and_shuts_down() {
        let (host, mut link) = host_pair(Role::Server, SERVER_PEER_ID, 16);
        let config = MultiplayerConfig {
            poll_timeout: Duration::from_millis(10),
            ..MultiplayerConfig::default()
        };
        let api = MultiplayerApi::new(host, SceneTree::new(), config);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        api.register_method(
            "/root/Game",
            "ping",
            dynamic_method(move |ctx, args| {
                seen.lock().unwrap().push((ctx.source, args));
                ctx.multiplayer
                    .send_rpc("/root/Game", RoutingTarget::peer(ctx.source), "pong", vec![], true)
            }),
        )
        .unwrap();
        let handle = api.handle();
        let task = tokio::spawn(api.run());

        link.events.send(TransportEvent::Connect { peer: 2 }).await.unwrap();
        let mut args = Vec::new();
        encode_arguments(&[Variant::Int(7)], &mut args).unwrap();
        let payload = packet::encode_call(
            Command::RemoteCall,
            &NodeAddress::Literal("/root/Game".into()),
            "ping",
            &args,
        );
        let packet = PacketHeader::new(2, RoutingTarget::SERVER).frame(&payload);
        link.events.send(receive(2, Channel::Reliable, packet)).await.unwrap();

        // The handler's reply goes back out through the coordinator: first the
        // SimplifyPath offer, then the call itself.
        let mut replies = Vec::new();
        while replies.len() < 2 {
            let request = tokio::time::timeout(Duration::from_secs(5), link.outgoing.recv())
                .await
                .unwrap()
                .unwrap();
            replies.push(request);
        }
        assert!(matches!(replies[0], Outgoing::Send { peer: 2, channel: 0, .. }));
        assert!(matches!(replies[1], Outgoing::Send { peer: 2, channel: 1, .. }));
        assert_eq!(calls.lock().unwrap().clone(), vec![(2, vec![Variant::Int(7)])]);

        handle.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());

        let tail: Vec<Outgoing> = {
            let mut out = Vec::new();
            while let Ok(request) = link.outgoing.try_recv() {
                out.push(request);
            }
            out
        };
        assert_eq!(tail, vec![Outgoing::StopPolling, Outgoing::Close]);
    }
}
