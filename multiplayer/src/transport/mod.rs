//! Boundary between the coordinator and whatever moves bytes between peers.
//!
//! A transport runs its own tasks and talks to the coordinator through two
//! queues: a bounded queue of [`TransportEvent`]s flowing in (so a slow
//! coordinator throttles the socket reader instead of growing memory), and
//! an unbounded queue of [`Outgoing`] requests flowing out.

pub mod peer_table;
pub mod udp;

use crate::error::RpcError;
use shared::{Channel, PeerId};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Something that happened on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect {
        peer: PeerId,
    },
    Disconnect {
        peer: PeerId,
    },
    Receive {
        peer: PeerId,
        channel: u8,
        data: Vec<u8>,
        reliable: bool,
    },
    /// A client could not reach or was refused by the server.
    ConnectionFailed {
        reason: String,
    },
}

/// A request from the coordinator to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Send {
        peer: PeerId,
        channel: u8,
        data: Vec<u8>,
        reliable: bool,
    },
    Broadcast {
        channel: u8,
        data: Vec<u8>,
        reliable: bool,
    },
    Disconnect {
        peer: PeerId,
    },
    /// Stop reading from the wire; already queued events stay queued.
    StopPolling,
    /// Release the socket.
    Close,
}

/// Coordinator-side end of a transport.
#[derive(Debug)]
pub struct Host {
    role: Role,
    local_id: PeerId,
    local_addr: Option<SocketAddr>,
    events: mpsc::Receiver<TransportEvent>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

/// Transport-side end of a transport.
#[derive(Debug)]
pub struct HostLink {
    pub events: mpsc::Sender<TransportEvent>,
    pub outgoing: mpsc::UnboundedReceiver<Outgoing>,
}

/// Creates a connected `Host`/`HostLink` pair. The event queue holds at most
/// `capacity` undelivered events.
pub fn host_pair(role: Role, local_id: PeerId, capacity: usize) -> (Host, HostLink) {
    let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    (
        Host {
            role,
            local_id,
            local_addr: None,
            events: events_rx,
            outgoing: outgoing_tx,
        },
        HostLink {
            events: events_tx,
            outgoing: outgoing_rx,
        },
    )
}

impl Host {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Socket address the transport is bound to, if it has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Waits up to `timeout` for the next event. `Ok(None)` means nothing
    /// arrived in time; an error means the transport has gone away.
    pub async fn poll_event(&mut self, timeout: Duration) -> Result<Option<TransportEvent>, RpcError> {
        match tokio::time::timeout(timeout, self.events.recv()).await {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => Err(RpcError::Transport("event queue closed".into())),
            Err(_) => Ok(None),
        }
    }

    fn request(&self, request: Outgoing) -> Result<(), RpcError> {
        self.outgoing
            .send(request)
            .map_err(|_| RpcError::Transport("transport task is gone".into()))
    }

    pub fn send(&self, peer: PeerId, channel: Channel, data: Vec<u8>, reliable: bool) -> Result<(), RpcError> {
        self.request(Outgoing::Send {
            peer,
            channel: channel.into(),
            data,
            reliable,
        })
    }

    pub fn broadcast(&self, channel: Channel, data: Vec<u8>, reliable: bool) -> Result<(), RpcError> {
        self.request(Outgoing::Broadcast {
            channel: channel.into(),
            data,
            reliable,
        })
    }

    pub fn disconnect(&self, peer: PeerId) -> Result<(), RpcError> {
        self.request(Outgoing::Disconnect { peer })
    }

    pub fn stop_polling(&self) {
        // The transport may already be gone, which is what we want anyway.
        let _ = self.request(Outgoing::StopPolling);
    }

    pub fn close(&self) {
        let _ = self.request(Outgoing::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_poll_times_out_quietly() {
        let (mut host, _link) = host_pair(Role::Server, 1, 4);
        let event = tokio_test::block_on(host.poll_event(Duration::from_millis(10)));
        assert_eq!(assert_ok!(event), None);
    }

    #[tokio::test]
    async fn test_poll_reports_closed_transport() {
        let (mut host, link) = host_pair(Role::Client, 7, 4);
        drop(link);
        assert_err!(host.poll_event(Duration::from_millis(10)).await);
        assert_err!(host.send(1, Channel::Reliable, vec![1], true));
    }

    #[tokio::test]
    async fn test_requests_reach_the_link() {
        let (host, mut link) = host_pair(Role::Server, 1, 4);
        assert_ok!(host.send(5, Channel::Unreliable, vec![9], false));
        assert_ok!(host.broadcast(Channel::Config, vec![1, 2], true));

        assert_eq!(
            link.outgoing.recv().await,
            Some(Outgoing::Send {
                peer: 5,
                channel: 2,
                data: vec![9],
                reliable: false
            })
        );
        assert_eq!(
            link.outgoing.recv().await,
            Some(Outgoing::Broadcast {
                channel: 0,
                data: vec![1, 2],
                reliable: true
            })
        );
    }

    #[tokio::test]
    async fn test_event_queue_is_bounded() {
        let (_host, link) = host_pair(Role::Server, 1, 1);
        link.events
            .try_send(TransportEvent::Connect { peer: 2 })
            .unwrap();
        assert!(link
            .events
            .try_send(TransportEvent::Connect { peer: 3 })
            .is_err());
    }
}
