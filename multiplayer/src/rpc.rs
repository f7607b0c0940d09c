//! Command dispatch: turns a received command payload into a procedure call
//! on a node, or into path cache bookkeeping.
//!
//! A node can expose two kinds of procedures under a name:
//!
//! - **native**: a factory producing a fresh [`NativeProcedure`] that pulls
//!   its own typed arguments off a [`StreamReader`]
//! - **dynamic**: a [`DynamicMethod`] receiving the decoded argument list
//!
//! When both exist, the native one wins. Procedure bodies never run on the
//! coordinator task; see [`spawn_invocation`].

use crate::error::RpcError;
use crate::network::MultiplayerHandle;
use crate::path_cache::PathCache;
use crate::tree::{Node, SceneTree};
use log::{debug, error};
use shared::packet::{self, CallPacket};
use shared::variant::decode_arguments;
use shared::{marshal, Command, NodeAddress, PeerId, ProtocolError, StreamReader, Variant};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Everything a procedure body may need about the call it serves.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub node: Arc<Node>,
    /// Peer that originated the call.
    pub source: PeerId,
    /// Lets the body send RPCs or raw packets of its own.
    pub multiplayer: MultiplayerHandle,
}

/// A typed procedure. A new instance is created for every call, fills itself
/// from the packet in `unmarshal`, then consumes itself in `call`.
pub trait NativeProcedure: Send {
    fn unmarshal(&mut self, reader: &mut StreamReader<'_>) -> Result<(), ProtocolError>;

    fn call(self: Box<Self>, ctx: CallContext) -> Result<(), RpcError>;
}

pub type NativeFactory = Arc<dyn Fn() -> Box<dyn NativeProcedure> + Send + Sync>;

pub type DynamicMethod = Arc<dyn Fn(CallContext, Vec<Variant>) -> Result<(), RpcError> + Send + Sync>;

pub fn native_factory<P, F>(make: F) -> NativeFactory
where
    P: NativeProcedure + 'static,
    F: Fn() -> P + Send + Sync + 'static,
{
    Arc::new(move || Box::new(make()) as Box<dyn NativeProcedure>)
}

pub fn dynamic_method<F>(method: F) -> DynamicMethod
where
    F: Fn(CallContext, Vec<Variant>) -> Result<(), RpcError> + Send + Sync + 'static,
{
    Arc::new(method)
}

/// What processing a command payload led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A native procedure was started.
    Native,
    /// A dynamic method was started.
    Dynamic,
    /// A SimplifyPath was recorded; `reply` is the ConfirmPath payload to
    /// send back to the source.
    PathCached { reply: Vec<u8> },
    PathConfirmed,
    Raw(Vec<u8>),
}

/// Runs `body` on the blocking pool under a supervisor task that logs
/// failures and panics, so neither can reach the coordinator.
pub fn spawn_invocation<F>(label: String, body: F) -> JoinHandle<()>
where
    F: FnOnce() -> Result<(), RpcError> + Send + 'static,
{
    let worker = tokio::task::spawn_blocking(body);
    tokio::spawn(async move {
        match worker.await {
            Ok(Ok(())) => debug!("{} completed", label),
            Ok(Err(e)) => error!("{} failed: {}", label, e),
            Err(e) if e.is_panic() => error!("{} panicked", label),
            Err(e) => error!("{} was cancelled: {}", label, e),
        }
    })
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    tree: SceneTree,
    multiplayer: MultiplayerHandle,
}

impl Dispatcher {
    pub fn new(tree: SceneTree, multiplayer: MultiplayerHandle) -> Self {
        Self { tree, multiplayer }
    }

    pub fn tree(&self) -> &SceneTree {
        &self.tree
    }

    /// Processes one command payload (the part after the routing header)
    /// sent by `source`.
    pub fn process_packet(
        &self,
        cache: &mut PathCache,
        source: PeerId,
        payload: &[u8],
    ) -> Result<Dispatch, RpcError> {
        let (byte, rest) = marshal::decode_u8(payload)?;
        match Command::try_from(byte)? {
            Command::RemoteCall | Command::RemoteSet => {
                let call = packet::decode_call(payload)?;
                self.process_call(cache, source, call)
            }
            Command::SimplifyPath => {
                let (id, path) = packet::decode_simplify_path(rest)?;
                let reply = packet::encode_confirm_path(&path);
                cache.record_received(source, id, path);
                Ok(Dispatch::PathCached { reply })
            }
            Command::ConfirmPath => {
                let path = packet::decode_confirm_path(rest)?;
                cache.mark_confirmed(&path, source)?;
                debug!("Peer {} confirmed {:?}", source, path);
                Ok(Dispatch::PathConfirmed)
            }
            Command::Raw => Ok(Dispatch::Raw(rest.to_vec())),
        }
    }

    /// Interprets the 32-bit addressed-target field of `payload` and finds
    /// the node it names.
    pub fn resolve_addressed(
        &self,
        cache: &PathCache,
        source: PeerId,
        field: u32,
        payload: &[u8],
    ) -> Result<Arc<Node>, ProtocolError> {
        let (address, _) = NodeAddress::from_field(field, payload)?;
        self.resolve(cache, source, &address)
    }

    pub fn resolve(&self, cache: &PathCache, source: PeerId, address: &NodeAddress) -> Result<Arc<Node>, ProtocolError> {
        let path = match address {
            NodeAddress::Cached(id) => cache.resolve_received(source, *id)?,
            NodeAddress::Literal(path) => path.as_str(),
        };
        self.tree
            .get_node(path)
            .ok_or_else(|| ProtocolError::NodeNotFound(path.to_owned()))
    }

    fn process_call(&self, cache: &PathCache, source: PeerId, call: CallPacket<'_>) -> Result<Dispatch, RpcError> {
        let node = self.resolve(cache, source, &call.address)?;

        if call.command == Command::RemoteSet {
            return Err(RpcError::NotImplemented("remote property assignment"));
        }

        let label = format!("{}::{} from peer {}", node.path(), call.name, source);

        if let Some(factory) = node.native(&call.name) {
            let mut procedure = factory();
            let mut reader = StreamReader::new(call.args)?;
            procedure.unmarshal(&mut reader)?;
            let ctx = self.context(node, source);
            spawn_invocation(label, move || procedure.call(ctx));
            return Ok(Dispatch::Native);
        }

        if let Some(method) = node.method(&call.name) {
            let args = decode_arguments(call.args)?;
            let ctx = self.context(node, source);
            spawn_invocation(label, move || method(ctx, args));
            return Ok(Dispatch::Dynamic);
        }

        Err(RpcError::UnknownProcedure {
            path: node.path(),
            name: call.name,
        })
    }

    fn context(&self, node: Arc<Node>, source: PeerId) -> CallContext {
        CallContext {
            node,
            source,
            multiplayer: self.multiplayer.clone(),
        }
    }
}
