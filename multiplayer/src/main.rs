use clap::Parser;
use log::{info, warn};
use multiplayer::rpc::{dynamic_method, native_factory, CallContext, NativeProcedure};
use multiplayer::{MultiplayerApi, MultiplayerConfig, RpcError, SceneTree};
use shared::{ProtocolError, RoutingTarget, StreamReader, Variant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Do not relay packets between clients
    #[arg(long)]
    no_relay: bool,

    /// Capacity of the inbound packet queue
    #[arg(short, long, default_value = "1024")]
    queue_size: usize,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "32")]
    max_clients: usize,
}

/// `/root/Chat::say(text)` echoes the line to every other peer.
struct Say {
    text: String,
}

impl NativeProcedure for Say {
    fn unmarshal(&mut self, reader: &mut StreamReader<'_>) -> Result<(), ProtocolError> {
        self.text = reader.read_string()?;
        Ok(())
    }

    fn call(self: Box<Self>, ctx: CallContext) -> Result<(), RpcError> {
        info!("[chat] peer {}: {}", ctx.source, self.text);
        ctx.multiplayer.send_rpc(
            "/root/Chat",
            RoutingTarget::all_except(ctx.source),
            "said",
            vec![Variant::Int(ctx.source as i32), Variant::from(self.text)],
            true,
        )
    }
}

fn build_tree() -> SceneTree {
    let tree = SceneTree::new();
    if let Err(e) = tree.register_native_handler("/root/Chat", "say", native_factory(|| Say { text: String::new() })) {
        warn!("Failed to register chat handler: {}", e);
    }
    if let Err(e) = tree.register_method(
        "/root/Lobby",
        "ping",
        dynamic_method(|ctx, args| {
            info!("ping from peer {} with {:?}", ctx.source, args);
            ctx.multiplayer
                .send_rpc("/root/Lobby", RoutingTarget::peer(ctx.source), "pong", args, true)
        }),
    ) {
        warn!("Failed to register lobby handler: {}", e);
    }
    tree
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = MultiplayerConfig::default()
        .with_server_relay(!args.no_relay)
        .with_packet_queue_size(args.queue_size)
        .with_max_clients(args.max_clients);

    let address = format!("{}:{}", args.host, args.port);
    info!("Starting server on {} (relay {})", address, config.server_relay);

    let mut api = MultiplayerApi::listen(&address, build_tree(), config).await?;
    let handle = api.handle();
    if let Some(mut events) = api.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                info!("{:?}", event);
            }
        });
    }

    let mut server = tokio::spawn(api.run());

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            handle.shutdown();
        }
    }

    server.await??;
    Ok(())
}
