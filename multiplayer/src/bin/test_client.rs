use clap::Parser;
use log::info;
use multiplayer::rpc::dynamic_method;
use multiplayer::{MultiplayerApi, MultiplayerConfig, MultiplayerEvent, SceneTree};
use shared::{RoutingTarget, Variant};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Chat lines to send before disconnecting
    #[arg(short = 'n', long, default_value = "3")]
    count: u32,

    /// Delay between lines in milliseconds
    #[arg(short = 'd', long, default_value = "500")]
    delay: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let tree = SceneTree::new();
    tree.register_method(
        "/root/Chat",
        "said",
        dynamic_method(|_, args| {
            println!("chat: {:?}", args);
            Ok(())
        }),
    )?;
    tree.register_method(
        "/root/Lobby",
        "pong",
        dynamic_method(|ctx, args| {
            println!("pong from peer {}: {:?}", ctx.source, args);
            Ok(())
        }),
    )?;

    let mut api = MultiplayerApi::connect(&args.server, tree, MultiplayerConfig::default()).await?;
    let local_id = api.local_id();
    let handle = api.handle();
    let mut events = api.take_events().ok_or("event stream already taken")?;
    let client = tokio::spawn(api.run());

    println!("Connecting to {} as peer {}", args.server, local_id);
    loop {
        match events.recv().await {
            Some(MultiplayerEvent::ConnectionSucceeded) => break,
            Some(MultiplayerEvent::ConnectionFailed(reason)) => {
                println!("Connection failed: {}", reason);
                client.await??;
                return Ok(());
            }
            Some(event) => info!("{:?}", event),
            None => return Ok(()),
        }
    }
    println!("Connected");

    handle.send_rpc("/root/Lobby", RoutingTarget::SERVER, "ping", vec![Variant::Int(1)], true)?;

    for i in 0..args.count {
        let line = format!("hello #{} from {}", i, local_id);
        handle.send_rpc("/root/Chat", RoutingTarget::SERVER, "say", vec![Variant::from(line)], true)?;
        tokio::time::sleep(Duration::from_millis(args.delay)).await;
    }

    handle.shutdown();
    client.await??;
    println!("Disconnected");
    Ok(())
}
