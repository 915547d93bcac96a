//! Robot debug link - command line client
//!
//! Discovers robots, optionally connects to one and streams its images,
//! and prints every link event until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use robodbg::json_output::{output_event, EventLine};
use robodbg::{DebugLink, Event, LinkConfig, LinkContext, Topic};
use std::net::IpAddr;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config/default_config.yaml";

#[derive(Parser)]
#[command(name = "robodbg")]
#[command(about = "Robot debug link - discovery, connection and telemetry monitor")]
#[command(version)]
struct Args {
    /// Path to the link configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Additional robot address to probe (repeatable)
    #[arg(short, long = "search-ip")]
    search_ip: Vec<IpAddr>,

    /// Robot to connect to once it is found
    #[arg(long)]
    connect: Option<String>,

    /// Stream camera images from the connected robot
    #[arg(long, requires = "connect")]
    images: bool,

    /// Print events as JSON lines on stdout
    #[arg(long)]
    json: bool,
}

impl Args {
    fn get_config_path(&self) -> Option<String> {
        self.config
            .clone()
            .or_else(|| std::env::var("DEFAULT_CONFIG_PATH").ok())
            .or_else(|| Path::new(DEFAULT_CONFIG_PATH).exists().then(|| DEFAULT_CONFIG_PATH.to_string()))
    }
}

const PRINTED_TOPICS: &[Topic] = &[
    Topic::Found,
    Topic::Lost,
    Topic::Connected,
    Topic::Disconnected,
    Topic::SymbolNames,
    Topic::SymbolValues,
    Topic::BlackboardsSaved,
    Topic::Image,
    Topic::ImageStreamClosed,
    Topic::SplMessage,
];

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    // Banner
    info!("Robot Debug Link");
    info!("{}", "=".repeat(50));

    let mut config = match args.get_config_path() {
        Some(path) => {
            info!("Using config: {}", path);
            LinkConfig::load_from_path(&path).with_context(|| format!("Failed to load {}", path))?
        }
        None => {
            info!("Using built-in defaults");
            LinkConfig::default()
        }
    };
    config
        .discovery
        .search_ips
        .extend(args.search_ip.iter().map(IpAddr::to_string));

    let mut link = DebugLink::new(config).context("Failed to create debug link")?;
    info!("Listening on {}", link.local_addr()?);

    let json = args.json;
    link.subscribe("printer", PRINTED_TOPICS, move |event, _ctx| {
        print_event(event, json);
        Ok(())
    })?;

    if args.images {
        link.subscribe("images", &[Topic::Connected], |_event, ctx: &mut LinkContext| {
            ctx.arbiter.recv_images()
        })?;
    }

    let mut running = link.start().context("Failed to start debug link")?;
    if let Some(robot) = &args.connect {
        info!("Waiting for {}", robot);
        running.handle().connect(robot)?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Performing graceful shutdown");
    running.shutdown();
    info!("Shutdown complete");
    Ok(())
}

fn print_event(event: &Event, json: bool) {
    if json {
        output_event(&EventLine::from_event(event));
        return;
    }
    match event {
        Event::Found(robot) => info!("Found {} at {}", robot.name, robot.address),
        Event::Lost(robot) => info!("Lost {}", robot.name),
        Event::Connected(robot) => info!("Connected to {}", robot.name),
        Event::Disconnected(robot) => info!("Disconnected from {}", robot.name),
        Event::SymbolNames { robot, symbols } => {
            info!("{} announced {} blackboards", robot, symbols.len())
        }
        Event::SymbolValues { robot, values } => info!("{}: {}", robot, serde_json::Value::Object(values.clone())),
        Event::BlackboardsSaved { ok: true } => info!("Blackboards saved"),
        Event::BlackboardsSaved { ok: false } => error!("Saving blackboards failed"),
        Event::Image(frame) => info!(
            "Image from camera {} (tick {}, {} bytes)",
            frame.camera,
            frame.tick,
            frame.payload.len()
        ),
        Event::ImageStreamClosed { peer, .. } => info!("Image stream from {} closed", peer),
        Event::SplMessage { message, from } => info!(
            "SPL team {} player {} from {} at ({:.0}, {:.0})",
            message.team_num, message.player_num, from, message.pose[0], message.pose[1]
        ),
        other => info!("{}", EventLine::from_event(other)),
    }
}
