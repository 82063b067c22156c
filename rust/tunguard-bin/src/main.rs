use std::os::unix::io::RawFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{bail, Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};
use tunguard_relay::{
    init_logging, AllowList, Blocklist, Engine, EngineConfig, EngineHandle, LogLevel,
    ProcNetResolver, TunFd,
};

/// tunguard - per-app firewall relay for a TUN device
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path; defaults apply when it does not exist
    #[arg(short, long, default_value = "tunguard.yaml")]
    config: PathBuf,

    /// Inherited TUN file descriptor
    #[arg(long, conflicts_with = "tun_socket")]
    tun_fd: Option<RawFd>,

    /// Unix datagram socket that carries tunnel packets
    #[arg(long)]
    tun_socket: Option<PathBuf>,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<LogLevel>,
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    if path.exists() {
        EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(EngineConfig::default())
    }
}

fn spawn_signal_thread(handle: EngineHandle) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new().name("signals".into()).spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("Received signal {}, shutting down", signal);
            if let Err(e) = handle.shutdown() {
                warn!("Shutdown request failed: {}", e);
            }
        }
    })?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate()?;

    if args.test_config {
        println!("Configuration test passed!");
        return Ok(());
    }

    init_logging(config.log_level)?;

    let blocklist = match &config.hosts_file {
        Some(path) => Blocklist::load(path)
            .with_context(|| format!("loading hosts file {}", path.display()))?,
        None => Blocklist::new(),
    };
    let policy = AllowList::new(config.filter, config.allowed_uids.iter().copied());
    let builder = Engine::builder()
        .config(config)
        .policy(policy)
        .uid_resolver(ProcNetResolver::new())
        .blocklist(blocklist);

    let mut engine = match (args.tun_fd, &args.tun_socket) {
        (Some(fd), _) => {
            // SAFETY: the descriptor is handed to this process for its exclusive use.
            let tun = unsafe { TunFd::from_raw_fd(fd) }.context("adopting TUN descriptor")?;
            builder.build(tun)?
        }
        (None, Some(path)) => {
            let socket = UnixDatagram::unbound()?;
            socket
                .connect(path)
                .with_context(|| format!("connecting to {}", path.display()))?;
            socket.set_nonblocking(true)?;
            builder.build(mio::net::UnixDatagram::from_std(socket))?
        }
        (None, None) => bail!("no tunnel given, pass --tun-fd or --tun-socket"),
    };

    spawn_signal_thread(engine.handle())?;
    engine.run()?;

    let stats = engine.stats().snapshot();
    info!(
        "tunguard stopped after {:?}: {} packets in, {} out, {} tcp / {} udp sessions, {} denied",
        stats.uptime,
        stats.packets_received,
        stats.packets_sent,
        stats.tcp_sessions_total,
        stats.udp_sessions_total,
        stats.policy_denied
    );
    Ok(())
}
