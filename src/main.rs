use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod console;

use console::{ConsoleInput, ConsoleTransport};
use netdiag::chat::{ChatId, Registry, Services};
use netdiag::cli::Args;
use netdiag::config::Config;
use netdiag::lookup::{HickoryDns, NameResolver, TcpWhois};
use netdiag::probe::{check_permissions, IcmpProber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_args(&args).context("Failed to load configuration")?;
    let policy = config
        .policy
        .address_policy()
        .context("Invalid address policy")?;

    if let Err(e) = check_permissions() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let chat = ChatId(args.chat);
    let transport = Arc::new(ConsoleTransport::new(chat));
    let resolver = NameResolver::new(
        Arc::new(HickoryDns::new(config.dns.timeout)),
        Arc::new(TcpWhois::new(config.whois.server, config.whois.timeout)),
        config.dns.server,
        config.lookup_cache_ttl,
    );
    let services = Arc::new(Services {
        transport: transport.clone(),
        prober: Arc::new(IcmpProber::new()),
        resolver: Arc::new(resolver),
        policy,
    });
    let registry = Arc::new(Registry::new(services));

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let sweeper = {
        let registry = registry.clone();
        let cancel = cancel.clone();
        let every = config.sweep_interval;
        tokio::spawn(async move { registry.run_sweeper(every, cancel).await })
    };

    info!(
        %chat,
        dns = %config.dns.server,
        whois = %config.whois.server,
        "Ready; type /ping, /trace or /dig"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to read console input");
                        break;
                    }
                };
                match transport.parse_line(&line) {
                    Some(ConsoleInput::Command(command)) => {
                        if registry.handle_command(command).is_none() {
                            eprintln!("Unknown command; try /ping, /trace or /dig");
                        }
                    }
                    Some(ConsoleInput::Callback(query)) => {
                        let registry = registry.clone();
                        tokio::spawn(async move { registry.handle_callback(&query).await });
                    }
                    None if line.trim().is_empty() => {}
                    None => eprintln!("Expected /command or !cancel|!retry <message>"),
                }
            }
        }
    }

    cancel.cancel();
    sweeper.await.ok();
    let retired = registry.sweep_all().await;
    info!(retired, "Shut down");
    Ok(())
}
