use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hoptrace::cli::Args;
use hoptrace::export::{export_json, generate_report};
use hoptrace::lookup::{DnsResolver, LabelCache, run_resolution_worker};
use hoptrace::state::{SessionStatus, Snapshot};
use hoptrace::{Error, TraceHandle};

/// How long the report waits for outstanding label lookups after the trace ends
const FINAL_LOOKUP_WAIT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    init_tracing(&args.log_level);

    let target = resolve_target(&args.target, args.ipv4, args.ipv6)
        .with_context(|| format!("Failed to resolve target: {}", args.target))?;
    let config = args.session_config(target).context("Invalid options")?;
    info!(%target, protocol = ?config.protocol, algorithm = ?config.algorithm, flows = config.flows, "starting trace");

    let handle = match hoptrace::start(config.clone()) {
        Ok(handle) => handle,
        Err(Error::InsufficientPrivilege(msg)) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
        Err(e) => return Err(e).context("Failed to start trace"),
    };

    // Setup Ctrl+C handler: stop sending, let outstanding probes resolve
    let stop = handle.stop_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stop.cancel();
    });

    // Label lookups run beside the trace and never gate it
    let labels = Arc::new(LabelCache::new());
    let lookup_cancel = CancellationToken::new();
    let lookup_handle = if !args.no_dns || !args.no_asn {
        let resolver = Arc::new(DnsResolver::new(!args.no_dns, !args.no_asn));
        let table = handle.table();
        Some(tokio::spawn(run_resolution_worker(
            resolver,
            move || table.snapshot(),
            labels.clone(),
            lookup_cancel.clone(),
        )))
    } else {
        None
    };

    let snapshot = run_streaming_mode(&args, handle, &labels).await?;

    if lookup_handle.is_some() {
        wait_for_labels(&snapshot, &labels).await;
    }
    lookup_cancel.cancel();
    if let Some(handle) = lookup_handle
        && let Err(e) = handle.await
    {
        warn!(error = %e, "resolution worker failed");
    }

    if args.json {
        export_json(&config, &snapshot, &labels, std::io::stdout())?;
        println!();
    } else {
        generate_report(&config, &snapshot, &labels, std::io::stdout())?;
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_target(target: &str, force_ipv4: bool, force_ipv6: bool) -> Result<IpAddr> {
    // Try parsing as IP address first
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }

    // Resolve hostname
    let addrs: Vec<_> = format!("{}:0", target)
        .to_socket_addrs()?
        .map(|s| s.ip())
        .collect();

    if addrs.is_empty() {
        anyhow::bail!("No addresses found for hostname");
    }

    // Filter by IP version if requested
    let filtered: Vec<_> = addrs
        .iter()
        .filter(|ip| {
            if force_ipv4 {
                ip.is_ipv4()
            } else if force_ipv6 {
                ip.is_ipv6()
            } else {
                true
            }
        })
        .cloned()
        .collect();

    // Prefer IPv4 by default if no preference
    if !force_ipv6
        && let Some(ipv4) = filtered.iter().find(|ip| ip.is_ipv4())
    {
        return Ok(*ipv4);
    }

    filtered
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("No {} addresses found", if force_ipv4 { "IPv4" } else { "IPv6" }))
}

/// Print each completed round until the session terminates, then return the final table
async fn run_streaming_mode(args: &Args, handle: TraceHandle, labels: &LabelCache) -> Result<Arc<Snapshot>> {
    let mut last_round = 0;
    let mut interval = tokio::time::interval(Duration::from_millis(100));

    loop {
        interval.tick().await;

        let round = handle.round_snapshot();
        if round.rounds_completed > last_round {
            last_round = round.rounds_completed;
            if !args.json {
                print_round(&round, labels);
            }
        }

        if handle.snapshot().status == SessionStatus::Terminated {
            break;
        }
    }

    let snapshot = handle.wait().await.context("Trace failed")?;
    Ok(snapshot)
}

fn print_round(snapshot: &Snapshot, labels: &LabelCache) {
    println!("Round {}", snapshot.rounds_completed);
    for flow in &snapshot.flows {
        if snapshot.flows.len() > 1 {
            println!("[flow {}]", flow.flow);
        }
        for hop in &flow.hops {
            let Some(addr) = hop.primary else {
                if hop.sent > 0 {
                    println!("TTL {:2}  *", hop.ttl);
                }
                continue;
            };
            let label = labels.get(addr);
            println!(
                "TTL {:2}  {:15}  {:20}  {:>6.2}ms  {:>5.1}% loss",
                hop.ttl,
                addr,
                label.hostname().unwrap_or(""),
                hop.rtt.mean().unwrap_or_default().as_secs_f64() * 1000.0,
                hop.loss_pct()
            );
        }
    }
    println!("---");
}

/// Give in-flight lookups a moment so the final report carries names
async fn wait_for_labels(snapshot: &Snapshot, labels: &LabelCache) {
    let deadline = tokio::time::Instant::now() + FINAL_LOOKUP_WAIT;
    while tokio::time::Instant::now() < deadline {
        if labels.missing(snapshot.addresses()).is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
