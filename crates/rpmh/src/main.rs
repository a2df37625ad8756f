//! rpmh-sim: drive the RPMh stack against simulated RSC hardware
//!
//! Probes every configured channel on a simulated register file, caches a
//! set of sleep and wake votes, then issues active votes from several
//! threads and reports per-channel transfer statistics.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rayos_rpmh::config::ChannelConfig;
use rayos_rpmh::hal::sim::{CmdOutcome, SimRsc};
use rayos_rpmh::hal::{IrqHandler, RegisterBus};
use rayos_rpmh::types::MAX_CMDS_PER_TCS;
use rayos_rpmh::{ChannelId, ControllerRegistry, RpmhClient, RpmhConfig, RpmhState, TcsCmd, TcsType};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "rpmh-sim")]
#[command(about = "RayOS RPMh - TCS scheduling against a simulated RSC", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Active votes issued per voter thread
    #[arg(long, default_value_t = 32)]
    votes: usize,

    /// Concurrent voter threads per channel
    #[arg(long, default_value_t = 4)]
    voters: usize,

    /// How the simulated coprocessor finishes each TCS
    #[arg(long, value_enum, default_value_t = Outcome::Completed)]
    outcome: Outcome,

    /// Log every dispatch and completion
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Outcome {
    Completed,
    IssuedOnly,
    NotIssued,
}

impl From<Outcome> for CmdOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed => CmdOutcome::Completed,
            Outcome::IssuedOnly => CmdOutcome::IssuedOnly,
            Outcome::NotIssued => CmdOutcome::NotIssued,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match &cli.config {
        Some(path) => {
            log::info!("Loading config from: {}", path.display());
            RpmhConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => RpmhConfig::default(),
    };
    config.validate().context("invalid configuration")?;

    let mut sims: HashMap<ChannelId, Arc<SimRsc>> = HashMap::new();
    let registry = ControllerRegistry::probe_all(&config, |channel: &ChannelConfig| {
        let sim = Arc::new(SimRsc::new(
            channel.drv_id,
            channel.pooled_tcs(),
            MAX_CMDS_PER_TCS,
            channel.tcs_offset,
        ));
        sims.insert(channel.channel_id(), Arc::clone(&sim));
        sim as Arc<dyn RegisterBus>
    })
    .context("probing RSC channels")?;
    log::info!("{} RSC channel(s) up", registry.len());

    let mut responders = Vec::new();
    for id in registry.ids() {
        let (Some(ctrl), Some(sim)) = (registry.get(id), sims.get(&id)) else {
            continue;
        };
        let handler: Arc<dyn IrqHandler> = ctrl;
        responders.push(sim.spawn_responder(handler, cli.outcome.into()));
    }

    let started = Instant::now();
    for id in registry.ids() {
        let client = registry
            .client(id, config.client.clone())
            .context("channel vanished from registry")?;
        run_channel(&client, cli.votes, cli.voters)?;
    }
    let elapsed = started.elapsed();

    for responder in responders {
        responder.stop();
    }

    println!(
        "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "channel", "sent", "busy", "done", "io_err", "cached", "stray"
    );
    for id in registry.ids() {
        let Some(ctrl) = registry.get(id) else {
            continue;
        };
        let stats = ctrl.stats();
        println!(
            "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
            ctrl.name(),
            stats.triggered,
            stats.busy_rejections,
            stats.completed,
            stats.io_errors,
            stats.cached_writes,
            stats.stray_irqs
        );
        if let Some(sim) = sims.get(&id) {
            if sim.violations() > 0 {
                log::warn!("{}: {} hardware protocol violations", ctrl.name(), sim.violations());
            }
        }
    }
    println!("elapsed: {:?}", elapsed);

    registry.shutdown();
    Ok(())
}

/// Cache sleep and wake votes, then hammer the active group from `voters` threads
fn run_channel(client: &RpmhClient, votes: usize, voters: usize) -> Result<()> {
    let ctrl = client.controller();
    let groups = ctrl.groups();

    if groups.get(TcsType::Sleep).num_tcs > 0 && groups.get(TcsType::Wake).num_tcs > 0 {
        for resource in 0..4u32 {
            let addr = 0x50000 + resource * 0x10;
            client
                .write(RpmhState::Sleep, &[TcsCmd::new(addr, 0)])
                .with_context(|| format!("sleep vote for {:#x}", addr))?;
            client
                .write(RpmhState::WakeOnly, &[TcsCmd::new(addr, 3)])
                .with_context(|| format!("wake vote for {:#x}", addr))?;
        }
        log::info!(
            "{}: {} sleep / {} wake slots cached",
            ctrl.name(),
            ctrl.slots_in_use(TcsType::Sleep),
            ctrl.slots_in_use(TcsType::Wake)
        );
    }

    if groups.get(TcsType::Active).num_tcs == 0 {
        log::info!("{}: no active TCS, skipping active votes", ctrl.name());
        return Ok(());
    }

    let failures = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..voters as u32)
            .map(|voter| {
                scope.spawn(move || {
                    let mut failed = 0usize;
                    for i in 0..votes as u32 {
                        // Neighbouring voters share addresses to exercise the in-flight check.
                        let addr = 0x30000 + ((voter / 2) * 0x100) + (i % 4) * 4;
                        let cmds = [TcsCmd::new(addr, i), TcsCmd::new(addr + 0x40, i)];
                        if client.write(RpmhState::ActiveOnly, &cmds).is_err() {
                            failed += 1;
                        }
                    }
                    failed
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(votes))
            .sum::<usize>()
    });

    if failures > 0 {
        log::warn!("{}: {} active votes failed", ctrl.name(), failures);
    }
    log::info!("{}: idle after votes: {}", ctrl.name(), ctrl.is_idle());
    Ok(())
}
