//! FSM workload stress tool.
//!
//! Runs the chunk-migration workload against the deterministic in-memory
//! cluster under a named or file-loaded profile, and reports per-worker
//! outcomes.
//!
//! # Usage
//!
//! ```bash
//! # Quick sanity run
//! fsm-stress run --profile smoke
//!
//! # Reproduce a failure exactly
//! fsm-stress run --profile stress --seed 8814
//!
//! # Custom profile from a TOML file
//! fsm-stress run --profile-file custom.toml
//!
//! # List built-in profiles
//! fsm-stress profiles
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::FmtSubscriber;

use fsm_workload::profiles::{self, HarnessProfile};
use fsm_workload::sim::SimStore;
use fsm_workload::{migrate, Launcher, RunReport};

/// FSM workload stress tool.
#[derive(Parser, Debug)]
#[command(name = "fsm-stress")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the migration workload under a profile.
    Run {
        /// Built-in profile name.
        #[arg(long, default_value = "smoke", conflicts_with = "profile_file")]
        profile: String,

        /// Path to a TOML profile file.
        #[arg(long)]
        profile_file: Option<String>,

        /// Override the profile's base seed.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// List built-in profiles.
    Profiles,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install logging subscriber");
        return ExitCode::FAILURE;
    }

    match args.command {
        Command::Run {
            profile,
            profile_file,
            seed,
        } => {
            let loaded = match load(&profile, profile_file.as_deref()) {
                Ok(loaded) => loaded,
                Err(err) => {
                    eprintln!("{err}");
                    return ExitCode::FAILURE;
                }
            };
            run(&loaded, seed)
        }
        Command::Profiles => {
            for name in profiles::list_profiles() {
                let profile = profiles::load_profile(name).expect("builtin loads");
                println!("{name:<12} {}", profile.description);
            }
            ExitCode::SUCCESS
        }
    }
}

fn load(name: &str, file: Option<&str>) -> Result<HarnessProfile, profiles::ProfileError> {
    match file {
        Some(path) => HarnessProfile::from_file(path),
        None => profiles::load_profile(name),
    }
}

fn run(profile: &HarnessProfile, seed_override: Option<u64>) -> ExitCode {
    let seed = seed_override.unwrap_or(profile.workload.base_seed);
    tracing::info!(
        profile = %profile.name,
        threads = profile.workload.threads,
        iterations = profile.workload.iterations,
        seed,
        "starting run"
    );

    let store = SimStore::builder()
        .seed(seed)
        .faults(profile.fault_plan())
        .shard_count(profile.cluster.shard_count)
        .build();
    let cluster = profile.apply_to_descriptor(store.descriptor());

    let launcher = Launcher::new(Arc::new(store.clone()), cluster)
        .namespace("fsmdb", "migrate")
        .base_seed(seed)
        .docs_per_thread(profile.workload.docs_per_thread);

    let report = match launcher.run(&migrate::workload(), &[profile.overlay()]) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("run failed before workers finished: {err}");
            return ExitCode::FAILURE;
        }
    };

    print_report(&report, &store);
    if report.is_ok() {
        ExitCode::SUCCESS
    } else {
        eprintln!("run failed; reproduce with --seed {seed}");
        ExitCode::FAILURE
    }
}

fn print_report(report: &RunReport, store: &SimStore) {
    println!(
        "workers: {}  steps: {}  migrations: {}  events: {}",
        report.outcomes().len(),
        report.total_steps(),
        store.migrations(),
        store.event_count(),
    );
    for outcome in report.outcomes() {
        match (&outcome.summary, &outcome.error, &outcome.panic) {
            (Some(summary), _, _) if outcome.ok => println!(
                "  worker {:>3}: ok    steps={:<6} p50={}us p99={}us max={}us{}",
                outcome.tid,
                summary.steps,
                summary.step_latency_p50_us,
                summary.step_latency_p99_us,
                summary.step_latency_max_us,
                if summary.stopped_early {
                    "  (stopped early)"
                } else {
                    ""
                },
            ),
            (_, Some(error), _) => {
                println!("  worker {:>3}: FAIL  {error}", outcome.tid);
                if let Some(backtrace) = &outcome.backtrace {
                    println!("{backtrace}");
                }
            }
            (_, _, Some(panic)) => println!("  worker {:>3}: PANIC {panic}", outcome.tid),
            _ => println!("  worker {:>3}: FAIL  (no detail)", outcome.tid),
        }
    }
}
