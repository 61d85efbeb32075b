// Single shot example
//
// Connects the bench described by a TOML file, fires one shot and prints
// the per-channel extrema of every capture.

use clap::Parser;
use marx_bench::{Bench, BenchConfig, ScopeOutcome};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fire_shot")]
#[command(version = "1.0")]
#[command(about = "Fire one Marx generator shot and capture all scopes")]
struct Args {
    /// Bench configuration file
    config: PathBuf,

    /// Run the shot on a worker thread and report progress while waiting
    #[arg(short, long)]
    background: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let config = BenchConfig::load(&args.config)?;
    let mut bench = Bench::connect(&config)?;
    println!(
        "Bench connected: {} scope(s), {} supply(ies)",
        bench.scopes().len(),
        bench.supplies().len()
    );

    let result = if args.background {
        let mut job = bench.spawn_fire()?;
        let started = std::time::Instant::now();
        let (returned, result) = loop {
            match job.try_finish() {
                Ok(finished) => break finished?,
                Err(pending) => job = pending,
            }
            println!("Waiting for shot... {:.1}s", started.elapsed().as_secs_f64());
            std::thread::sleep(std::time::Duration::from_millis(250));
        };
        bench = returned;
        result
    } else {
        bench.fire().map(|_| ())
    };

    if let Err(e) = result {
        eprintln!("Shot failed: {e}");
        bench.close()?;
        std::process::exit(1);
    }

    if let Some(outcome) = bench.last_capture() {
        println!("Shot complete in {:?}", outcome.elapsed);
        for scope in &outcome.scopes {
            match &scope.outcome {
                ScopeOutcome::Captured(capture) => {
                    for (channel, min, max) in capture.channel_extrema()? {
                        println!("  {} CH{}: {:.3} V .. {:.3} V", scope.scope, channel, min, max);
                    }
                }
                ScopeOutcome::TimedOut => println!("  {}: no trigger", scope.scope),
                ScopeOutcome::Failed(e) => println!("  {}: {}", scope.scope, e),
            }
        }
    }

    bench.close()?;
    Ok(())
}
