// Bench monitoring example
//
// Streams HV supply status and Arduino inputs from background pollers until
// the requested duration has passed, then puts the bench into a safe state.

use clap::Parser;
use marx_bench::{Bench, BenchConfig};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "bench_monitor")]
#[command(version = "1.0")]
#[command(about = "Watch HV supplies and the Arduino I/O board")]
struct Args {
    /// Bench configuration file
    config: PathBuf,

    /// How long to monitor, in seconds
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,

    /// HV status poll interval in milliseconds
    #[arg(short, long, default_value_t = 500)]
    interval: u64,

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

    let bench = Bench::connect(&BenchConfig::load(&args.config)?)?;
    let hv = bench.hv_status_poller(Duration::from_millis(args.interval))?;
    let inputs = match bench.arduino_stream() {
        Ok(poller) => Some(poller),
        Err(e) => {
            println!("Arduino not streaming: {e}");
            None
        }
    };

    let end = Instant::now() + Duration::from_secs(args.seconds);
    while Instant::now() < end {
        if let Some(readings) = hv.recv_timeout(Duration::from_millis(args.interval * 2)) {
            for reading in readings {
                match reading.status {
                    Some(status) => println!(
                        "{}: HV {} {} V {} uA{}",
                        reading.label,
                        if status.hv_on { "ON " } else { "off" },
                        status.voltage,
                        status.current,
                        if status.fault { " FAULT" } else { "" }
                    ),
                    None => println!("{}: no reading", reading.label),
                }
            }
        }
        if let Some(snapshot) = inputs.as_ref().and_then(|p| p.latest()) {
            println!("Arduino: A={:?} D={:#06x}", snapshot.analog, snapshot.digital);
        }
    }

    hv.stop();
    drop(inputs);
    bench.close()?;
    Ok(())
}
