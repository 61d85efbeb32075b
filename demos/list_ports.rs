// Serial port discovery example
//
// Lists every serial port the OS reports so the bench configuration can be
// filled in, and optionally checks that a resource string parses.

use clap::Parser;
use marx_bench::{BenchConnector, ResourceAddress};

#[derive(Parser)]
#[command(name = "list_ports")]
#[command(version = "1.0")]
#[command(about = "List serial ports available for bench instruments")]
struct Args {
    /// Resource strings to check, e.g. TCPIP0::192.168.1.10::5555::SOCKET
    resources: Vec<String>,

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

    let ports = BenchConnector::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    } else {
        println!("Found {} serial port(s):", ports.len());
        for (i, port) in ports.iter().enumerate() {
            println!("  {}. {} ({})", i + 1, port.name, port.description);
        }
    }

    for resource in &args.resources {
        match resource.parse::<ResourceAddress>() {
            Ok(address) => println!("{resource} -> {address}"),
            Err(e) => println!("{resource}: {e}"),
        }
    }

    Ok(())
}
