//! # devlink
//!
//! Command line front end for the devlink host driver. Lists candidate serial ports,
//! discovers the devices behind them and streams the packets of one device to stdout.
use std::error::Error;
use std::io::{self, Write};
use std::time::Duration;

use clap::{Parser, Subcommand};
use devlink::{
    LogScope,
    registry::{self, Registry},
    serial,
    session::Session,
};
use devlink_protocol::{DEFAULT_BAUD_RATE, Packet};
use env_logger::Env;

#[derive(Subcommand, Eq, PartialEq, Clone)]
enum Command {
    /// Print the candidate USB serial ports
    List,
    /// Discover devices and print the packets of the one identifying as `whoiam`
    Run {
        whoiam: String,
        #[arg(short, long, help = "Baud rate to switch to after start", default_value_t = DEFAULT_BAUD_RATE)]
        baud: u32,
        #[arg(short, long, help = "Print packets as versioned records")]
        record: bool,
        #[arg(short, long, help = "Command to send once started, may be repeated")]
        send: Vec<String>,
        #[arg(short = 'n', long, help = "Stop after this many packets")]
        max_packets: Option<usize>,
    },
}

#[derive(Parser)]
#[command(about = "Discover microcontrollers over serial and stream their packets", long_about = None)]
struct Args {
    #[arg(short, long, help = "Address to probe instead of every USB serial port")]
    address: Vec<String>,

    #[arg(long, help = "Handshake timeout in milliseconds", default_value = "5000")]
    timeout_ms: u64,

    #[clap(subcommand)]
    command: Command,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let addresses = if args.address.is_empty() {
        serial::usb_addresses()?
    } else {
        args.address
    };
    log::debug!("Candidate addresses: {:?}", addresses);

    match args.command {
        Command::List => {
            if addresses.is_empty() {
                println!("No USB serial ports found.");
            }
            for address in addresses {
                println!("{}", address);
            }
        }
        Command::Run {
            whoiam,
            baud,
            record,
            send,
            max_packets,
        } => {
            let mut config = registry::Config {
                log: LogScope::new("devlink"),
                ..Default::default()
            };
            config.handshake.timeout = Duration::from_millis(args.timeout_ms);
            log::info!("Probing {} address(es)", addresses.len());
            let registry = Registry::discover(&addresses, serial::open, config)?;

            let mut session = Session::builder().baud_rate(baud).build(&registry, &whoiam);
            let first_packet = session.start()?;
            print_packet(&first_packet, record)?;
            for command in send {
                log::info!("Sending {:?} to '{}'", command, whoiam);
                session.write(command);
            }

            let mut received = 0;
            while registry.ok() && max_packets.is_none_or(|max| received < max) {
                let packet = session.recv();
                if packet.is_null() {
                    continue;
                }
                print_packet(&packet, record)?;
                received += 1;
            }

            registry.stop_all();
            session.join(Duration::from_secs(1));
            match session.exit_reason() {
                Some(reason) => log::info!("Session for '{}' ended: {}", whoiam, reason),
                None => log::info!("Session for '{}' ended", whoiam),
            }
            if session.violations() > 0 || session.decode_failures() > 0 {
                log::warn!(
                    "'{}' sent {} misplaced protocol packet(s) and {} undecodable line(s)",
                    whoiam,
                    session.violations(),
                    session.decode_failures()
                );
            }
        }
    }
    Ok(())
}

fn print_packet(packet: &Packet, record: bool) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    if record {
        packet.write_record(&mut stdout)
    } else {
        writeln!(stdout, "{:?}", packet)
    }
}
