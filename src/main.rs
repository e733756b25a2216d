#![warn(missing_docs)]
#![warn(unsafe_code)]
//! Serve Commodore filesystem requests from a host device.
//! Usage: cbmfs [OPTIONS] [RUN_DIRECTORY]
//!
use std::io::{Read, Write};
use std::process::exit;

use clap::Parser;
use config::Config;
use log::{error, info};

use cbmfs::config::Configuration;
use cbmfs::dispatch::{dispatch, ServerContext};
use cbmfs::wire::packet_parser;

/// Command line arguments for the file server
#[derive(Parser, Debug)]
#[clap(about, version, author)]
struct Args {
    /// Directory assigned to drive 0 unless -A says otherwise
    run_directory: Option<String>,

    /// Assign a drive at startup, DRIVE=[PROVIDER:]PATH
    #[clap(short = 'A', long = "assign")]
    assign: Vec<String>,

    /// Device or socket path carrying the packet stream;
    /// stdin/stdout when absent
    #[clap(short, long)]
    device: Option<String>,

    /// Enable 1581-style advanced wildcards
    #[clap(short = 'w', long)]
    advanced_wildcards: bool,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

/// Parse a `-A` argument of the shape `DRIVE=[PROVIDER:]PATH`.
fn parse_assign(arg: &str) -> Option<(u8, &str)> {
    let (drive, spec) = arg.split_once('=')?;
    let drive: u8 = drive.parse().ok()?;
    if drive > 15 || spec.is_empty() {
        return None;
    }
    Some((drive, spec))
}

/// Serve packets from a byte stream until it ends.
fn serve<S: Read + Write>(ctx: &mut ServerContext, mut stream: S) -> std::io::Result<()> {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 512];

    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..n]);

        loop {
            let (rest, packet) = match packet_parser(&pending) {
                Ok(parsed) => parsed,
                Err(nom::Err::Incomplete(_)) => break,
                Err(_) => break,
            };
            let consumed = pending.len() - rest.len();
            pending.drain(..consumed);

            if let Some(reply) = dispatch(ctx, &packet) {
                stream.write_all(&reply.to_wire())?;
                stream.flush()?;
            }
        }
    }
}

/// Run the file server
fn main() {
    let args = Args::parse();

    if let Err(e) = env_logger::try_init() {
        panic!("couldn't initialize logger: {:?}", e);
    }

    cbmfs::init();

    let settings_result = load_settings("config/cbmfs.toml");
    let mut settings = match settings_result {
        Ok(settings) => settings,
        Err(e) => {
            info!("no config file loaded: {:?}", e);
            Config::default()
        }
    };
    if args.advanced_wildcards {
        #[allow(deprecated)]
        settings.set("advanced-wildcards", true).unwrap();
    }

    let cfg = match cbmfs::config::Config::load(settings) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("error loading config: {}", e);
            exit(1);
        }
    };

    let mut ctx = ServerContext::new(cfg);

    if let Some(dir) = &args.run_directory {
        if let Err(e) = ctx.assign_spec(0, dir) {
            error!("cannot assign drive 0 to {}: {}", dir, e);
            exit(1);
        }
    }
    for assign in &args.assign {
        match parse_assign(assign) {
            Some((drive, spec)) => {
                if let Err(e) = ctx.assign_spec(drive, spec) {
                    error!("cannot assign drive {} to {}: {}", drive, spec, e);
                    exit(1);
                }
            }
            None => {
                error!("invalid assign argument: {}", assign);
                exit(1);
            }
        }
    }

    let result = match &args.device {
        Some(path) => {
            info!("serving from device {}", path);
            match std::fs::OpenOptions::new().read(true).write(true).open(path) {
                Ok(dev) => serve(&mut ctx, dev),
                Err(e) => {
                    error!("cannot open device {}: {}", path, e);
                    exit(1);
                }
            }
        }
        None => {
            info!("serving from stdin/stdout");
            serve(&mut ctx, StdStream)
        }
    };

    if let Err(e) = result {
        error!("transport error: {}", e);
        exit(1);
    }
}

/// stdin/stdout as one read/write stream
struct StdStream;

impl Read for StdStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::stdin().read(buf)
    }
}

impl Write for StdStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stdout().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()
    }
}

/// load settings from a config file
/// returns the config settings as a Config on success, or a ConfigError on failure
fn load_settings(config_name: &str) -> Result<Config, config::ConfigError> {
    Config::builder()
        .add_source(config::File::with_name(config_name))
        .add_source(config::Environment::with_prefix("CBMFS"))
        .build()
}
