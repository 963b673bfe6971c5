// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! NTPspy command-line entry point: data tunneling over NTP.
//!
//! One binary, two roles. `-s <path>` runs the server, reassembling
//! transfers under a storage root; otherwise the positional
//! `host[:port]` selects client mode, sending the named files (or piped
//! stdin) to the peer. Both sides must share the same magic number.
//!
//! Exit codes: 0 success, 1 usage error, 2 network/timeout, 3 checksum
//! mismatch on at least one file, 4 local I/O error.

use clap::Parser;
use log::{error, info, warn};
use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use ntpspy_client::{ClientError, NtpSpyClient};
use ntpspy_proto::Magic;
use ntpspy_server::{FileStore, NtpSpyServer};

const DEFAULT_PORT: u16 = 123;

const EXIT_USAGE: u8 = 1;
const EXIT_NETWORK: u8 = 2;
const EXIT_CHECKSUM: u8 = 3;
const EXIT_LOCAL_IO: u8 = 4;

/// NTPspy — covert file transfer inside NTP datagrams.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server mode: storage root for received files.
    #[clap(short = 's', long = "server", value_name = "PATH")]
    server: Option<PathBuf>,

    /// Overwrite existing files on name collision (server only;
    /// default appends -1, -2, ... before the extension).
    #[clap(short = 'o', long)]
    overwrite: bool,

    /// UDP port (client and server).
    #[clap(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Magic number (hex, 1-FFFFFFFF); must match on both sides.
    #[clap(short = 'm', long, value_parser = parse_magic, default_value = "deadbeef")]
    magic: Magic,

    /// Minimum interval between datagrams, in seconds (client only).
    #[clap(short = 't', long = "time", value_name = "SECONDS", default_value_t = 0)]
    time: u64,

    /// Query server version and exit (client only).
    #[clap(short = 'q', long)]
    query: bool,

    /// Verbose mode (repeatable).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Remote host[:port] (client only).
    remote: Option<String>,

    /// Files to transfer; none reads piped stdin (client only).
    files: Vec<PathBuf>,
}

fn parse_magic(s: &str) -> Result<Magic, String> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    let value =
        u32::from_str_radix(hex, 16).map_err(|_| format!("not a 32-bit hex value: {s:?}"))?;
    Magic::new(value).ok_or_else(|| "magic must be non-zero".to_owned())
}

/// Expand `host[:port]` into a resolvable `host:port`, handling bare and
/// bracketed IPv6 addresses.
fn peer_spec(remote: &str, default_port: u16) -> Result<String, String> {
    if remote.starts_with('[') {
        return Ok(if remote.contains("]:") {
            remote.to_owned()
        } else {
            format!("{remote}:{default_port}")
        });
    }
    match remote.rsplit_once(':') {
        // Bare IPv6 address: more than one colon, no brackets.
        Some((host, _)) if host.contains(':') => Ok(format!("[{remote}]:{default_port}")),
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| format!("invalid port: {port:?}"))?;
            Ok(format!("{host}:{port}"))
        }
        None => Ok(format!("{remote}:{default_port}")),
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let failed = e.use_stderr();
            let _ = e.print();
            return ExitCode::from(if failed { EXIT_USAGE } else { 0 });
        }
    };

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::from(EXIT_LOCAL_IO);
        }
    };
    ExitCode::from(runtime.block_on(run(args)))
}

async fn run(args: Args) -> u8 {
    if let Some(root) = &args.server {
        if args.remote.is_some() || !args.files.is_empty() {
            error!("server mode does not accept a remote host or filenames");
            return EXIT_USAGE;
        }
        run_server(root.clone(), &args).await
    } else if let Some(remote) = &args.remote {
        match peer_spec(remote, args.port) {
            Ok(peer) => run_client(peer, args).await,
            Err(e) => {
                error!("{e}");
                EXIT_USAGE
            }
        }
    } else {
        error!("remote host required in client mode (or -s <path> for server mode)");
        EXIT_USAGE
    }
}

async fn run_server(root: PathBuf, args: &Args) -> u8 {
    let store = match FileStore::new(root.clone(), args.overwrite) {
        Ok(store) => store,
        Err(e) => {
            error!("cannot use storage root {}: {e}", root.display());
            return EXIT_LOCAL_IO;
        }
    };
    let server = match NtpSpyServer::builder(store)
        .listen(format!("0.0.0.0:{}", args.port))
        .magic(args.magic)
        .build()
        .await
    {
        Ok(server) => server,
        Err(e) => {
            error!("failed to bind port {}: {e}", args.port);
            return EXIT_NETWORK;
        }
    };
    info!(
        "server ready on port {} (magic {}), storing under {}",
        args.port,
        args.magic,
        root.display()
    );

    tokio::select! {
        result = server.run() => match result {
            Ok(()) => 0,
            Err(e) => {
                error!("server failed: {e}");
                EXIT_NETWORK
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; temp files will be swept on next start");
            0
        }
    }
}

async fn run_client(peer: String, args: Args) -> u8 {
    let mut client = match NtpSpyClient::builder()
        .server(&peer)
        .magic(args.magic)
        .min_interval(Duration::from_secs(args.time))
        .build()
        .await
    {
        Ok(client) => client,
        Err(e) => {
            error!("cannot reach {peer}: {e}");
            return EXIT_NETWORK;
        }
    };

    if args.query {
        return match client.query().await {
            Ok(info) => {
                println!("server protocol version {}, caps {:#010x}", info.version, info.caps);
                0
            }
            Err(e) => {
                error!("probe failed: {e}");
                e.exit_code() as u8
            }
        };
    }

    if args.files.is_empty() {
        return send_stdin(&mut client).await;
    }

    let mut saw_timeout = false;
    let mut saw_checksum = false;
    let mut saw_io = false;
    for path in &args.files {
        match client.transfer_file(path).await {
            Ok(()) => {}
            Err(e) if e.is_connectivity() => {
                error!("{}: {e}; aborting remaining files", path.display());
                return EXIT_NETWORK;
            }
            Err(e) => {
                warn!("{}: {e}", path.display());
                match e {
                    ClientError::ChecksumFailed
                    | ClientError::Rejected {
                        reason: ntpspy_proto::NakReason::ChecksumFailed,
                    } => saw_checksum = true,
                    ClientError::LocalIo(_) | ClientError::TooLarge { .. } => saw_io = true,
                    _ => saw_timeout = true,
                }
            }
        }
    }
    if saw_checksum {
        EXIT_CHECKSUM
    } else if saw_timeout {
        EXIT_NETWORK
    } else if saw_io {
        EXIT_LOCAL_IO
    } else {
        0
    }
}

async fn send_stdin(client: &mut NtpSpyClient) -> u8 {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        error!("no filenames given and stdin is a terminal; nothing to send");
        return EXIT_USAGE;
    }
    let mut data = Vec::new();
    if let Err(e) = stdin.lock().read_to_end(&mut data) {
        error!("cannot read stdin: {e}");
        return EXIT_LOCAL_IO;
    }
    if data.is_empty() {
        error!("empty pipe; nothing to send");
        return EXIT_USAGE;
    }
    match client.transfer_buf(data).await {
        Ok(()) => 0,
        Err(e) => {
            error!("stdin transfer failed: {e}");
            e.exit_code() as u8
        }
    }
}
