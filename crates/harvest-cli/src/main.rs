//! harvest CLI - listen, tail and send front end for the collector cores

mod cli;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing::{info, warn};

use harvest_core::format::{render, Format};
use harvest_core::net::{ListenConfig, PacketSecurity, Sender};
use harvest_core::{PacketParser, SecurityLevel, Value, ValueList};
use harvest_tail::{RotatingTail, TailConfig};

use cli::{Cli, Command};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = match cli.command {
        Command::Listen {
            bind,
            group,
            format,
            level,
            auth_file,
        } => listen(bind, group, &format, &level, auth_file.as_deref()),
        Command::Tail {
            pattern,
            from_start,
            interval,
        } => tail(&pattern, from_start, interval),
        Command::Send {
            dest,
            host,
            plugin,
            plugin_instance,
            type_name,
            type_instance,
            kind,
            interval,
            sign,
            encrypt,
            values,
        } => values
            .iter()
            .map(|raw| parse_value(&kind, raw))
            .collect::<Result<_>>()
            .and_then(|parsed| {
                let vl = ValueList {
                    host,
                    plugin,
                    plugin_instance,
                    type_name,
                    type_instance,
                    time: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default(),
                    interval: Duration::from_secs(interval),
                    values: parsed,
                };
                send(&dest, vl, sign.as_deref(), encrypt.as_deref())
            }),
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("harvest: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

// ----------------------------------------------------------------------------
// listen
// ----------------------------------------------------------------------------

fn listen(
    bind: SocketAddr,
    group: Option<IpAddr>,
    format: &str,
    level: &str,
    auth_file: Option<&Path>,
) -> Result<()> {
    let format: Format = format.parse()?;
    let level: SecurityLevel = level.parse()?;

    let passwords = match auth_file {
        Some(path) => Some(load_auth_file(path)?),
        None => None,
    };

    let config = ListenConfig {
        bind,
        group,
        ..Default::default()
    };
    let socket = config.open()?;
    info!(%bind, "listening");

    let mut parser = PacketParser::new().min_level(level);
    if let Some(passwords) = &passwords {
        parser = parser.passwords(passwords);
    }

    let mut buf = [0u8; 65535];
    loop {
        let (len, peer) = socket.recv_from(&mut buf)?;
        let result = parser.parse(&buf[..len], |vl| {
            print_record(format, vl);
            Ok(())
        });
        if let Err(err) = result {
            warn!(%peer, %err, "discarding packet");
        }
    }
}

fn print_record(format: Format, vl: &ValueList) {
    let out = render(format, vl);
    if out.ends_with('\n') {
        print!("{out}");
    } else {
        println!("{out}");
    }
}

/// Load a "user: password" credentials file, one entry per line
fn load_auth_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for line in std::fs::read_to_string(path)?.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((user, password)) = line.split_once(':') else {
            warn!(?line, "ignoring malformed auth-file line");
            continue;
        };
        map.insert(user.trim().to_owned(), password.trim().to_owned());
    }
    info!(path = %path.display(), users = map.len(), "loaded credentials");
    Ok(map)
}

// ----------------------------------------------------------------------------
// tail
// ----------------------------------------------------------------------------

fn tail(pattern: &str, from_start: bool, interval: u64) -> Result<()> {
    let config = TailConfig {
        seek_to_end_on_first_open: !from_start,
        ..Default::default()
    };
    let mut tail = RotatingTail::with_config(pattern, config)?;

    loop {
        tail.dispatch(|line| {
            print!("{line}");
            if !line.ends_with('\n') {
                println!();
            }
            ControlFlow::<()>::Continue(())
        })?;
        std::thread::sleep(Duration::from_secs(interval.max(1)));
    }
}

// ----------------------------------------------------------------------------
// send
// ----------------------------------------------------------------------------

fn parse_value(kind: &str, raw: &str) -> Result<Value> {
    let value = match kind {
        "counter" => Value::Counter(raw.parse()?),
        "derive" => Value::Derive(raw.parse()?),
        "absolute" => Value::Absolute(raw.parse()?),
        "gauge" if raw == "U" => Value::Gauge(f64::NAN),
        "gauge" => Value::Gauge(raw.parse()?),
        other => return Err(format!("unknown data source type {other:?}").into()),
    };
    Ok(value)
}

fn parse_credentials(raw: &str) -> Result<(String, String)> {
    let Some((user, password)) = raw.split_once(':') else {
        return Err("credentials must be given as user:password".into());
    };
    Ok((user.to_owned(), password.to_owned()))
}

fn send(dest: &str, vl: ValueList, sign: Option<&str>, encrypt: Option<&str>) -> Result<()> {
    let security = if let Some(raw) = encrypt {
        let (username, password) = parse_credentials(raw)?;
        PacketSecurity::Encrypt { username, password }
    } else if let Some(raw) = sign {
        let (username, password) = parse_credentials(raw)?;
        PacketSecurity::Sign { username, password }
    } else {
        PacketSecurity::Plain
    };

    let mut sender = Sender::connect(dest, security)?;
    sender.submit(&vl)?;
    sender.flush()?;
    info!(dest, identifier = %vl.identifier(), "sample sent");
    Ok(())
}
