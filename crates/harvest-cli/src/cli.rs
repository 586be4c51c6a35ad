//! Command line argument types

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "harvest",
    version,
    about = "Follow rotating logs and speak the harvest wire protocol"
)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Receive packets and print every delivered sample
    Listen {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0:25826")]
        bind: SocketAddr,

        /// Multicast group to join
        #[arg(long)]
        group: Option<IpAddr>,

        /// Output format: command, json or graphite
        #[arg(long, default_value = "graphite")]
        format: String,

        /// Minimum security level: none, sign or encrypt
        #[arg(long, default_value = "none")]
        level: String,

        /// "user: password" file for verifying signed and decrypting
        /// encrypted packets
        #[arg(long)]
        auth_file: Option<PathBuf>,
    },

    /// Follow the newest file matching a glob pattern
    Tail {
        /// Path or shell-style glob, e.g. "/var/log/httpd/access.log*"
        pattern: String,

        /// Read the first selected file from the beginning instead of
        /// its end
        #[arg(long)]
        from_start: bool,

        /// Seconds between pattern scans
        #[arg(long, default_value_t = 1)]
        interval: u64,
    },

    /// Encode one sample and send it to a receiver
    Send {
        /// Receiver address
        #[arg(long, default_value = "127.0.0.1:25826")]
        dest: String,

        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long)]
        plugin: String,

        #[arg(long, default_value = "")]
        plugin_instance: String,

        #[arg(long = "type")]
        type_name: String,

        #[arg(long, default_value = "")]
        type_instance: String,

        /// Data source type: counter, gauge, derive or absolute
        #[arg(long, default_value = "gauge")]
        kind: String,

        /// Sample interval in seconds
        #[arg(long, default_value_t = 10)]
        interval: u64,

        /// Sign the packet, credentials as "user:password"
        #[arg(long, conflicts_with = "encrypt")]
        sign: Option<String>,

        /// Encrypt the packet, credentials as "user:password"
        #[arg(long)]
        encrypt: Option<String>,

        /// One or more values ("U" is an undefined gauge)
        #[arg(required = true)]
        values: Vec<String>,
    },
}
