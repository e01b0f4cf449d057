//! p4rpc CLI - Command-line interface for the Perforce RPC client
//!
//! Runs server commands and manages the local trust and ticket files.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use p4rpc::rpc::{
    CommandRecord, ConnectOutcome, Connection, FingerprintRole, RpcConfig, TrustOptions,
};

#[derive(Parser)]
#[command(name = "p4rpc")]
#[command(about = "Perforce Helix Core RPC client", long_about = None)]
struct Cli {
    /// Server URI, e.g. p4java://perforce:1666 or p4javassl://[::1]:1667
    #[arg(short, long, env = "P4RPC_URI", default_value = "p4java://localhost:1666")]
    uri: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// User name
    #[arg(long, env = "P4USER")]
    user: Option<String>,

    /// Client workspace
    #[arg(long, env = "P4CLIENT")]
    client: Option<String>,

    /// Charset for unicode servers
    #[arg(long, env = "P4CHARSET")]
    charset: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server command
    Run {
        /// Command name
        name: String,

        /// Command arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Request untagged output
        #[arg(long)]
        untagged: bool,
    },

    /// Manage server fingerprints
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },

    /// Manage cached tickets
    Tickets {
        #[command(subcommand)]
        action: TicketAction,
    },
}

#[derive(Subcommand)]
enum TrustAction {
    /// Accept the server's fingerprint
    Add {
        /// Install this fingerprint instead of the observed one
        #[arg(long)]
        fingerprint: Option<String>,

        /// Replace a mismatched key
        #[arg(short, long)]
        force: bool,

        /// Install into the replacement slot
        #[arg(short, long)]
        replacement: bool,
    },

    /// Remove the server's fingerprint
    Remove {
        /// Remove the replacement fingerprint
        #[arg(short, long)]
        replacement: bool,
    },

    /// List stored fingerprints
    List {
        /// Only replacement fingerprints
        #[arg(short, long)]
        replacement: bool,
    },
}

#[derive(Subcommand)]
enum TicketAction {
    /// List cached tickets
    List,

    /// Remove a cached ticket
    Remove {
        /// User name
        user: String,

        /// Server address or id
        address: String,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RpcConfig::load(path)?,
        None => RpcConfig::default(),
    };
    config.user = cli.user.or(config.user);
    config.client = cli.client.or(config.client);
    config.charset = cli.charset.or(config.charset);

    let (trust, tickets) = config.open_stores();
    let mut conn = Connection::from_uri(&cli.uri, config, Arc::new(trust), Arc::new(tickets))
        .with_context(|| format!("Invalid server URI: {}", cli.uri))?;

    match cli.command {
        Commands::Run {
            name,
            args,
            untagged,
        } => {
            match conn.connect()? {
                ConnectOutcome::Connected { .. } => {}
                ConnectOutcome::TrustRequired {
                    kind,
                    server,
                    fingerprint,
                } => bail!(
                    "{kind}: the authenticity of '{server}' can't be established.\n\
                     Fingerprint: {fingerprint}\n\
                     Run 'p4rpc trust add' to accept it."
                ),
            }

            let mut input = HashMap::new();
            if untagged {
                input.insert("useTags".to_string(), "false".to_string());
            }
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let output = conn.run(&name, &args, input)?;

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for record in &output.records {
                match record {
                    CommandRecord::Tagged(fields) => {
                        for (key, value) in fields.iter() {
                            let text = String::from_utf8_lossy(value.as_bytes());
                            writeln!(out, "... {key} {text}")?;
                        }
                        writeln!(out)?;
                    }
                    CommandRecord::Info(message) => writeln!(out, "{message}")?,
                    CommandRecord::Error(message) => eprintln!("{message}"),
                    CommandRecord::Text(text) => writeln!(out, "{text}")?,
                    CommandRecord::Data(data) => out.write_all(data)?,
                }
            }
            conn.disconnect();
            if output.status.severity.is_error() {
                std::process::exit(1);
            }
        }

        Commands::Trust { action } => match action {
            TrustAction::Add {
                fingerprint,
                force,
                replacement,
            } => {
                let opts = TrustOptions {
                    auto_accept: true,
                    force,
                    replacement,
                    ..TrustOptions::default()
                };
                let outcome = conn.add_trust(fingerprint.as_deref(), opts)?;
                println!("{outcome}");
            }
            TrustAction::Remove { replacement } => {
                if conn.remove_trust(replacement)? {
                    println!("Removed trust entry.");
                } else {
                    println!("No trust entry to remove.");
                }
            }
            TrustAction::List { replacement } => {
                let role = replacement.then_some(FingerprintRole::Replacement);
                for fp in conn.get_trusts(role)? {
                    let suffix = match fp.role {
                        FingerprintRole::Replacement => " (replacement)",
                        FingerprintRole::Normal => "",
                    };
                    println!("{} {}{}", fp.server_ip_port, fp.value, suffix);
                }
            }
        },

        Commands::Tickets { action } => match action {
            TicketAction::List => {
                for ticket in conn.ticket_store().list_tickets()? {
                    println!("{} ({}) {}", ticket.server_address, ticket.user_name, ticket.value);
                }
            }
            TicketAction::Remove { user, address } => {
                conn.ticket_store().save_ticket(&user, &address, None)?;
                println!("Removed ticket for {user} on {address}.");
            }
        },
    }

    Ok(())
}
