// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// LocalForward - CLI Client
// Gives hostnames their own loopback address and forwards them over one SSH tunnel

mod config;
mod elevate;

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use localforward_common::{
    AddOutcome, Error, HostEntry, SessionConfig, StartOutcome, StopOutcome, TunnelState,
    TunnelStatus,
};

use crate::config::{load_session, Runtime};
use crate::elevate::ensure_elevated;

#[derive(Parser)]
#[command(name = "localforward")]
#[command(about = "Local Forwarding Utility", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use a different session configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set default SSH profile (shows the current one if omitted)
    SshProfile {
        /// Profile name (a Host entry in ~/.ssh/config)
        profile: Option<String>,
    },

    /// Add a new host
    Add {
        /// Host to add
        host: String,
    },

    /// Start the SSH tunnel
    Start {
        /// SSH profile to use (defaults to the last one used)
        profile: Option<String>,
    },

    /// Restart the SSH tunnel
    Restart {
        /// SSH profile to use (defaults to the last one used)
        profile: Option<String>,
    },

    /// Show SSH tunnel logs
    Logs {
        /// Print the current log and exit instead of following it
        #[arg(long)]
        no_follow: bool,
    },

    /// Stop the SSH tunnel
    Stop,

    /// List managed hosts
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Show tunnel status
    Status {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },
}

impl Commands {
    /// Touches /etc/hosts, the loopback interface or a root-owned tunnel
    fn needs_root(&self) -> bool {
        matches!(
            self,
            Commands::Add { .. }
                | Commands::Start { .. }
                | Commands::Restart { .. }
                | Commands::Logs { .. }
                | Commands::Stop
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    if cli.command.needs_root() {
        ensure_elevated()?;
    }

    let session = load_session(cli.config.as_deref())?;
    let runtime = Runtime::new(&session)?;

    match cli.command {
        Commands::SshProfile { profile } => ssh_profile(&runtime, session, profile),
        Commands::Add { host } => add_host(&runtime, session, &host),
        Commands::Start { profile } => start_tunnel(&runtime, session, profile),
        Commands::Restart { profile } => restart_tunnel(&runtime, session, profile),
        Commands::Logs { no_follow } => show_logs(&runtime, session, !no_follow),
        Commands::Stop => stop_tunnel(&runtime, session),
        Commands::List { json } => list_hosts(&runtime, session, json),
        Commands::Status { json } => show_status(&runtime, session, json),
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "localforward=debug,localforward_common=debug"
    } else {
        "localforward=warn,localforward_common=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn ssh_profile(runtime: &Runtime, session: SessionConfig, profile: Option<String>) -> Result<()> {
    let Some(profile) = profile else {
        match &session.default_profile {
            Some(name) => println!("Default SSH profile: {}", name.cyan()),
            None => println!(
                "{}",
                "No default SSH profile set. Use 'localforward ssh-profile <profile>'".yellow()
            ),
        }
        return Ok(());
    };

    let mut app = runtime.app(session)?;
    app.set_default_profile(&profile)?;
    println!(
        "{}",
        format!("✓ Default SSH profile set to {}", profile).green().bold()
    );
    Ok(())
}

fn add_host(runtime: &Runtime, session: SessionConfig, host: &str) -> Result<()> {
    let mut app = runtime.app(session)?;

    match app.add_host(host)? {
        AddOutcome::AlreadyConfigured { address } => {
            println!(
                "{}",
                format!("{} is already configured ({})", host, address).yellow()
            );
        }
        AddOutcome::Added { address, restarted } => {
            println!(
                "{}",
                format!("✓ Host {} added with IP {}", host, address)
                    .green()
                    .bold()
            );
            match restarted {
                Some(outcome) => announce_started(&outcome),
                None => println!(
                    "{}",
                    "Tunnel is not running. Start it with 'localforward start [profile]'".dimmed()
                ),
            }
        }
    }
    Ok(())
}

fn start_tunnel(runtime: &Runtime, session: SessionConfig, profile: Option<String>) -> Result<()> {
    let mut app = runtime.app(session)?;
    let outcome = app.start(profile.as_deref())?;
    announce_started(&outcome);
    Ok(())
}

fn restart_tunnel(
    runtime: &Runtime,
    session: SessionConfig,
    profile: Option<String>,
) -> Result<()> {
    let mut app = runtime.app(session)?;
    let outcome = app.restart(profile.as_deref())?;
    announce_started(&outcome);
    Ok(())
}

fn announce_started(outcome: &StartOutcome) {
    println!(
        "{}",
        format!(
            "✓ SSH tunnel started with PID {} via {}",
            outcome.pid,
            outcome.profile.target()
        )
        .green()
        .bold()
    );
    if outcome.forwards.is_empty() {
        println!(
            "{}",
            "No hosts configured yet. Add one with 'localforward add <hostname>'".yellow()
        );
    }
    for forward in &outcome.forwards {
        println!("  {}", forward);
    }
    println!(
        "{}",
        format!("Logs available at {}", outcome.log_path.display()).dimmed()
    );
}

fn stop_tunnel(runtime: &Runtime, session: SessionConfig) -> Result<()> {
    let app = runtime.app(session)?;

    match app.stop() {
        Ok(StopOutcome::Stopped { pid, exited: true }) => {
            println!(
                "{}",
                format!("✓ Stopped SSH tunnel with PID {}", pid).green().bold()
            );
        }
        Ok(StopOutcome::Stopped { pid, exited: false }) => {
            println!(
                "{}",
                format!(
                    "Sent stop signal to PID {}, but it has not exited yet",
                    pid
                )
                .yellow()
            );
        }
        Ok(StopOutcome::NotRunning) => {
            println!("{}", "No active SSH tunnel found.".yellow());
        }
        Err(e) if e.is_informational() => {
            println!("{}", e.to_string().yellow());
        }
        Err(e) => return Err(e).context("Failed to stop SSH tunnel"),
    }
    Ok(())
}

fn show_logs(runtime: &Runtime, session: SessionConfig, follow: bool) -> Result<()> {
    let app = runtime.app(session)?;
    let mut stdout = io::stdout().lock();

    match app.supervisor().tail_logs(&mut stdout, follow, || false) {
        Ok(()) => Ok(()),
        Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            println!("{}", e.to_string().yellow());
            Ok(())
        }
        Err(e) => Err(e).context("Failed to read tunnel logs"),
    }
}

fn list_hosts(runtime: &Runtime, session: SessionConfig, json: bool) -> Result<()> {
    let app = runtime.app(session)?;
    let entries = app.entries()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{}", "No hosts configured.".yellow());
        println!("Add one with: {}", "localforward add <hostname>".cyan());
        return Ok(());
    }

    println!("{}", hosts_table(&entries));
    Ok(())
}

fn show_status(runtime: &Runtime, session: SessionConfig, json: bool) -> Result<()> {
    let app = runtime.app(session)?;
    let status = app.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    print_status(&status);
    Ok(())
}

fn print_status(status: &TunnelStatus) {
    let state = match status.state {
        TunnelState::Running { pid } => format!("running (PID {})", pid).green().bold(),
        TunnelState::Stopped => "stopped".red().bold(),
    };
    println!("{:<16} {}", "Tunnel:".bold(), state);
    println!(
        "{:<16} {}",
        "Profile:".bold(),
        status.default_profile.as_deref().unwrap_or("(none)")
    );
    println!("{:<16} {}", "Hosts file:".bold(), status.hosts_file.display());
    println!("{:<16} {}", "Log:".bold(), status.log_path.display());
    println!();

    if status.hosts.is_empty() {
        println!("{}", "No hosts configured.".dimmed());
    } else {
        println!("{}", hosts_table(&status.hosts));
    }
}

fn hosts_table(entries: &[HostEntry]) -> Table {
    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Address")
                .add_attribute(Attribute::Bold)
                .fg(Color::Cyan),
            Cell::new("Hostname")
                .add_attribute(Attribute::Bold)
                .fg(Color::Cyan),
            Cell::new("Line")
                .add_attribute(Attribute::Bold)
                .fg(Color::Cyan),
        ]);

    for entry in entries {
        table.add_row(vec![
            Cell::new(entry.address),
            Cell::new(&entry.name),
            Cell::new(entry.line_number),
        ]);
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["localforward", "add", "svc-a"]).unwrap();
        assert!(matches!(cli.command, Commands::Add { ref host } if host == "svc-a"));
        assert!(cli.command.needs_root());

        let cli = Cli::try_parse_from(["localforward", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start { profile: None }));

        let cli = Cli::try_parse_from(["localforward", "-v", "ssh-profile", "bastion"]).unwrap();
        assert!(cli.verbose);
        assert!(!cli.command.needs_root());

        let cli = Cli::try_parse_from(["localforward", "logs", "--no-follow"]).unwrap();
        assert!(matches!(cli.command, Commands::Logs { no_follow: true }));
    }

    #[test]
    fn test_add_requires_hostname() {
        assert!(Cli::try_parse_from(["localforward", "add"]).is_err());
    }

    #[test]
    fn test_hosts_table_lists_entries() {
        let entries = vec![HostEntry {
            address: "127.0.0.2".parse().unwrap(),
            name: "svc-a".to_string(),
            line_number: 12,
        }];
        let rendered = hosts_table(&entries).to_string();
        assert!(rendered.contains("127.0.0.2"));
        assert!(rendered.contains("svc-a"));
    }
}
