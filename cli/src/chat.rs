// Terminal chat client: login, relay connection, sessions, stdin commands

use crate::config::Config;
use anyhow::{Context, Result};
use colored::*;
use std::sync::Arc;
use tandem_core::relay::{RelayClient, RelayClientConfig};
use tandem_core::{
    Credentials, IdentityClient, IdentityKeys, IntegrityGuard, SessionEvent, SessionManager,
    TcpTransportFactory,
};
use tokio::io::AsyncBufReadExt;

/// One line typed by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Call(String),
    Hangup,
    /// Switch which peer plain lines go to
    Switch(String),
    Peers,
    Help,
    Quit,
    Text(String),
    Empty,
    Unknown(String),
}

pub fn parse_command(line: &str) -> ChatCommand {
    let line = line.trim();
    if line.is_empty() {
        return ChatCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ChatCommand::Text(line.to_string());
    };

    let mut parts = command.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());
    match (name, arg) {
        ("call", Some(peer)) => ChatCommand::Call(peer.to_string()),
        ("to", Some(peer)) => ChatCommand::Switch(peer.to_string()),
        ("hangup", None) => ChatCommand::Hangup,
        ("peers", None) => ChatCommand::Peers,
        ("help", None) => ChatCommand::Help,
        ("quit", None) | ("exit", None) => ChatCommand::Quit,
        _ => ChatCommand::Unknown(line.to_string()),
    }
}

fn prompt(current: &Option<String>) {
    match current {
        Some(peer) => print!("{}> ", peer.bright_cyan()),
        None => print!("> "),
    }
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn print_help() {
    println!("{}", "Commands:".bold());
    println!("  {} <peer>   start a call", "/call".bright_green());
    println!("  {} <peer>     send plain lines to another open session", "/to".bright_green());
    println!("  {}        end the current call", "/hangup".bright_green());
    println!("  {}         list sessions", "/peers".bright_green());
    println!("  {}          leave", "/quit".bright_green());
    println!("  anything else is sent to the current peer");
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::IncomingCall { peer } => {
            println!("\n{} Incoming call from {}", "📞".bold(), peer.bright_cyan());
        }
        SessionEvent::StateChanged { peer, state } => {
            tracing::debug!("{} is now {}", peer, state);
        }
        SessionEvent::ChannelOpen { peer } => {
            println!("\n{} Secure channel open with {}", "✓".green(), peer.bright_cyan());
        }
        SessionEvent::MessageReceived { peer, text } => {
            println!("\n{}: {}", peer.bright_cyan().bold(), text);
        }
        SessionEvent::CallFailed { peer, reason } => {
            println!("\n{} Call with {} failed: {}", "✗".red(), peer, reason);
        }
        SessionEvent::SendFailed { peer, reason } => {
            println!("\n{} Not delivered to {}: {}", "✗".red(), peer, reason);
        }
        SessionEvent::Closed { peer, reason } => {
            println!("\n{} {} left ({})", "•".dimmed(), peer, reason);
        }
    }
}

pub async fn run(
    config: &Config,
    credentials: Credentials,
    keys: IdentityKeys,
    integrity: Option<IntegrityGuard>,
    initial_peer: Option<String>,
) -> Result<()> {
    let username = credentials.username.clone();
    let identity = IdentityClient::new(&config.identity_url);

    let token = identity.login(&credentials).await.context("Login failed")?;
    identity
        .publish_public_key(&token, &username, &keys.public_key())
        .await
        .context("Failed to publish public key")?;
    println!("{} Logged in as {}", "✓".green(), username.bright_cyan());

    let relay_config = RelayClientConfig {
        url: config.relay_url.clone(),
        accept_invalid_certs: config.accept_invalid_certs,
        integrity,
    };
    let client = RelayClient::connect(relay_config, &token)
        .await
        .context("Failed to connect to relay")?;
    println!("{} Connected to {}", "✓".green(), config.relay_url);

    let (outbound, mut inbound) = client.into_parts();
    let (manager, mut events) = SessionManager::new(
        username,
        Arc::new(keys),
        Arc::new(identity),
        Arc::new(TcpTransportFactory::new(config.transport_config())),
        config.session_config(),
        outbound,
    );
    let manager = Arc::new(manager);

    let dispatcher = manager.clone();
    let mut relay_task = tokio::spawn(async move {
        while let Some(envelope) = inbound.recv().await {
            dispatcher.handle_signal(envelope);
        }
    });

    let mut current = initial_peer;
    if let Some(peer) = &current {
        manager.start_call(peer)?;
    }

    println!();
    print_help();
    println!();
    prompt(&current);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    break;
                };
                match parse_command(&line) {
                    ChatCommand::Quit => break,
                    ChatCommand::Empty => {}
                    ChatCommand::Help => print_help(),
                    ChatCommand::Call(peer) => match manager.start_call(&peer) {
                        Ok(()) => current = Some(peer),
                        Err(e) => println!("{} {}", "✗".red(), e),
                    },
                    ChatCommand::Switch(peer) => current = Some(peer),
                    ChatCommand::Hangup => match current.take() {
                        Some(peer) => {
                            if let Err(e) = manager.hangup(&peer) {
                                println!("{} {}", "✗".red(), e);
                            }
                        }
                        None => println!("Not in a call"),
                    },
                    ChatCommand::Peers => {
                        let peers = manager.active_peers();
                        if peers.is_empty() {
                            println!("{}", "No sessions.".dimmed());
                        }
                        for peer in peers {
                            println!("  • {}", peer.bright_cyan());
                        }
                    }
                    ChatCommand::Text(text) => match &current {
                        Some(peer) => {
                            if let Err(e) = manager.send_text(peer, text) {
                                println!("{} {}", "✗".red(), e);
                            }
                        }
                        None => println!("No peer selected; use /call <peer>"),
                    },
                    ChatCommand::Unknown(line) => println!("Unknown command: {} (try /help)", line),
                }
                prompt(&current);
            }
            Some(event) = events.recv() => {
                if let SessionEvent::IncomingCall { peer } = &event {
                    if current.is_none() {
                        current = Some(peer.clone());
                    }
                }
                if let SessionEvent::Closed { peer, .. } = &event {
                    if current.as_deref() == Some(peer.as_str()) {
                        current = None;
                    }
                }
                print_event(&event);
                prompt(&current);
            }
            _ = &mut relay_task => {
                println!("\n{} Relay connection lost", "✗".red());
                break;
            }
        }
    }

    for peer in manager.active_peers() {
        let _ = manager.hangup(&peer);
    }
    relay_task.abort();
    println!("Bye.");
    Ok(())
}
