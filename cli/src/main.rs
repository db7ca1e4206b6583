// tandem: identity service, signaling relay and terminal chat client
//
// Cross-platform (macOS, Linux, Windows) command-line interface for Tandem.

mod chat;
mod config;
mod identity_server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tandem_core::config::{ConfigError, Secrets};
use tandem_core::identity::{self, KeyStore};
use tandem_core::relay::{load_tls_acceptor, RelayServer, RelayServerConfig};
use tandem_core::store::SledStorage;
use tandem_core::{
    Credentials, IdentityClient, IdentityKeys, IntegrityGuard, RelayDirectory, SignalingRelay,
    TokenGuard, TokenIssuer, UserDirectory,
};
use tracing_appender::non_blocking::WorkerGuard;

/// Read by `register` and `chat` when `--password` is not given
const PASSWORD_VAR: &str = "TANDEM_PASSWORD";

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Tandem: authenticated signaling and end-to-end encrypted chat", long_about = None)]
#[command(version)]
struct Cli {
    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the identity service (accounts, tokens, public keys)
    Identity {
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Run the signaling relay (wss)
    Relay {
        #[arg(short, long)]
        listen: Option<SocketAddr>,
        /// Drop envelopes without a valid signature
        #[arg(long)]
        verify_signatures: bool,
    },
    /// Create an account and publish this device's public key
    Register {
        #[arg(short, long)]
        username: Option<String>,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Start the chat client, optionally calling a peer right away
    Chat {
        peer: Option<String>,
        #[arg(short, long)]
        username: Option<String>,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Show this device's key for a username
    Whoami {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Identity { .. } | Commands::Relay { .. } => "info",
        _ => "warn",
    };
    let _log_guard = init_logging(default_level, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Identity { listen } => cmd_identity(listen).await,
        Commands::Relay {
            listen,
            verify_signatures,
        } => cmd_relay(listen, verify_signatures).await,
        Commands::Register { username, password } => cmd_register(username, password).await,
        Commands::Chat {
            peer,
            username,
            password,
        } => cmd_chat(peer, username, password).await,
        Commands::Whoami { username } => cmd_whoami(username),
        Commands::Config { action } => cmd_config(action),
    }
}

fn init_logging(default_level: &str, log_file: Option<&std::path::Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path.file_name().context("Log file path has no file name")?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Exit with status 1 when a required secret is missing
fn require<T>(value: Result<T, ConfigError>) -> T {
    match value {
        Ok(value) => value,
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            std::process::exit(1);
        }
    }
}

fn username_or_config(username: Option<String>, config: &config::Config) -> Result<String> {
    username
        .or_else(|| config.username.clone())
        .context("No username given; pass --username or run `tandem config set username <name>`")
}

/// `--password`, then the environment, then a prompt on stdin
fn resolve_password(password: Option<String>) -> Result<String> {
    if let Some(password) = password.or_else(|| std::env::var(PASSWORD_VAR).ok()) {
        return Ok(password);
    }

    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Failed to read password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        anyhow::bail!("Password must not be empty");
    }
    Ok(password)
}

fn open_key_store(config: &config::Config) -> Result<KeyStore> {
    let path = config.key_store_path()?;
    let backend = SledStorage::open(&path)
        .with_context(|| format!("Failed to open key store at {}", path.display()))?;
    Ok(KeyStore::persistent(Arc::new(backend)))
}

fn load_keys(config: &config::Config, username: &str) -> Result<IdentityKeys> {
    let store = open_key_store(config)?;
    identity::load_or_generate(&store, username).context("Failed to load identity keys")
}

fn relay_integrity(config: &config::Config, secrets: &Secrets) -> Result<Option<IntegrityGuard>> {
    if !config.sign_envelopes {
        return Ok(None);
    }
    let secret = require(secrets.require_relay_secret());
    Ok(Some(IntegrityGuard::new(secret.as_bytes())?))
}

async fn cmd_identity(listen: Option<SocketAddr>) -> Result<()> {
    let config = config::Config::load()?;
    let secrets = Secrets::from_env();
    let secret = require(secrets.require_token_secret());

    let tokens = TokenIssuer::new(secret.as_bytes())?;
    let users = Arc::new(UserDirectory::new(tokens));
    let addr = listen.unwrap_or(config.identity_listen);

    println!("{} Identity service on {}", "✓".green(), addr.to_string().bright_cyan());
    identity_server::serve(users, addr).await;
    Ok(())
}

async fn cmd_relay(listen: Option<SocketAddr>, verify_signatures: bool) -> Result<()> {
    let config = config::Config::load()?;
    let secrets = Secrets::from_env();
    let relay_secret = require(secrets.require_relay_secret());
    let token_secret = require(secrets.require_token_secret());
    let (cert, key) = require(secrets.require_tls());

    let tls = load_tls_acceptor(cert, key).context("Failed to load TLS certificate")?;
    let guard = TokenGuard::new(Arc::new(TokenIssuer::new(token_secret.as_bytes())?));
    let server_config = RelayServerConfig {
        bind_addr: listen.unwrap_or(config.relay_listen),
        verify_signatures: verify_signatures || config.sign_envelopes,
    };
    let mut relay = SignalingRelay::new(Arc::new(RelayDirectory::new()));
    if server_config.verify_signatures {
        relay = relay.with_integrity(IntegrityGuard::new(relay_secret.as_bytes())?);
    }

    let server = RelayServer::bind(server_config.bind_addr, guard, relay, Some(tls))
        .await
        .with_context(|| format!("Failed to bind relay on {}", server_config.bind_addr))?;
    println!(
        "{} Relay on {}",
        "✓".green(),
        format!("wss://{}", server.local_addr()?).bright_cyan()
    );
    server.run().await?;
    Ok(())
}

async fn cmd_register(username: Option<String>, password: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let username = username_or_config(username, &config)?;
    let password = resolve_password(password)?;
    let credentials = Credentials::new(&username, password);

    let client = IdentityClient::new(&config.identity_url);
    client
        .register(&credentials)
        .await
        .context("Registration failed")?;
    println!("{} Registered {}", "✓".green(), username.bright_cyan());

    let token = client.login(&credentials).await.context("Login failed")?;
    let keys = load_keys(&config, &username)?;
    client
        .publish_public_key(&token, &username, &keys.public_key())
        .await
        .context("Failed to publish public key")?;
    println!("{} Public key published", "✓".green());
    println!("  Fingerprint: {}", keys.fingerprint().bright_yellow());
    println!();
    println!("{}", "Next steps:".bold());
    println!("  • Chat: {}", format!("tandem chat --username {} <peer>", username).bright_green());

    Ok(())
}

async fn cmd_chat(
    peer: Option<String>,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let config = config::Config::load()?;
    let username = username_or_config(username, &config)?;
    let password = resolve_password(password)?;
    let integrity = relay_integrity(&config, &Secrets::from_env())?;
    let keys = load_keys(&config, &username)?;

    chat::run(
        &config,
        Credentials::new(&username, password),
        keys,
        integrity,
        peer,
    )
    .await
}

fn cmd_whoami(username: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let username = username_or_config(username, &config)?;
    let store = open_key_store(&config)?;

    match store.load(&username)? {
        Some(keys) => {
            println!("{}", "Identity Information".bold());
            println!("  Username:    {}", username.bright_cyan());
            println!("  Public Key:  {}", keys.public_key_hex().bright_yellow());
            println!("  Fingerprint: {}", keys.fingerprint());
        }
        None => println!(
            "No keys for {} yet. Run {}",
            username,
            "tandem register".bright_green()
        ),
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
            println!();
            println!("  File: {}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
