// Command handlers for the relay CLI

use crate::relay::*;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

/// Execute a relay command
pub async fn execute_command(command: DuoChatCommand) -> Result<()> {
    match command {
        DuoChatCommand::Serve {
            config,
            listen,
            socket,
            no_tcp,
            database,
            secret,
        } => {
            let mut config = RelayConfig::load(config.as_deref())?;
            if let Some(listen) = listen {
                config.listen_addr = Some(listen);
            }
            if no_tcp {
                config.listen_addr = None;
            }
            if socket.is_some() {
                config.socket_path = socket;
            }
            if let Some(database) = database {
                config.database_path = database;
            }
            if secret.is_some() {
                config.token_secret = secret;
            }
            handle_serve(config).await
        }
        DuoChatCommand::IssueToken {
            user,
            ttl_hours,
            secret,
        } => handle_issue_token(user, ttl_hours, secret),
        DuoChatCommand::History {
            database,
            user,
            friend,
        } => handle_history(database, user, friend).await,
        DuoChatCommand::Send {
            message,
            server,
            token,
            peer,
        } => handle_send(&server, &token, peer, &message).await,
        DuoChatCommand::Listen {
            server,
            token,
            peer,
        } => handle_listen(&server, &token, peer).await,
    }
}

async fn handle_serve(config: RelayConfig) -> Result<()> {
    config.validate()?;

    let store = SqliteMessageStore::open(&config.database_path)
        .with_context(|| format!("Failed to open message store {:?}", config.database_path))?;
    let secret = config.token_secret.clone().unwrap_or_default();
    let broker = MessageBroker::new(
        Arc::new(store),
        Arc::new(TokenAuthority::new(secret)),
        config.delivery(),
    );

    let server = RelayServer::start(&config, broker).await?;

    println!("✓ duochat relay running");
    if let Some(addr) = server.tcp_addr() {
        println!("  TCP: {}", addr);
    }
    if let Some(path) = server.socket_path() {
        println!("  Socket: {:?}", path);
    }
    println!("  Database: {:?}", config.database_path);

    println!("\nPress Ctrl+C to stop the relay");
    tokio::signal::ctrl_c().await?;

    println!("\nStopping relay...");
    server.shutdown().await?;

    Ok(())
}

fn handle_issue_token(user: UserId, ttl_hours: u64, secret: Option<String>) -> Result<()> {
    let secret = match secret.or_else(|| RelayConfig::load(None).ok()?.token_secret) {
        Some(secret) => secret,
        None => {
            let generated = generate_secret();
            eprintln!("No secret configured; generated one for this token.");
            eprintln!("Start the relay with {}={}", TOKEN_SECRET_ENV, generated);
            generated
        }
    };

    let authority = TokenAuthority::new(secret);
    let token = authority.issue(user, Duration::from_secs(ttl_hours.saturating_mul(3600)))?;
    println!("{}", token);

    Ok(())
}

async fn handle_history(database: Option<PathBuf>, user: UserId, friend: UserId) -> Result<()> {
    let path = database.unwrap_or_else(|| RelayConfig::default().database_path);
    let store = SqliteMessageStore::open(&path)
        .with_context(|| format!("Failed to open message store {:?}", path))?;

    let channel = ChannelId::between(user, friend)?;
    let messages = store.select_messages(user, friend).await?;

    if messages.is_empty() {
        println!("No messages on channel {}", channel);
        return Ok(());
    }

    println!("Channel {} ({} messages)", channel, messages.len());
    for message in &messages {
        print_message(message);
    }

    Ok(())
}

async fn handle_send(server: &str, token: &str, peer: UserId, content: &str) -> Result<()> {
    let mut client = RelayClient::connect(server).await?;
    client.authenticate(token).await.context("Authentication failed")?;

    let message = client.send_message(peer, content).await?;
    println!("✓ Message {} sent to user {}", message.id, peer);

    Ok(())
}

async fn handle_listen(server: &str, token: &str, peer: UserId) -> Result<()> {
    let mut client = RelayClient::connect(server).await?;
    let me = client.authenticate(token).await.context("Authentication failed")?;

    let (channel, history) = client.join(peer).await?;
    println!("Joined channel {} as user {}", channel, me);
    for message in &history {
        print_message(message);
    }

    // Join backfill and live stream can overlap; ids dedupe them
    let mut last_seen = history.last().map(|m| m.id).unwrap_or(0);

    loop {
        tokio::select! {
            delivery = client.next_delivery() => {
                match delivery? {
                    Some(message) if message.id > last_seen => {
                        last_seen = message.id;
                        print_message(&message);
                    }
                    Some(_) => {}
                    None => {
                        println!("Relay closed the connection");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

fn print_message(message: &Message) {
    let secs = message
        .created_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!(
        "[{}] #{} {} -> {}: {}",
        secs, message.id, message.sender_id, message.receiver_id, message.content
    );
}
