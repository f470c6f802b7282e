// CLI commands for the relay

use crate::relay::message::UserId;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Relay CLI
#[derive(Debug, Parser)]
#[command(name = "duochat")]
#[command(about = "Real-time direct messages with durable conversation history")]
pub struct DuoChatCli {
    #[command(subcommand)]
    pub command: DuoChatCommand,
}

/// Relay subcommands
#[derive(Debug, Subcommand)]
pub enum DuoChatCommand {
    /// Run the relay server until Ctrl+C
    Serve {
        /// JSON config file (flags override its values)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// TCP address to listen on (e.g. 127.0.0.1:5000)
        #[arg(short, long)]
        listen: Option<String>,

        /// Unix socket path to listen on
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Disable the TCP listener (requires --socket)
        #[arg(long)]
        no_tcp: bool,

        /// SQLite database holding the message log
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// Token signing secret (default: $DUOCHAT_TOKEN_SECRET)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Mint a bearer token for a user (development helper)
    IssueToken {
        /// User ID the token identifies
        #[arg(short, long)]
        user: UserId,

        /// Token lifetime in hours (default: 1)
        #[arg(short, long, default_value = "1")]
        ttl_hours: u64,

        /// Token signing secret (default: $DUOCHAT_TOKEN_SECRET)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Print the stored conversation between two users
    History {
        /// SQLite database holding the message log
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// One participant
        #[arg(short, long)]
        user: UserId,

        /// The other participant
        #[arg(short, long)]
        friend: UserId,
    },

    /// Connect to a relay and send one message to a peer
    Send {
        /// Message content
        message: String,

        /// Relay address (host:port or Unix socket path)
        #[arg(short, long, default_value = "127.0.0.1:5000")]
        server: String,

        /// Bearer token
        #[arg(short, long)]
        token: String,

        /// Peer user ID
        #[arg(short, long)]
        peer: UserId,
    },

    /// Join the conversation with a peer and print messages as they arrive
    Listen {
        /// Relay address (host:port or Unix socket path)
        #[arg(short, long, default_value = "127.0.0.1:5000")]
        server: String,

        /// Bearer token
        #[arg(short, long)]
        token: String,

        /// Peer user ID
        #[arg(short, long)]
        peer: UserId,
    },
}

impl DuoChatCli {
    /// Parse from command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let args = vec![
            "duochat",
            "serve",
            "--listen",
            "0.0.0.0:5000",
            "--database",
            "/tmp/messages.db",
        ];

        let cli = DuoChatCli::try_parse_from(args).unwrap();
        match cli.command {
            DuoChatCommand::Serve {
                listen, database, no_tcp, ..
            } => {
                assert_eq!(listen.as_deref(), Some("0.0.0.0:5000"));
                assert_eq!(database, Some(PathBuf::from("/tmp/messages.db")));
                assert!(!no_tcp);
            }
            other => panic!("Wrong command parsed: {:?}", other),
        }
    }

    #[test]
    fn test_user_ids_are_validated() {
        let ok = DuoChatCli::try_parse_from(["duochat", "issue-token", "--user", "7"]);
        assert!(ok.is_ok());

        let zero = DuoChatCli::try_parse_from(["duochat", "issue-token", "--user", "0"]);
        assert!(zero.is_err());
    }

    #[test]
    fn test_send_parsing() {
        let cli = DuoChatCli::try_parse_from([
            "duochat", "send", "--token", "t", "--peer", "2", "hello there",
        ])
        .unwrap();

        match cli.command {
            DuoChatCommand::Send {
                message, server, peer, ..
            } => {
                assert_eq!(message, "hello there");
                assert_eq!(server, "127.0.0.1:5000");
                assert_eq!(peer.get(), 2);
            }
            other => panic!("Wrong command parsed: {:?}", other),
        }
    }
}
