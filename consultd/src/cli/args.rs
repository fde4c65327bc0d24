//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::models::Channel;

/// consultd - billed consultation sessions backed by a prepaid wallet ledger
#[derive(Parser, Debug)]
#[command(name = "consultd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.consultd/config.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "consultd=info")]
    pub log_level: String,

    /// Server port (default: the running server's, else the configured one)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the session and ledger server
    Serve {
        /// Directory for the ledger and session journals
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep all state in memory
        #[arg(long)]
        in_memory: bool,
    },

    /// Start a session: reserves funds and waits for the consultant
    Start {
        /// Paying client (also the wallet billed)
        #[arg(long = "as")]
        client: String,

        /// Consultant to connect with
        consultant: String,

        /// Price per billing increment
        #[arg(long, required_unless_present = "flat", conflicts_with = "flat")]
        rate: Option<i64>,

        /// Flat price for the whole session
        #[arg(long)]
        flat: Option<i64>,

        /// Exact amount to hold for a per-minute session
        #[arg(long)]
        budget: Option<i64>,

        /// Requested length in minutes
        #[arg(long)]
        minutes: Option<u32>,

        /// Medium of the consultation
        #[arg(long, value_enum, default_value = "chat")]
        channel: ChannelArg,

        /// Idempotency key (generated when omitted)
        #[arg(long)]
        key: Option<String>,
    },

    /// Accept a pending session (consultant)
    Accept {
        id: String,
        #[arg(long = "as")]
        participant: String,
    },

    /// Decline a pending session (consultant)
    Decline {
        id: String,
        #[arg(long = "as")]
        participant: String,
    },

    /// End a session (either participant)
    End {
        id: String,
        #[arg(long = "as")]
        participant: String,
    },

    /// Show one session
    Status {
        id: String,
        #[arg(long = "as")]
        participant: String,
    },

    /// List the sessions of a participant
    Sessions {
        #[arg(long = "as")]
        participant: String,
    },

    /// Credit a wallet from a gateway payment
    Recharge {
        wallet: String,
        amount: i64,

        /// Gateway transaction id; retries with the same id credit once
        #[arg(long)]
        txn: String,

        /// Gateway identity posting the credit
        #[arg(long = "as", default_value = "gateway")]
        gateway: String,
    },

    /// Show a wallet balance, opening it first with --open
    Wallet {
        id: String,

        /// Create the wallet if it does not exist
        #[arg(long)]
        open: bool,

        /// Currency for a newly opened wallet
        #[arg(long, requires = "open")]
        currency: Option<String>,

        /// Caller identity; defaults to the wallet owner
        #[arg(long = "as")]
        participant: Option<String>,
    },

    /// List ledger entries of a wallet
    Entries {
        wallet: String,

        /// Only entries of this session
        #[arg(long)]
        session: Option<String>,

        /// Caller identity; defaults to the wallet owner
        #[arg(long = "as")]
        participant: Option<String>,
    },
}

/// Channel choices on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ChannelArg {
    Chat,
    Voice,
    Video,
}

impl From<ChannelArg> for Channel {
    fn from(arg: ChannelArg) -> Self {
        match arg {
            ChannelArg::Chat => Self::Chat,
            ChannelArg::Voice => Self::Voice,
            ChannelArg::Video => Self::Video,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_requires_a_price() {
        assert!(Cli::try_parse_from(["consultd", "start", "--as", "alice", "bob"]).is_err());
        let cli = Cli::try_parse_from([
            "consultd", "start", "--as", "alice", "bob", "--rate", "100", "--budget", "250",
        ])
        .unwrap();
        match cli.command {
            Commands::Start {
                client,
                consultant,
                rate,
                budget,
                ..
            } => {
                assert_eq!((client.as_str(), consultant.as_str()), ("alice", "bob"));
                assert_eq!((rate, budget), (Some(100), Some(250)));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["consultd", "wallet", "alice", "--port", "9000"]).unwrap();
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.log_level, "consultd=info");
    }

    #[test]
    fn recharge_posts_as_the_gateway_by_default() {
        let cli =
            Cli::try_parse_from(["consultd", "recharge", "alice", "500", "--txn", "t1"]).unwrap();
        match cli.command {
            Commands::Recharge { gateway, .. } => assert_eq!(gateway, "gateway"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rate_and_flat_are_exclusive() {
        assert!(Cli::try_parse_from([
            "consultd", "start", "--as", "a", "b", "--rate", "1", "--flat", "5"
        ])
        .is_err());
    }
}
