//! CLI command execution.
//!
//! Everything except `serve` is a thin HTTP client of the running server.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

use crate::clock::SystemClock;
use crate::config::Config;
use crate::ledger::Receipt;
use crate::models::{LedgerEntry, PriceModel, Wallet};
use crate::server::{
    self, OpenWalletRequest, RechargeRequest, StartSessionRequest, WalletView, PARTICIPANT_HEADER,
};
use crate::session::SessionView;

use super::args::{Cli, Commands};

/// Error body returned by the server.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(default)]
    retryable: bool,
}

/// Execute the parsed CLI command.
pub async fn execute(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let port = cli
        .port
        .or_else(server::get_server_port)
        .unwrap_or(config.server.port);
    let api = Api::new(port);

    match cli.command {
        Commands::Serve {
            data_dir,
            in_memory,
        } => {
            if data_dir.is_some() {
                config.storage.data_dir = data_dir;
            }
            config.storage.in_memory |= in_memory;
            return server::start_server(config, Arc::new(SystemClock)).await;
        }
        Commands::Start {
            client,
            consultant,
            rate,
            flat,
            budget,
            minutes,
            channel,
            key,
        } => {
            let price = match (rate, flat) {
                (_, Some(amount)) => PriceModel::Flat { amount },
                (Some(rate), None) => PriceModel::PerMinute { rate },
                (None, None) => bail!("Either --rate or --flat is required"),
            };
            let body = StartSessionRequest {
                consultant_id: consultant,
                channel: channel.into(),
                price,
                max_minutes: minutes,
                budget,
                idempotency_key: key.unwrap_or_else(|| Uuid::now_v7().to_string()),
            };
            let view: SessionView = api
                .send(api.post("/api/sessions").as_participant(&client).json(&body))
                .await?;
            print_session(&view);
        }
        Commands::Accept { id, participant } => {
            session_action(&api, &id, "accept", &participant).await?;
        }
        Commands::Decline { id, participant } => {
            session_action(&api, &id, "decline", &participant).await?;
        }
        Commands::End { id, participant } => {
            session_action(&api, &id, "end", &participant).await?;
        }
        Commands::Status { id, participant } => {
            let path = format!("/api/sessions/{}", urlencoding::encode(&id));
            let view: SessionView = api.send(api.get(&path).as_participant(&participant)).await?;
            print_session(&view);
        }
        Commands::Sessions { participant } => {
            let views: Vec<SessionView> = api
                .send(api.get("/api/sessions").as_participant(&participant))
                .await?;
            print_sessions(&views);
        }
        Commands::Recharge {
            wallet,
            amount,
            txn,
            gateway,
        } => {
            let path = format!("/api/wallets/{}/recharge", urlencoding::encode(&wallet));
            let body = RechargeRequest {
                amount,
                transaction_id: txn,
            };
            let receipt: Receipt = api
                .send(api.post(&path).as_participant(&gateway).json(&body))
                .await?;
            if receipt.replayed {
                println!("Transaction already applied (replayed).");
            }
            print_wallet(&receipt.wallet, None);
        }
        Commands::Wallet {
            id,
            open,
            currency,
            participant,
        } => {
            let path = format!("/api/wallets/{}", urlencoding::encode(&id));
            let caller = participant.as_deref().unwrap_or(&id);
            if open {
                let wallet: Wallet = api
                    .send(
                        api.put(&path)
                            .as_participant(caller)
                            .json(&OpenWalletRequest { currency }),
                    )
                    .await?;
                println!("Opened wallet {}", wallet.id);
            }
            let view: WalletView = api.send(api.get(&path).as_participant(caller)).await?;
            print_wallet(&view.wallet, Some(view.consistent));
        }
        Commands::Entries {
            wallet,
            session,
            participant,
        } => {
            let mut path = format!("/api/wallets/{}/entries", urlencoding::encode(&wallet));
            if let Some(session_id) = session {
                path.push_str(&format!("?session_id={}", urlencoding::encode(&session_id)));
            }
            let caller = participant.as_deref().unwrap_or(&wallet);
            let entries: Vec<LedgerEntry> = api.send(api.get(&path).as_participant(caller)).await?;
            print_entries(&entries);
        }
    }

    Ok(())
}

async fn session_action(api: &Api, id: &str, action: &str, participant: &str) -> Result<()> {
    let path = format!("/api/sessions/{}/{action}", urlencoding::encode(id));
    let view: SessionView = api.send(api.post(&path).as_participant(participant)).await?;
    print_session(&view);
    Ok(())
}

// === HTTP client ===

struct Api {
    base: String,
    client: reqwest::Client,
}

impl Api {
    fn new(port: u16) -> Self {
        Self {
            base: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::new(),
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(format!("{}{path}", self.base))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(format!("{}{path}", self.base))
    }

    fn put(&self, path: &str) -> RequestBuilder {
        self.client.put(format!("{}{path}", self.base))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let resp = request.send().await.with_context(|| {
            format!("Failed to reach consultd at {} (is `consultd serve` running?)", self.base)
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) if body.retryable => {
                    bail!("{}: {} (retryable)", body.code, body.message)
                }
                Ok(body) => bail!("{}: {}", body.code, body.message),
                Err(_) => bail!("Server returned {status}: {text}"),
            }
        }
        resp.json().await.context("Failed to parse server response")
    }
}

trait AsParticipant {
    fn as_participant(self, participant: &str) -> Self;
}

impl AsParticipant for RequestBuilder {
    fn as_participant(self, participant: &str) -> Self {
        self.header(PARTICIPANT_HEADER, participant)
    }
}

// === Output ===

fn price_label(price: PriceModel) -> String {
    match price {
        PriceModel::Flat { amount } => format!("{amount} flat"),
        PriceModel::PerMinute { rate } => format!("{rate}/min"),
    }
}

fn print_session(view: &SessionView) {
    let s = &view.session;
    println!("Session:    {}", s.id);
    println!("State:      {}", s.state);
    if let Some(reason) = s.end_reason {
        println!("Reason:     {reason}");
    }
    println!("Client:     {}", s.client_id);
    println!("Consultant: {}", s.consultant_id);
    println!("Price:      {}", price_label(s.price));
    println!("Reserved:   {}", s.reserved);
    println!("Captured:   {}", s.captured);
    if s.started_at.is_some() {
        println!("Elapsed:    {}s", view.elapsed_secs);
    }
    if let Some(ends_at) = view.ends_at {
        println!("Ends at:    {}", ends_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if !view.connected.is_empty() {
        println!("Connected:  {}", view.connected.join(", "));
    }
}

fn print_sessions(views: &[SessionView]) {
    if views.is_empty() {
        println!("No sessions.");
        return;
    }
    println!(
        "{:<38} {:<10} {:<12} {:<12} {:>9} {:>9}",
        "ID", "STATE", "CLIENT", "CONSULTANT", "RESERVED", "CAPTURED"
    );
    println!("{}", "-".repeat(95));
    for view in views {
        let s = &view.session;
        println!(
            "{:<38} {:<10} {:<12} {:<12} {:>9} {:>9}",
            s.id,
            s.state.as_str(),
            truncate(&s.client_id, 12),
            truncate(&s.consultant_id, 12),
            s.reserved,
            s.captured
        );
    }
}

fn print_wallet(wallet: &Wallet, consistent: Option<bool>) {
    println!("Wallet:    {} ({})", wallet.id, wallet.currency);
    println!("Available: {}", wallet.available);
    println!("Held:      {}", wallet.held);
    println!("Spent:     {}", wallet.spent);
    if let Some(consistent) = consistent {
        println!("Ledger:    {}", if consistent { "consistent" } else { "MISMATCH" });
    }
}

fn print_entries(entries: &[LedgerEntry]) {
    if entries.is_empty() {
        println!("No entries.");
        return;
    }
    println!(
        "{:<20} {:<8} {:>9} {:<38} {}",
        "TIME", "KIND", "AMOUNT", "SESSION", "KEY"
    );
    println!("{}", "-".repeat(100));
    for e in entries {
        println!(
            "{:<20} {:<8} {:>9} {:<38} {}",
            e.created_at.format("%Y-%m-%d %H:%M:%S"),
            e.kind.as_str(),
            e.amount,
            e.session_id.as_deref().unwrap_or("-"),
            e.idempotency_key.as_deref().unwrap_or("-")
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('~');
        out
    }
}
