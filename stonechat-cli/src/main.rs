//! stonechat-cli — operator frontend for the Stonechat relay HTTP API
//!
//! # Subcommands
//! - `status`                          — show server health
//! - `subscription [--ensure]`        — show or reconcile the webhook subscription
//! - `send <session> <text>`          — post a test visitor message
//! - `messages <session> [--after N]` — poll a session's message log

use clap::{Parser, Subcommand};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8790";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "stonechat-cli",
    version,
    about = "Stonechat chat relay — operator CLI"
)]
struct Cli {
    /// Stonechat HTTP server URL (overrides STONECHAT_HTTP_URL env var)
    #[arg(long, env = "STONECHAT_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show server health
    Status,

    /// Show the recorded webhook subscription
    Subscription {
        /// Reconcile the remote subscription before showing it
        #[arg(long)]
        ensure: bool,

        /// Output the raw server response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send a test visitor message into a session
    Send {
        /// Session key (omit to start a fresh session with a random key)
        session: Option<String>,

        /// Message text
        #[arg(required = true)]
        text: String,

        /// Visitor display name attached to the message
        #[arg(long)]
        name: Option<String>,

        /// Output the raw server response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll a session's message log
    Messages {
        /// Session key
        session: String,

        /// Return only messages with id greater than this cursor
        #[arg(long, default_value_t = 0)]
        after: i64,

        /// Output the raw server response as JSON
        #[arg(long)]
        json: bool,
    },
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

fn fail_on_error_status(resp: reqwest::blocking::Response) -> reqwest::blocking::Response {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("stonechat-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }
    resp
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let client = http_client(10)?;
    let url = format!("{}/health", server);

    match client.get(&url).send() {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!(
                "Stonechat server: {}",
                body["status"].as_str().unwrap_or("unknown")
            );
            println!("Version:          {}", body["version"].as_str().unwrap_or("?"));
            println!(
                "PostgreSQL:       {}",
                body["postgresql"].as_str().unwrap_or("?")
            );
        }
        Ok(r) => {
            eprintln!("stonechat-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("stonechat-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Show (and optionally reconcile) the webhook subscription.
fn do_subscription(server: &str, ensure: bool, json_output: bool) -> anyhow::Result<()> {
    let client = http_client(30)?;

    if ensure {
        let url = format!("{}/subscription/ensure", server);
        let resp = match client.post(&url).send() {
            Ok(r) => r,
            Err(e) => {
                eprintln!("stonechat-cli: cannot reach {}: {}", url, e);
                std::process::exit(1);
            }
        };
        let resp = fail_on_error_status(resp);
        let body: serde_json::Value = resp.json()?;
        if !json_output {
            println!(
                "Reconciled: {}",
                body["outcome"].as_str().unwrap_or("unknown")
            );
        }
    }

    let url = format!("{}/subscription", server);
    let resp = match client.get(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("stonechat-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        eprintln!("stonechat-cli: no subscription recorded; run with --ensure to create one");
        std::process::exit(1);
    }
    let resp = fail_on_error_status(resp);
    let body: serde_json::Value = resp.json()?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        let sub = &body["subscription"];
        println!("Subscription: {}", sub["id"].as_str().unwrap_or("?"));
        println!("Webhook URL:  {}", sub["webhook_url"].as_str().unwrap_or("?"));
        println!("Expires at:   {}", sub["expires_at"].as_str().unwrap_or("?"));
        if let Some(filters) = sub["event_filters"].as_array() {
            for f in filters {
                println!("Filter:       {}", f.as_str().unwrap_or("?"));
            }
        }
    }

    Ok(())
}

/// Send a test visitor message via POST /send_message.
fn do_send(
    server: &str,
    session: Option<String>,
    text: &str,
    name: Option<String>,
    json_output: bool,
) -> anyhow::Result<()> {
    let session_key = session.unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4()));

    let client = http_client(30)?;
    let url = format!("{}/send_message", server);
    let payload = serde_json::json!({
        "session_id": session_key,
        "message": text,
        "visitor_name": name,
    });

    let resp = match client.post(&url).json(&payload).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("stonechat-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    };
    let resp = fail_on_error_status(resp);
    let body: serde_json::Value = resp.json()?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("Session:    {}", session_key);
        println!("Message id: {}", body["message_id"]);
        println!(
            "Delivered:  {}",
            if body["delivered"].as_bool().unwrap_or(false) {
                "yes"
            } else {
                "no (stored locally, forward failed)"
            }
        );
    }

    Ok(())
}

/// Poll a session's log via GET /get_messages.
fn do_messages(server: &str, session: &str, after: i64, json_output: bool) -> anyhow::Result<()> {
    let client = http_client(30)?;
    let url = format!("{}/get_messages", server);

    let resp = match client
        .get(&url)
        .query(&[
            ("session_id", session.to_string()),
            ("last_message_id", after.to_string()),
        ])
        .send()
    {
        Ok(r) => r,
        Err(e) => {
            eprintln!("stonechat-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    };
    let resp = fail_on_error_status(resp);
    let body: serde_json::Value = resp.json()?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!(
        "Session {} ({})",
        session,
        body["session_status"].as_str().unwrap_or("?")
    );
    match body["messages"].as_array() {
        Some(rows) if !rows.is_empty() => {
            for m in rows {
                println!(
                    "  #{} [{}] {}",
                    m["id"],
                    m["sender_type"].as_str().unwrap_or("?"),
                    m["message"].as_str().unwrap_or("")
                );
            }
        }
        _ => println!("  (no messages past cursor {})", after),
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Status => do_status(&server),
        Commands::Subscription { ensure, json } => do_subscription(&server, ensure, json),
        Commands::Send {
            session,
            text,
            name,
            json,
        } => do_send(&server, session, &text, name, json),
        Commands::Messages {
            session,
            after,
            json,
        } => do_messages(&server, &session, after, json),
    };

    if let Err(e) = result {
        eprintln!("stonechat-cli: {}", e);
        std::process::exit(1);
    }
}
