#![allow(clippy::expect_used, clippy::doc_markdown, clippy::uninlined_format_args)]
//! Example: List a remote POP3 mailbox and delete messages from it
//!
//! Headers are listed with `TOP n 0`, so nothing but the headers is
//! downloaded. Messages picked for deletion are removed on the server when
//! the session logs out.
//!
//! ## Running
//!
//! ```bash
//! RUST_LOG=mailledger_pop3=debug cargo run --package mailledger-pop3 --example remote_mailbox
//! ```

use std::io::{self, Write};

use mailledger_pop3::{ChannelHandler, Config, MailboxEvent, Security, Session};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn prompt(label: &str) -> io::Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailledger_pop3=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("MailLedger - Remote POP3 Mailbox");
    println!("================================\n");

    let host = prompt("POP3 server")?;
    let username = prompt("User name")?;
    let password = prompt("Password")?;

    let config = Config::builder(host)
        .security(Security::Implicit)
        .username(username)
        .secret(password)
        .build();

    let (handler, mut events) = ChannelHandler::new();
    let handle = Session::new(config).spawn(handler);

    while let Some(event) = events.recv().await {
        match event {
            MailboxEvent::Status(text) => println!("[{}]", text),
            MailboxEvent::HeaderReady(h) => println!(
                "{:>4}  {:<30.30}  {:<25.25}  {:>8}  {}",
                h.ordinal,
                h.from,
                h.subject,
                h.display_size(),
                h.date
            ),
            MailboxEvent::ListingComplete(_) => {
                let picked = prompt("\nMessages to delete (space separated, empty to quit)")?;
                let ordinals: Vec<u32> = picked
                    .split_whitespace()
                    .filter_map(|n| n.parse().ok())
                    .collect();
                if ordinals.is_empty() {
                    handle.close();
                } else {
                    handle.delete(ordinals)?;
                }
            }
            MailboxEvent::MessageDeleted(n) => println!("✓ Deleted message {}", n),
            MailboxEvent::DeletionBatchComplete(_) => handle.close(),
            MailboxEvent::SessionDone => println!("\n✓ Disconnected"),
            MailboxEvent::SessionError(e) => println!("\n✗ {}", e),
            _ => {}
        }
    }

    handle.wait().await?;
    Ok(())
}
