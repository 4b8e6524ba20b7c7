//! Interactive chat over a session.
//!
//! ```text
//! SESSION_WS_URL=ws://127.0.0.1:1018/client-ws SESSION_WS_TOKEN=dev \
//!     cargo run --example chat_session
//! ```
//!
//! Each stdin line is sent as a chat message; streamed replies are printed as
//! they arrive. Ctrl-D closes the session.

use std::io::Write;

use session_ws::{Inbound, Outbound, SessionConfig, SessionStatus, connect_session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SessionConfig::from_env()?;
    let provider = || async { std::env::var("SESSION_WS_TOKEN").ok() };

    let client = connect_session(config, provider).await?;
    info!(session_id = client.session_id(), "session open");

    client.on_status(|status| {
        if status != SessionStatus::Open {
            warn!(%status, "session status changed");
        }
    });
    client.on_message(|msg| match msg {
        Inbound::AssistantTextDelta { text } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        Inbound::AssistantDone => println!(),
        Inbound::ServerEvent { name, data } => info!(%name, ?data, "server event"),
        Inbound::Error { message } => warn!(%message, "server error"),
        Inbound::Other { kind, .. } => info!(%kind, "unhandled message type"),
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() {
            client.send(Outbound::chat(line));
        }
    }

    client.close();
    let stats = client.stats().await?;
    info!(
        opens = stats.opens,
        frames_in = stats.frames_in,
        frames_out = stats.frames_out,
        "session finished"
    );
    Ok(())
}
