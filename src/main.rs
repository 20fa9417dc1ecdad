mod config;
mod event;
mod filter;
mod kind;
mod proto;
mod relay;
mod store;
mod validate;
mod ws;

use std::net::SocketAddr;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use config::Settings;
use kind::KindClass;
use relay::Relay;
use store::{IngestOutcome, Store};

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "seqr", author, version, about = "SQLite-backed sequenced event relay")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Launch the WebSocket relay.
    Serve,
    /// Run one or more JSON event files through the ingest pipeline.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
        /// Store files as-is, skipping validation and retention rules.
        #[arg(long)]
        raw: bool,
    },
    /// Print a stored event as JSON.
    Show {
        /// Event id (64 hex characters).
        id: String,
    },
    /// Delete a stored event and its tag index entries.
    Delete {
        /// Event id (64 hex characters).
        id: String,
    },
    /// Delete every revision of a document.
    Purge {
        /// Author public key (64 hex characters).
        pubkey: String,
        /// Syncable kind the document lives under.
        kind: u32,
        /// Document id (`d` tag value).
        doc: String,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::open(&cfg.store_db)?;
    match cli.command {
        Commands::Serve => {
            let addr: SocketAddr = cfg.bind_ws.parse()?;
            info!(%addr, db = %cfg.store_db.display(), "starting relay");
            let relay = Relay::new(store);
            ws::serve(addr, relay, shutdown_signal()).await?;
        }
        Commands::Ingest { files, raw } => {
            for path in files {
                let data =
                    std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
                let ev: event::Event = serde_json::from_str(&data)
                    .with_context(|| format!("parsing event in {path}"))?;
                if raw {
                    let seq = store.insert(&ev)?;
                    info!(id = %ev.id, seq, "stored raw");
                    continue;
                }
                validate::validate_event(&ev, validate::unix_now())
                    .map_err(|e| anyhow!("{path}: {e}"))?;
                let class = validate::classify_kind(&ev).map_err(|e| anyhow!("{path}: {e}"))?;
                if class == KindClass::Purge {
                    validate::purge_target(&ev).map_err(|e| anyhow!("{path}: {e}"))?;
                }
                match store.ingest(&ev, class)? {
                    IngestOutcome::Stored { seq } => info!(id = %ev.id, seq, "stored"),
                    IngestOutcome::Duplicate { seq } => info!(id = %ev.id, seq, "already stored"),
                    IngestOutcome::Superseded { class } => {
                        info!(id = %ev.id, "kept newer {} event", class.label())
                    }
                    IngestOutcome::Ephemeral => info!(id = %ev.id, "ephemeral, not stored"),
                }
            }
        }
        Commands::Show { id } => {
            let ev = store
                .get(&id)?
                .ok_or_else(|| anyhow!("no event with id {id}"))?;
            println!("{}", serde_json::to_string_pretty(&ev)?);
        }
        Commands::Delete { id } => {
            store.delete(&id)?;
            info!(%id, "deleted");
        }
        Commands::Purge { pubkey, kind, doc } => {
            let removed = store.purge_document(&pubkey, kind, &doc)?;
            info!(%pubkey, kind, doc = %doc, removed, "purged document");
        }
    }
    Ok(())
}

/// Resolve when the process is asked to stop.
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    run(Cli::parse()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{event_hash, Event};
    use crate::config::ENV_MUTEX;
    use secp256k1::{Keypair, Message, Secp256k1};
    use std::{fs, time::Duration};
    use tempfile::TempDir;
    use tokio::{net::TcpListener, task};

    fn write_env(dir: &TempDir, bind: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_DB={}\nBIND_WS={}\n",
            dir.path().join("relay.db").display(),
            bind
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    fn signed_event(kind: u32) -> Event {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[1u8; 32]).unwrap();
        let pubkey = kp.x_only_public_key().0;
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(pubkey.serialize()),
            kind,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let hash = event_hash(&ev).unwrap();
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash).unwrap();
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
        ev.sig = hex::encode(sig.as_ref());
        ev
    }

    #[tokio::test]
    async fn run_ingest_stores_event() {
        let _g = ENV_MUTEX.lock().unwrap();
        for v in ["STORE_DB", "BIND_WS"] {
            std::env::remove_var(v);
        }
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "127.0.0.1:0");

        let ev = signed_event(1);
        let ev_path = dir.path().join("ev.json");
        fs::write(&ev_path, serde_json::to_string(&ev).unwrap()).unwrap();
        run(Cli {
            env: env_file,
            command: Commands::Ingest {
                files: vec![ev_path.to_str().unwrap().into()],
                raw: false,
            },
        })
        .await
        .unwrap();

        let store = Store::open(&dir.path().join("relay.db")).unwrap();
        assert_eq!(store.get(&ev.id).unwrap().unwrap(), ev);
    }

    #[tokio::test]
    async fn run_ingest_rejects_invalid() {
        let _g = ENV_MUTEX.lock().unwrap();
        for v in ["STORE_DB", "BIND_WS"] {
            std::env::remove_var(v);
        }
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "127.0.0.1:0");

        let mut ev = signed_event(1);
        ev.sig = "00".repeat(64);
        let ev_path = dir.path().join("bad.json");
        fs::write(&ev_path, serde_json::to_string(&ev).unwrap()).unwrap();
        let result = run(Cli {
            env: env_file,
            command: Commands::Ingest {
                files: vec![ev_path.to_str().unwrap().into()],
                raw: false,
            },
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_serve_answers_connections() {
        let _g = ENV_MUTEX.lock().unwrap();
        for v in ["STORE_DB", "BIND_WS"] {
            std::env::remove_var(v);
        }
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let env_file = write_env(&dir, &format!("127.0.0.1:{port}"));

        let handle = task::spawn(run(Cli {
            env: env_file,
            command: Commands::Serve,
        }));
        tokio::time::sleep(Duration::from_millis(200)).await;

        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::protocol::Message as TungMessage;
        let url = format!("ws://127.0.0.1:{port}/");
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws.send(TungMessage::Text("[\"LASTSEQ\"]".into()))
            .await
            .unwrap();
        let mut got_reply = false;
        while let Some(msg) = ws.next().await {
            if let TungMessage::Text(t) = msg.unwrap() {
                if t.contains("LASTSEQ") {
                    got_reply = true;
                    break;
                }
            }
        }
        assert!(got_reply);
        handle.abort();
    }
}
