use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use verity::{
    art, grip, nickname, ConfigStore, FileStore, PersistenceError, Principal, PrincipalHandle,
    Spool, TrustMode,
};

#[derive(Parser, Debug)]
#[command(name = "verity")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on for handshake datagrams.
    #[arg(short, long, default_value = "0.0.0.0:5656")]
    bind: SocketAddr,

    /// Path to the signed address-book snapshot.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Path to the PEM identity file. Created when absent.
    #[arg(short, long, default_value = "identity.pem")]
    key: PathBuf,

    /// Peers to send a self-attestation to on startup.
    #[arg(short = 'A', long = "assert", value_name = "ADDR")]
    assertions: Vec<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut principal = load_or_generate_identity(&args.key).await?;
    let key = principal.public_key();

    let store = Arc::new(FileStore::new(args.config.clone()));
    principal.attach_store(store.clone());

    match store.get().await {
        Ok(snapshot) => match principal.load(snapshot, TrustMode::VerifyFirst) {
            Ok(()) => info!(
                peers = principal.peer_count(),
                path = %args.config.display(),
                "address book loaded"
            ),
            Err(e) => warn!(error = %e, "stored address book failed verification, starting empty"),
        },
        Err(PersistenceError::Missing) => {
            info!(path = %args.config.display(), "no stored address book, starting fresh");
        }
        Err(e) => warn!(error = %e, "could not read address book, starting empty"),
    }

    println!("{} ({})", nickname(&key), grip(&key));
    println!("{}", art(&key));

    let handle = PrincipalHandle::spawn(principal);
    let spool = Spool::bind(args.bind, handle.clone()).await?;
    info!(addr = %spool.local_addr(), key = %key, "daemon up");

    let mut errors = spool
        .errors()
        .await
        .expect("error receiver is untaken at startup");
    tokio::spawn(async move {
        while let Some(error) = errors.recv().await {
            warn!(error = %error, "spool error");
        }
    });

    let mut acks = spool
        .acks()
        .await
        .expect("ack receiver is untaken at startup");
    tokio::spawn(async move {
        while let Some(envelope) = acks.recv().await {
            info!(
                from = %envelope.sender_addr,
                peer = %envelope.message.sender,
                reply_to = envelope
                    .message
                    .headers
                    .get(verity::HEADER_REPLY_TO)
                    .map(|s| s.as_str())
                    .unwrap_or("-"),
                "handshake acknowledged"
            );
        }
    });

    for addr in &args.assertions {
        spool
            .send_assertion(*addr)
            .await
            .with_context(|| format!("failed to assert to {addr}"))?;
        info!(to = %addr, "assertion sent");
    }

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, exiting gracefully");

    Ok(())
}

/// Read the identity file, or generate a fresh principal and write one.
/// Bad private-key material is fatal: the daemon cannot run without a
/// valid identity.
async fn load_or_generate_identity(path: &PathBuf) -> Result<Principal> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let principal = Principal::from_pem(&bytes)
                .with_context(|| format!("invalid identity file {}", path.display()))?;
            info!(path = %path.display(), key = %principal.public_key(), "identity loaded");
            Ok(principal)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let principal = Principal::generate();
            tokio::fs::write(path, principal.to_pem())
                .await
                .with_context(|| format!("could not write identity file {}", path.display()))?;
            info!(path = %path.display(), key = %principal.public_key(), "identity generated");
            Ok(principal)
        }
        Err(e) => Err(e).with_context(|| format!("could not read identity file {}", path.display())),
    }
}
