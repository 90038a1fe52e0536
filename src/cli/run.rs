//! Run the orchestration service.
//!
//! Wires the dispatcher to the host transport: one JSON envelope per line on
//! stdin, one reply per line on stdout. Logs go to stderr so they never
//! interleave with protocol output.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use super::config::{default_config_path, PsigridConfig};
use psigrid::engine::{EcdhPsiEngine, EngineError};
use psigrid::protocol::dispatcher;
use psigrid::protocol::readiness::ReadinessGate;
use psigrid::protocol::{error_marker, ErrorNotice, Reply};
use psigrid::session::SessionKeyManager;

pub async fn execute(config_path: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let config = if config_path.exists() {
        PsigridConfig::load(&config_path)?
    } else {
        PsigridConfig::create_default(&config_path)?;
        PsigridConfig::load(&config_path)?
    };
    let structure = config.setup_structure()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // The caller has no visibility into this process beyond the outbound
    // channel, so an uncaught fault anywhere must surface as a diagnostic
    // envelope rather than vanish with the process.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("uncaught panic: {}", panic_info);
        let diagnostic = Reply::Error {
            id: None,
            payload: ErrorNotice {
                error: error_marker::FATAL.to_string(),
                message: panic_info.to_string(),
                original: None,
            },
        };
        println!("{}", diagnostic.to_json());
    }));

    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(64);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if inbound_tx.send(line).await.is_err() {
                break;
            }
        }
        // Dropping the sender closes the inbound channel and stops serving.
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = outbound_rx.recv().await {
            if stdout.write_all(reply.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
            {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    info!("starting psigrid service (config: {})", config_path.display());

    let result = dispatcher::serve(
        async { Ok::<_, EngineError>(EcdhPsiEngine::new()) },
        SessionKeyManager::system(),
        structure,
        inbound_rx,
        outbound_tx,
        ReadinessGate::new(),
    )
    .await;

    reader.abort();
    let _ = writer.await;

    result?;
    Ok(())
}
