//! CLI entry point for the crawl export tool.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use clap::Parser;
use crawl_export::{
    ChunkFetcher, EngineConfig, FatalKind, HttpTransport, SessionError, SessionRequest,
    StatusClass, TransferEngine, TransferError, TransportError, classify_status,
};
use tracing::{debug, info};

mod cli;
mod progress;

use cli::Args;

/// API root override, used to point the tool at a staging or mock server.
const BASE_URL_ENV: &str = "CRAWL_EXPORT_API_URL";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr; stdout carries TSV rows in console mode.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(
        crawl = args.crawl,
        output = ?args.output,
        detail = args.detail(),
        resume = !args.no_resume,
        "CLI arguments parsed"
    );

    let transport = match std::env::var(BASE_URL_ENV) {
        Ok(base_url) => HttpTransport::with_base_url(&base_url, &args.username, &args.password)?,
        Err(_) => HttpTransport::new(&args.username, &args.password)?,
    };
    debug!(base_url = %transport.base_url(), "API transport ready");
    let fetcher = ChunkFetcher::new(Arc::new(transport), args.crawl);
    let config = EngineConfig {
        initial_chunk_size: args.chunk_size,
        ..EngineConfig::default()
    };
    let engine = TransferEngine::new(fetcher, config);

    let request = match &args.output {
        Some(path) => SessionRequest::to_file(path, args.detail(), !args.no_resume),
        None => SessionRequest::to_console(args.detail()),
    };
    let session = engine.open_session(&request).await.map_err(|e| {
        let message = session_message(&e);
        anyhow::Error::new(e).context(message)
    })?;

    let use_spinner = session.has_checkpoint() && !args.quiet;
    let (progress_handle, stop) = progress::spawn_progress_ui(use_spinner, engine.status());

    let result = engine.run(session).await;

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    let outcome = result.map_err(|e| {
        let message = transfer_message(&e);
        anyhow::Error::new(e).context(message)
    })?;

    info!(
        total = outcome.total_elements,
        rows_written = outcome.rows_written,
        chunks = outcome.chunks_fetched,
        resumed = outcome.resumed,
        errors = engine.status().error_count(),
        "Export complete"
    );
    Ok(())
}

/// User-facing explanation of a fatal status code.
fn fatal_message(kind: FatalKind, status: u16) -> String {
    match kind {
        FatalKind::AccessDenied | FatalKind::NotFound => kind.to_string(),
        FatalKind::UnknownClientError | FatalKind::UnexpectedStatus => {
            format!("Unknown error occurred (code {status}).")
        }
    }
}

/// User-facing explanation of an aborted transfer.
fn transfer_message(error: &TransferError) -> String {
    match error {
        TransferError::ClientFatal { kind, status } => fatal_message(*kind, *status),
        // The server answered every attempt, just never with 200.
        TransferError::TransportFatal {
            source: TransportError::UnexpectedStatus { status, .. },
            ..
        } => match classify_status(*status) {
            StatusClass::Fatal(kind) => fatal_message(kind, *status),
            _ => format!("Unknown error occurred (code {status})."),
        },
        TransferError::TransportFatal { .. } => {
            "Network error; please check your connection to the internet and resume download."
                .to_string()
        }
        other => other.to_string(),
    }
}

/// User-facing explanation of a session that could not start.
fn session_message(error: &SessionError) -> String {
    match error {
        SessionError::Probe(inner) => transfer_message(inner),
        other => other.to_string(),
    }
}
