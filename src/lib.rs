//! # usenetdav
//!
//! Backend library for a virtual, Usenet-backed file server: ingest NZBs,
//! index their contents (including RAR and multipart sets) without ever
//! downloading a payload up front, and serve arbitrary byte ranges of the
//! resulting logical files on demand.
//!
//! ## Design Philosophy
//!
//! - **On-demand, not download-first** — articles are fetched only when a
//!   streaming reader asks for the bytes they carry.
//! - **Library-first** — no CLI, no WebDAV/SAB-API surface; those are
//!   external collaborators built on top of this crate.
//! - **Event-driven** — consumers subscribe to the event bus rather than
//!   polling queue/history state.
//!
//! ## Quick Start
//!
//! ```no_run
//! use usenetdav::{VirtualUsenetServer, Config, ProviderConfig, Priority};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         providers: vec![ProviderConfig {
//!             host: "news.example.com".to_string(),
//!             port: 563,
//!             tls: true,
//!             username: Some("user".to_string()),
//!             password: Some("pass".to_string()),
//!             max_connections: 10,
//!             priority: 0,
//!             role: usenetdav::ProviderRole::Primary,
//!         }],
//!         ..Default::default()
//!     };
//!
//!     let server = VirtualUsenetServer::new(config).await?;
//!
//!     let mut events = server.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Multi-provider Usenet article fetching.
pub mod client;
/// Configuration types.
pub mod config;
/// Database persistence layer.
pub mod db;
/// Error types.
pub mod error;
/// Event bus fan-out.
pub mod events;
/// Multipart file grouping.
pub mod multipart;
/// NZB parsing and validation.
pub mod nzb;
/// Per-provider connection pooling and admission control.
pub mod pool;
/// Single-writer ingest pipeline.
pub mod queue_manager;
/// Hand-rolled RAR directory-block reader.
pub mod rar;
/// Top-level facade.
pub mod server;
/// On-demand byte-range streaming.
pub mod streaming;
/// Core types and events.
pub mod types;
/// yEnc article decoding.
pub mod yenc;

// Re-export commonly used types
pub use config::{Config, PoolConfig, ProviderConfig, ProviderRole, RetentionConfig, StreamingConfig};
pub use db::Database;
pub use error::{ApiError, Error, ErrorDetail, Result, ToHttpStatus};
pub use server::VirtualUsenetServer;
pub use types::{
    Event, HistoryItem, HistoryStatus, Item, ItemId, ItemKind, JobId, Priority, QueueItem,
    Requester, Stage, UsageContext,
};

/// Run a [`VirtualUsenetServer`] with graceful signal handling.
///
/// Waits for a termination signal and then calls the server's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use usenetdav::{VirtualUsenetServer, Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let server = VirtualUsenetServer::new(config).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(server).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(server: VirtualUsenetServer) -> Result<()> {
    wait_for_signal().await;
    server.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
