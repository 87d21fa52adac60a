// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

//! vigil agent SDK
//!
//! Build scan agents that run as orchestrator-managed services: read the
//! process settings the orchestrator injects, bind a [`MessageHandler`] to the
//! scan's bus scope and run it until the scan ends.
//!
//! ```no_run
//! use vigil_agent_sdk::{report, run_from_env, AgentError, Delivery, MessageHandler};
//! use vigil_agent_sdk::{ScanReport, VulnerabilityReport, RiskRating};
//!
//! struct Banner;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Banner {
//!     async fn handle(&self, delivery: Delivery<'_>) -> Result<(), AgentError> {
//!         let finding = ScanReport::Vulnerability(VulnerabilityReport {
//!             risk_rating: RiskRating::Info,
//!             title: "Service banner".into(),
//!             technical_detail: None,
//!         });
//!         report(&delivery, &finding).await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run_from_env(Banner).await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod runner;
pub mod settings;

pub use agent::{report, report_fault, BusAgent, MessageHandler};
pub use runner::{AgentRunner, RunOutcome};
pub use settings::{AgentProcessSettings, SettingsError};
pub use vigil_core::domain::message::{AgentError, Delivery};
pub use vigil_core::domain::report::{ScanReport, StatusReport, VulnerabilityReport};
pub use vigil_core::domain::scan::RiskRating;

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Idle period after which an agent started by [`run_from_env`] reports
/// completion, unless the orchestrator set one.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// JSON logs on stdout, filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Cancel `token` on SIGINT or, on unix, SIGTERM (what the backend sends when
/// it removes the service). Handlers are installed before this returns.
pub fn cancel_on_signal(token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        #[cfg(unix)]
        let terminated = async {
            terminate.recv().await;
        };
        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => info!("Interrupt received, shutting down"),
            _ = terminated => info!("Termination requested, shutting down"),
        }
        token.cancel();
    }))
}

/// Entry point for agent binaries: settings from the environment, logging,
/// bus connection, then the receive loop until the scan ends or the process
/// is signalled. Tracing is flushed before this returns.
pub async fn run_from_env<H: MessageHandler + 'static>(handler: H) -> anyhow::Result<RunOutcome> {
    init_logging();
    let settings = AgentProcessSettings::from_env()?;
    let runner = AgentRunner::from_settings(&settings, handler)
        .await?
        .with_idle_timeout(settings.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT));

    let signals = cancel_on_signal(runner.shutdown_token())?;
    let outcome = runner.run().await;
    signals.abort();
    Ok(outcome?)
}
