//! Loopgrid site interconnect service
//!
//! Loads the node configuration, brings the interconnect up and runs until
//! interrupted. Monitoring events are written as structured log lines.
// Copyright 2026 Loopgrid Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use anyhow::{Context, Result};
use interconnect_engine::Interconnect;
use loopgrid_config::AppConfig;
use loopgrid_logging::init_console_logging;
use loopgrid_types::{MonitorRecord, MonitorSink};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

/// Sink that turns monitoring events into structured log lines
struct LogSink;

impl MonitorSink for LogSink {
    fn emit(&self, record: MonitorRecord) {
        match serde_json::to_string(&record) {
            Ok(json) => info!(target: "monitor", event = %json),
            Err(_) => info!(target: "monitor", node = record.node.as_str(), "event"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_console_logging("interconnect-node", "info");

    let config_path: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LOOPGRID_CONFIG").ok())
        .unwrap_or_else(|| "interconnect.json".to_string())
        .into();

    info!(config = %config_path.display(), "Starting interconnect node");

    let app = AppConfig::load(&config_path)
        .with_context(|| format!("failed to load configuration {}", config_path.display()))?;

    let node = Interconnect::start(app.interconnect, Some(Arc::new(LogSink)))
        .await
        .context("failed to start interconnect node")?;

    info!(
        name = node.name(),
        fingerprint = node.fingerprint(),
        "Interconnect node running"
    );

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutdown signal received");

    node.shutdown();
    Ok(())
}
