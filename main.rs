//! Telemetry exporter binary.

use telemetry_engine::TrackingAllocator;

#[global_allocator]
static GLOBAL: TrackingAllocator = TrackingAllocator::new();

/// Main entry point for the telemetry exporter
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry_engine::run_cli().await
}
