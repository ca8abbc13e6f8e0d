//! Listener Worker Service - Entry Point
//!
//! Runs a message listener container with health and metrics endpoints.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    listener_worker::run().await
}
