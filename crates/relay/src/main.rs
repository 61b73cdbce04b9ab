//! Binary entry point of the ingest relay server.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    ingest_relay::run().await
}
