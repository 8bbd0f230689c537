//! Standalone mock backend for manual testing.
//!
//! ```bash
//! # Run on the default address 127.0.0.1:8765
//! cargo run --bin chatloop-mockd
//!
//! # Or choose an address
//! CHATLOOP_MOCKD_ADDR=127.0.0.1:9100 cargo run --bin chatloop-mockd
//! ```

use chatloop_mockd::MockBackend;

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let addr =
        std::env::var("CHATLOOP_MOCKD_ADDR").unwrap_or_else(|_| "127.0.0.1:8765".to_string());

    match MockBackend::spawn_on(&addr).await {
        Ok(backend) => {
            tracing::info!(api = %backend.api_url(), channel = %backend.channel_url(), "mock backend up");
            backend.join().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start mock backend");
            std::process::exit(1);
        }
    }
}
