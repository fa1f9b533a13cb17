use std::{sync::Arc, time::Duration};

use tokio::net::TcpListener;

use pushka::{
    config::Settings,
    logging::{self, LoggingConfig},
    network::{run_server, ServerState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    logging::init_logging(&LoggingConfig::from_settings(&settings))
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let state = Arc::new(ServerState::new(&settings));
    let listener = TcpListener::bind(&settings.listen_addr).await?;

    let shutdown_state = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_state.shutdown();
        }
    });

    run_server(state.clone(), listener).await?;
    state.wait_for_shutdown(Duration::from_secs(10)).await
}
