pub mod audio;
pub mod capabilities;
pub mod error;
pub mod fallback;
pub mod history;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod services;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod transcript;

use std::sync::Arc;

use tokio::net::TcpListener;

use services::Services;
use settings::AppSettings;

/// Run the server until Ctrl-C
pub async fn run(settings: AppSettings) -> Result<(), String> {
    let bind_addr = settings.bind_addr.clone();
    let services = Arc::new(Services::from_settings(settings).await?);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", bind_addr, e))?;
    log::info!("Parley listening on ws://{}{}", bind_addr, server::WS_PATH);

    server::serve(listener, services, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await;

    log::info!("Parley stopped");
    Ok(())
}
