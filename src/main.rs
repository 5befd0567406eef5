use std::net::SocketAddr;
use std::sync::Arc;

use comfy_sdl::api::routes::{self, AppState};
use comfy_sdl::{AppError, ComfyUIClient, Config, ImageService};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = serve().await {
        tracing::error!(code = e.kind().code(), "{}", e);
        std::process::exit(1);
    }
}

async fn serve() -> Result<(), AppError> {
    Config::dotenv_load();
    let config = Config::new()?;
    Config::print_env_vars();

    let backend = Arc::new(ComfyUIClient::new(config.comfyui_url.clone(), config.request_timeout));
    let service = ImageService::from_config(&config, backend);

    let report = service.reload_workflows().await?;
    if report.loaded == 0 {
        tracing::warn!(dir = %config.workflows_dir.display(), "No usable workflows found");
    }
    let health = service.check_backend_health().await;
    if !health.reachable {
        tracing::warn!(url = %config.comfyui_url, detail = %health.detail, "ComfyUI is not reachable yet");
    }

    let state = Arc::new(AppState::new(service));
    let app = routes::router(state.clone());

    let ip: std::net::IpAddr = config.api_host.parse().unwrap_or_else(|_| {
        tracing::warn!("Invalid API_HOST '{}', falling back to 127.0.0.1", config.api_host);
        std::net::IpAddr::from([127, 0, 0, 1])
    });
    let socket_address = SocketAddr::new(ip, config.api_port);
    tracing::info!("listening on {}", socket_address);

    axum::Server::try_bind(&socket_address)
        .map_err(|e| AppError::Config(format!("cannot bind {socket_address}: {e}")))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
            state.service.gate().close();
        })
        .await
        .map_err(|e| AppError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
}
