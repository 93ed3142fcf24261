use std::sync::Arc;

use clap::Parser;

use codebox::config::{CliArgs, Config};
use codebox::coordinator::Coordinator;
use codebox::web_server::build_server;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        engine: engine_config,
        languages,
    } = cli.to_config().map_err(|e| {
        log::error!("Failed to load configuration: {e:#}");
        std::io::Error::other(e)
    })?;

    let coordinator = Coordinator::build(engine_config, &languages).map_err(|e| {
        log::error!("Failed to initialize execution engine: {e:#}");
        std::io::Error::other(e)
    })?;
    if let Err(e) = coordinator.purge_stale_workspaces() {
        log::warn!("Unable to purge stale workspaces: {e:#}");
    }
    let coordinator = Arc::new(coordinator);

    // ======= PREPARATION END, EXECUTION START =======

    let server = build_server(server_config, coordinator.clone())?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Stop admitting executions; queued requests fail fast
    coordinator.shutdown();

    // 2. Shutdown actix-web server gracefully, letting running executions finish
    server_handle.stop(true).await;

    let stats = coordinator.gate_stats();
    log::info!(
        "Shutdown complete ({} executions admitted, {} rejected)",
        stats.acquired,
        stats.rejected
    );
    Ok(())
}
