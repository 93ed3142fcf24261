use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::{EngineConfig, ServerConfig};
use crate::coordinator::Coordinator;
use crate::routes::{compile_handler, index, json_error_handler, status_handler};

/// Registers the routes on an actix `App`; shared by the server and the tests
pub fn configure_app(cfg: &mut web::ServiceConfig) {
    cfg.service(index)
        .service(compile_handler)
        .service(status_handler);
}

/// JSON extractor settings sized for the largest acceptable request
pub fn json_config(engine: &EngineConfig) -> web::JsonConfig {
    // Code and stdin may be escaped, so leave room for that
    let limit = (engine.max_code_size.0 + engine.max_stdin_size.0) as usize * 2 + 4096;
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(json_error_handler)
}

pub fn build_server(
    server_config: ServerConfig,
    coordinator: Arc<Coordinator>,
) -> std::io::Result<Server> {
    let coordinator = web::Data::from(coordinator);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(coordinator.clone())
            .app_data(json_config(coordinator.config()))
            .wrap(middleware::Logger::default())
            .configure(configure_app)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(3000),
    ))?
    .run();

    Ok(server)
}
