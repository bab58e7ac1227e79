use std::sync::Arc;

use acme::server::{AcmeServer, ServerConfig};
use actix_web::{middleware::Logger, App, HttpServer};
use log::{error, info};

#[actix_web::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_owned());

    let config = match ServerConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load config from {path}: {err}");
            std::process::exit(1);
        }
    };

    let listen = config.listen_addr();
    let server = Arc::new(AcmeServer::new(config));

    info!("Serving {} on {listen}", server.directory_url());

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .service(server.service())
    })
    .bind(listen)?
    .run()
    .await?;

    Ok(())
}
