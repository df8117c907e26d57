use actix_web::{web, App, HttpServer};
use clap::Parser;
use modelrelay::server::config_routes;
use modelrelay::settings::Settings;
use modelrelay::util::{cors_config_from_env, init_tracing};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Env file first so clap sees its variables.
    init_tracing();
    let settings = Settings::parse();

    let state = web::Data::new(settings.build_state()?);

    tracing::info!(bind = %settings.bind_addr, "Starting modelrelay");
    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .configure(config_routes)
    })
    .bind(&settings.bind_addr)?
    .run()
    .await?;

    Ok(())
}
