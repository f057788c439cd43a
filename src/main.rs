use std::sync::Arc;

use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, TextEncoder};

use oadp_non_admin::config::OperatorConfig;
use oadp_non_admin::controllers::{
    backup_controller, bsl_controller, download_request_controller, restore_controller, State,
};
use oadp_non_admin::util::telemetry;

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let mut config = OperatorConfig::from_env()?;
    let client = kube::Client::try_default().await?;
    config.load_enforced_specs(&client).await?;
    let config = Arc::new(config);

    // Initialize Kubernetes controller state, one controller per tenant kind
    let state = State::default();
    let backup = backup_controller::run(state.clone(), config.clone());
    let restore = restore_controller::run(state.clone(), config.clone());
    let bsl = bsl_controller::run(state.clone(), config.clone());
    let download = download_request_controller::run(state.clone(), config.clone());

    // Start web server
    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5);

    // All runtimes implement graceful shutdown, so poll until every one is done
    tokio::join!(backup, restore, bsl, download, server.run()).4?;
    Ok(())
}
