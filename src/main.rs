use std::path::PathBuf;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kube::Client;
use prometheus::{Encoder, TextEncoder};

pub use istio_operator::{self, telemetry, OperatorConfig, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Directory holding the charts of every supported version, as `<version>/charts/<chart>`
    #[arg(
        long = "resource-directory",
        env = "RESOURCE_DIRECTORY",
        value_name = "DIR",
        default_value = "/var/lib/istio-operator/resources"
    )]
    resource_directory: PathBuf,

    #[arg(long = "helm-binary", env = "HELM_BINARY", default_value = "helm")]
    helm_binary: PathBuf,

    /// Post-renderer that stamps ownership onto rendered manifests
    #[arg(long = "post-renderer", env = "POST_RENDERER", value_name = "PATH")]
    post_renderer: Option<PathBuf>,

    /// Upper bound on IstioRevisions reconciled in parallel
    #[arg(
        long = "max-concurrent-reconciles",
        env = "MAX_CONCURRENT_RECONCILES",
        default_value_t = 4,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    max_concurrent_reconciles: u16,

    #[arg(long = "bind-address", env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: String,

    #[arg(
        long = "log-format",
        env = "LOG_FORMAT",
        value_enum,
        default_value_t = telemetry::LogFormat::Text
    )]
    log_format: telemetry::LogFormat,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
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
    let args: Arguments = Arguments::parse();

    telemetry::init(args.log_format);

    let client = Client::try_default().await?;

    // Initiatilize Kubernetes controller state
    let state = State::new(OperatorConfig {
        resource_directory: args.resource_directory,
        helm_binary: args.helm_binary,
        post_renderer: args.post_renderer,
        max_concurrent_reconciles: args.max_concurrent_reconciles,
    });
    let controller = istio_operator::run(client, state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.bind_address)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
