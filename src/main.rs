use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use openmath_inference::api::{self, AppState};
use openmath_inference::config::{Args, ModelSource, ServerConfig};
use openmath_inference::device::probe_with;
use openmath_inference::model::HubModelLoader;
use openmath_inference::solver::{self, EXAMPLE_QUESTION};
use openmath_inference::ModelCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "openmath_inference=info,openmath=info,tower_http=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let force_cpu = args.cpu;
    let loader = HubModelLoader::new(ModelSource::from(&args));
    let cache = Arc::new(ModelCache::with_probe(loader, move || probe_with(force_cpu)));

    if args.script || args.question.is_some() {
        let question = args
            .question
            .clone()
            .unwrap_or_else(|| EXAMPLE_QUESTION.to_string());
        let max_new_tokens = args.max_new_tokens;
        let output = tokio::task::spawn_blocking(move || {
            let handle = cache.get()?;
            solver::solve(&question, max_new_tokens, &handle)
        })
        .await??;

        println!("\n===== OPENMATH OUTPUT =====\n");
        println!("{}", output);
        return Ok(());
    }

    run_server(cache, &args).await
}

async fn run_server(cache: Arc<ModelCache>, args: &Args) -> anyhow::Result<()> {
    let config = ServerConfig::from(args);

    if config.preload {
        let cache = Arc::clone(&cache);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = cache.get() {
                error!("Preload failed: {}", e);
            }
        });
    }

    let state = Arc::new(AppState {
        cache,
        model_id: args.model.clone(),
        web_dir: config.web_dir.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = api::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::new(config.host.parse()?, config.port);

    info!("Serving {} on http://{}", args.model, addr);
    info!("  GET  /            - web front end ({:?})", config.web_dir);
    info!("  GET  /api/status  - model load status");
    info!("  POST /api/solve   - solve a word problem");
    info!("  POST /api/reset   - clear a failed load");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
