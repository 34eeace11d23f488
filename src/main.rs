use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use lostpet::config::AppConfig;
use lostpet::credential::CredentialGuard;
use lostpet::openapi::ApiDoc;
use lostpet::rate_limit::{InMemoryRateLimiter, RateLimiterFacade};
use lostpet::repo::PostRepo;
use lostpet::storage::build_blob_store;
use lostpet::{config, AppState, PostService};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env automatically only in debug builds; production sets the environment externally.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid configuration: {e:#}");
            std::process::exit(1);
        }
    };
    info!("Bootstrapping lost pet listings server");

    let repo = match build_repo(&cfg).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Failed to initialise repository: {e:#}");
            std::process::exit(1);
        }
    };
    let blobs = match build_blob_store(&cfg).await {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to initialise blob store: {e:#}");
            std::process::exit(1);
        }
    };
    let guard = match CredentialGuard::new(cfg.hash_cost) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Invalid ARGON2_* settings: {e}");
            std::process::exit(1);
        }
    };
    let metrics = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(h) => Some(h),
        Err(e) => {
            warn!("Prometheus recorder not installed: {e}");
            None
        }
    };

    let service = PostService::new(repo, blobs, guard)
        .with_limits(cfg.limits)
        .with_cleanup(cfg.cleanup);
    let mut state = AppState::new(service).with_upload_prefix(&cfg.upload_url_prefix);
    state.rate_limiter = Some(RateLimiterFacade::new(
        InMemoryRateLimiter::new(cfg.rate_limit_enabled),
        cfg.rate_limits.clone(),
    ));
    state.metrics = metrics;
    let openapi = ApiDoc::openapi();
    let frontend_url = cfg.frontend_url.clone();

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                .allowed_origin("http://localhost:3000")
                .allowed_origin("http://127.0.0.1:3000")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "DELETE", "OPTIONS"])
                .max_age(3600);
            if let Some(front) = &frontend_url {
                c = c.allowed_origin(front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .configure(config)
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind((cfg.bind_addr.as_str(), cfg.port))?;

    info!("Listening on http://{}:{}", cfg.bind_addr, cfg.port);

    server.run().await
}

/// Postgres when `DATABASE_URL` is set, otherwise the in-memory store.
async fn build_repo(cfg: &AppConfig) -> anyhow::Result<Arc<dyn PostRepo>> {
    match &cfg.database_url {
        Some(url) => postgres_repo(url, cfg).await,
        None => fallback_repo(cfg),
    }
}

#[cfg(feature = "postgres-store")]
async fn postgres_repo(url: &str, cfg: &AppConfig) -> anyhow::Result<Arc<dyn PostRepo>> {
    let repo = lostpet::repo::pg::PgRepo::connect_lazy(
        url,
        cfg.db_max_connections,
        cfg.db_acquire_timeout,
        cfg.db_idle_tx_timeout,
    )?;
    repo.migrate().await?;
    info!("Using Postgres repository backend");
    Ok(Arc::new(repo))
}

#[cfg(not(feature = "postgres-store"))]
async fn postgres_repo(_url: &str, _cfg: &AppConfig) -> anyhow::Result<Arc<dyn PostRepo>> {
    Err(anyhow::anyhow!("DATABASE_URL is set but this build lacks the postgres-store feature"))
}

#[cfg(feature = "inmem-store")]
fn fallback_repo(cfg: &AppConfig) -> anyhow::Result<Arc<dyn PostRepo>> {
    let path = cfg.data_dir.join("state.json");
    warn!("DATABASE_URL not set; using in-memory repository snapshotted to '{}'", path.display());
    Ok(Arc::new(lostpet::repo::inmem::InMemRepo::with_snapshot(path)))
}

#[cfg(not(feature = "inmem-store"))]
fn fallback_repo(_cfg: &AppConfig) -> anyhow::Result<Arc<dyn PostRepo>> {
    Err(anyhow::anyhow!("DATABASE_URL must be set (built without inmem-store)"))
}
