use actix_web::{web, App, HttpResponse, HttpServer, middleware::Compress};
use actix_cors::Cors;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_actix_web::TracingLogger;

use smudge::config::AppConfig;
use smudge::external::{ExternalSource, IssoSource};
use smudge::openapi::ApiDoc;
use smudge::rate_limit::{InMemoryRateLimiter, RateLimiterFacade};
use smudge::repo::Repo;
use smudge::{config, AppState, SecurityHeaders};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds; production sets the environment externally.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Bootstrapping smudge server");

    let cfg = AppConfig::from_env();
    if let Err(problems) = cfg.validate() {
        for p in &problems {
            error!("config: {p}");
        }
        anyhow::bail!("invalid configuration ({} problem(s))", problems.len());
    }

    let repo = build_repo(&cfg).await?;

    let external: Option<Arc<dyn ExternalSource>> = match &cfg.isso_url {
        Some(url) => {
            info!(%url, timeout_ms = cfg.isso_timeout.as_millis() as u64, "Merging external comments from Isso");
            Some(Arc::new(IssoSource::new(url.as_str(), cfg.isso_timeout)?))
        }
        None => None,
    };

    let limiter = RateLimiterFacade::new(
        InMemoryRateLimiter::with_capacity(cfg.rate_limit_enabled, cfg.rate_limit_max_tracked),
        cfg.rate_limit.clone(),
    );
    info!(enabled = cfg.rate_limit_enabled, limits = ?cfg.rate_limit, "Rate limiting configured");

    let mut state = AppState::new(repo).with_rate_limiter(limiter).with_limits(cfg.limits.clone());
    state.external = external;

    let prometheus = PrometheusBuilder::new().install_recorder()?;
    let openapi = ApiDoc::openapi();
    let cors_origins = cfg.cors_origins.clone();
    let enable_hsts = cfg.enable_hsts;

    let server = HttpServer::new(move || {
        let cors = if cors_origins.is_empty() {
            // widget is embedded on arbitrary sites
            Cors::default().allow_any_origin()
        } else {
            cors_origins.iter().fold(Cors::default(), |c, origin| c.allowed_origin(origin))
        }
        .allowed_methods(["GET", "POST", "DELETE", "OPTIONS"])
        .allow_any_header()
        .max_age(3600);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(SecurityHeaders::new(enable_hsts))
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .app_data(web::Data::new(prometheus.clone()))
            .configure(config)
            .route("/metrics", web::get().to(render_metrics))
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind(cfg.bind_addr.as_str())?;

    info!("Listening on http://{}", cfg.bind_addr);

    server.run().await?;
    Ok(())
}

async fn render_metrics(handle: web::Data<PrometheusHandle>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(handle.render())
}

async fn build_repo(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Repo>> {
    match &cfg.database_url {
        Some(url) => postgres_repo(url).await,
        None => file_repo(cfg),
    }
}

#[cfg(feature = "postgres-store")]
async fn postgres_repo(url: &str) -> anyhow::Result<Arc<dyn Repo>> {
    use sqlx::postgres::PgPoolOptions;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(url)
        .await?;
    let repo = smudge::repo::pg::PgRepo::new(pool);
    repo.migrate().await?;
    info!("Using Postgres repository backend");
    Ok(Arc::new(repo))
}

#[cfg(not(feature = "postgres-store"))]
async fn postgres_repo(_url: &str) -> anyhow::Result<Arc<dyn Repo>> {
    anyhow::bail!("DATABASE_URL is set but this build lacks the postgres-store feature")
}

#[cfg(feature = "inmem-store")]
fn file_repo(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Repo>> {
    let repo = smudge::repo::inmem::InMemRepo::open(&cfg.data_dir)?;
    info!(dir = %cfg.data_dir.display(), "Using JSON snapshot repository backend");
    Ok(Arc::new(repo))
}

#[cfg(not(feature = "inmem-store"))]
fn file_repo(_cfg: &AppConfig) -> anyhow::Result<Arc<dyn Repo>> {
    anyhow::bail!("no DATABASE_URL and this build lacks the inmem-store feature")
}
