use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod services;
mod store;
mod workflows;

pub use error::{ApiError, ApiResult, AppError};

#[cfg(test)]
mod tests;

use jobs::{JobLockService, JobScheduler};
use services::{AiClient, DataEventSender, EmailService, PgDocumentStore};
use store::PgWorkflowStore;
use workflows::{dispatch_events, ScriptSandbox, TriggerMatcher, WorkflowEngine, WorkflowExecutor};

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub engine: WorkflowEngine,
    pub events: DataEventSender,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let store = Arc::new(PgWorkflowStore::new(db_pool.clone()));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let documents = Arc::new(PgDocumentStore::new(db_pool.clone()).with_events(events_tx.clone()));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let sandbox = ScriptSandbox::new(
        documents.clone(),
        config.workflow.script_timeout(),
        config.workflow.script_memory_bytes(),
    );
    let mut executor = WorkflowExecutor::new(http.clone(), documents, sandbox)
        .with_env(config.workflow.template_env());

    if config.smtp.is_configured() {
        executor = executor.with_email(Arc::new(EmailService::new(&config.smtp)?));
    } else {
        tracing::warn!("SMTP_HOST not set, SendEmail actions will fail");
    }

    match &config.ai {
        Some(ai) => {
            tracing::info!("AI content generation via {:?} ({})", ai.provider, ai.model);
            executor = executor.with_ai(Arc::new(AiClient::new(http.clone(), ai)));
        }
        None => tracing::warn!("AI_API_KEY not set, GenerateAIContent actions will fail"),
    }

    let engine = WorkflowEngine::new(
        store.clone(),
        executor,
        JobLockService::new(store),
        config.workflow.engine(),
    );
    let matcher = TriggerMatcher::new(engine.clone());

    let scheduler = JobScheduler::new(matcher.clone(), config.workflow.jobs()).await?;
    scheduler.start().await?;

    tokio::spawn(dispatch_events(events_rx, matcher, scheduler.clone()));

    let app_state = Arc::new(AppState {
        db_pool,
        engine,
        events: events_tx,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Flowcore Workflow Engine v0.1.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/runs", handlers::run_routes())
        .nest("/api/v1/events", handlers::event_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app).await?;

    scheduler.shutdown().await?;
    Ok(())
}
