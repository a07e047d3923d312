mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use guildhall_api::auth::decode_token;
use guildhall_api::{AppStateInner, router};
use guildhall_db::Database;
use guildhall_engine::Engines;
use guildhall_engine::clock::SystemClock;
use guildhall_engine::sink::{LogSink, SinkRouter};
use guildhall_gateway::connection;
use guildhall_gateway::{Dispatcher, GatewaySink, WebhookSink};

use crate::config::Config;

#[derive(Clone)]
struct GatewayState {
    dispatcher: Dispatcher,
    jwt_secret: String,
}

#[derive(Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "guildhall=debug,guildhall_engine=debug,guildhall_api=debug,guildhall_gateway=debug,guildhall_db=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let config = Config::from_env()?;
    let db = Arc::new(Database::open(&config.db_path)?);

    let dispatcher = Dispatcher::new();
    let mut sinks = SinkRouter::new()
        .route("gateway", Arc::new(GatewaySink::new(dispatcher.clone())))
        .route("log", Arc::new(LogSink::new()));
    if let Some(url) = &config.webhook_url {
        let webhook = WebhookSink::new(url.clone(), config.sink_timeout)?;
        sinks = sinks.route("webhook", Arc::new(webhook));
        info!("Webhook interface enabled");
    }
    info!(
        interfaces = ?sinks.interfaces().collect::<Vec<_>>(),
        "Message sinks configured"
    );

    let engines = Arc::new(Engines::new(
        db.clone(),
        Arc::new(SystemClock),
        Arc::new(sinks),
        config.engine_config(),
    ));
    engines.start().await?;

    let state = Arc::new(AppStateInner {
        db,
        engines: engines.clone(),
        jwt_secret: config.jwt_secret.clone(),
        contact_interface: "gateway".into(),
    });

    let gateway = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(GatewayState {
            dispatcher,
            jwt_secret: config.jwt_secret.clone(),
        });

    let app = router(state)
        .merge(gateway)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Guildhall listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engines.shutdown().await;
    info!("Guildhall stopped");
    Ok(())
}

/// Browsers cannot set headers on a websocket handshake, so the token may
/// also come as `?token=`.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let header_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let Some(token) = header_token.or(query.token) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Some(claims) = decode_token(&state.jwt_secret, &token) else {
        warn!("Gateway handshake with an invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, claims.sub, claims.username)
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
