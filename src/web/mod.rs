use crate::error::Result;
use crate::state::AppState;
use std::sync::Arc;
use warp::Filter;

pub mod dispatch;

pub const GREETING: &str =
    "hello there! this is a lazycomm server. thank you and have a nice day!";

pub async fn start_server(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.listen_addr();

    tracing::info!("Starting lazycomm server on {}", addr);

    let routes = create_routes(state.clone());

    // Parse address
    let addr: std::net::SocketAddr = addr.parse().map_err(|e| {
        crate::error::LazycommError::Config(crate::error::ConfigError::Parse(format!(
            "Invalid listen address: {}",
            e
        )))
    })?;

    // Start server with graceful shutdown
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown_rx.recv().await;
        })
        .map_err(|e| crate::error::LazycommError::Server(format!("Failed to bind {}: {}", addr, e)))?;

    tracing::info!("Listening on http://{}", bound);
    server.await;

    tracing::info!("lazycomm server stopped");
    Ok(())
}

pub fn create_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    // Index route, any method
    let index = warp::path::end().map(|| GREETING);

    // Prometheus text exposition
    let metrics = warp::path("_metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<AppState>| {
            warp::reply::with_header(
                state.metrics.render(),
                "content-type",
                "text/plain; version=0.0.4",
            )
        });

    index.or(metrics).or(dispatch::route(state))
}

pub(crate) fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}
