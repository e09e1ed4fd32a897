use crate::bridge::Bridge;
use crate::config::Config;
use std::sync::Arc;

pub mod metrics;

pub use metrics::Metrics;

/// Everything request handlers share
pub struct AppState {
    pub config: Arc<Config>,
    pub bridge: Arc<Bridge>,
    pub metrics: Arc<Metrics>,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: Config) -> (Arc<Self>, tokio::sync::broadcast::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(16);

        let metrics = Arc::new(Metrics::new());
        let bridge = Arc::new(Bridge::new(&config).with_metrics(metrics.clone()));

        let state = Arc::new(Self {
            config: Arc::new(config),
            bridge,
            metrics,
            shutdown_tx,
        });

        (state, shutdown_rx)
    }

    /// Ask the HTTP server to stop accepting requests
    pub fn shutdown(&self) {
        // No receivers just means nothing is serving yet
        let _ = self.shutdown_tx.send(());
    }
}
