use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use zyppmon_engine::config::Config;
use zyppmon_engine::engine::{EngineContext, HttpJobClient, SystemTree, TokenStore, TreeEvent};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load().await;
    let settings = config.settings();
    let tokens = Arc::new(TokenStore::new());

    let client = match HttpJobClient::new(config.server_url.clone(), tokens.clone(), settings.request_timeout) {
        Ok(client) => client,
        Err(err) => {
            error!(error = ?err, "Failed to build HTTP client");
            return;
        }
    };

    let ctx = EngineContext::new(Arc::new(client), tokens, settings);
    let tree = SystemTree::root(ctx, config.disabled_systems.clone());
    let mut events = tree.subscribe();

    info!(server = %config.server_url, "Starting zyppmon engine");
    match tree.refresh().await {
        Ok(report) => info!(systems = tree.len(), added = report.added.len(), "System list loaded"),
        Err(err) => warn!(error = %err, "Initial system list refresh failed"),
    }
    tree.start_checking();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(TreeEvent::Changed) => info!(systems = ?tree.usids(), "System tree changed"),
                Ok(TreeEvent::StatusesUpdated) => log_statuses(&tree),
                Ok(TreeEvent::SelfSystemLoaded(usid)) => info!(usid = %usid, "Self system loaded"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Tree event listener lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    tree.stop_checking(true);
    tree.destroy();
}

fn log_statuses(tree: &SystemTree) {
    for system in tree.systems() {
        if system.kind().is_live() {
            info!(usid = %system.usid(), name = %system.label(), status = system.status().label(), "System status");
        }
    }
}
