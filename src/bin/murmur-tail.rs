//! murmur-tail: console tail of a user's live notification feed.
//!
//! Activates a [`SyncController`] against the configured backend and push
//! gateway, then prints every feed change until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use murmur::backend::HttpBackend;
use murmur::channel::WsTransport;
use murmur::config::{Cli, Config, DEFAULT_REQUEST_TIMEOUT};
use murmur::mlog;
use murmur::logging;
use murmur::state::FeedEvent;
use murmur::sync::{SyncConfig, SyncController};

#[tokio::main]
async fn main() {
    logging::init();

    let cli = Cli::parse();
    let config = match Config::from_cli_and_env(cli) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(2);
        }
    };

    let backend = Arc::new(HttpBackend::new(
        &config.api_url,
        &config.user_id,
        DEFAULT_REQUEST_TIMEOUT,
    ));
    let transport = Arc::new(WsTransport::new(&config.push_url));
    let mut controller =
        SyncController::new(backend, transport, SyncConfig::for_user(&config.user_id));

    let mut events = controller.subscribe();
    controller.activate().await;
    mlog!(
        "tail: {} notification(s) for {}, {} unread",
        controller.snapshot().await.len(),
        logging::user_id(&config.user_id),
        controller.unread_count().await
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(FeedEvent::Updated { id }) => {
                    if let Some(record) = controller.get(&id).await {
                        mlog!(
                            "tail: {} [{}] {}{}",
                            logging::notif_id(&record.id),
                            record.kind.as_str(),
                            record.text,
                            if record.read { "" } else { " (unread)" }
                        );
                    }
                }
                Ok(FeedEvent::Removed { id }) => {
                    mlog!("tail: removed {}", logging::notif_id(&id));
                }
                Ok(FeedEvent::Unread { count }) => {
                    mlog!("tail: {} unread", count);
                }
                Ok(FeedEvent::Channel { connected }) => {
                    mlog!(
                        "tail: live channel {}",
                        if connected { "connected" } else { "reconnecting" }
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    mlog!("tail: feed lagged, skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    controller.deactivate().await;
    mlog!("tail: session closed");
}
