use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use shared::domain::{ConversationKey, PeerId};
use storage::DeviceStore;
use sync_core::{
    rest::{RestDurableStore, RestMediaStore},
    DeliveryMarker, MediaStore, MissingMediaStore, MissingTransport, SyncEngine,
};
use tracing::info;

mod config;

#[derive(Parser, Debug)]
struct Args {
    /// Local identity for this device.
    #[arg(long)]
    user: String,
    /// The other party of the conversation.
    #[arg(long)]
    peer: String,
    /// Overrides the durable-store base url from chat.toml / env.
    #[arg(long)]
    store_url: Option<String>,
    /// Optional message to send after the snapshot loads.
    #[arg(long)]
    send: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(store_url) = args.store_url {
        settings.store_url = store_url;
    }

    let conversation = ConversationKey::new(PeerId::new(&args.user), PeerId::new(&args.peer));
    info!(room_key = %conversation.room_key(), "starting conversation sync");

    let mut durable = RestDurableStore::new(&settings.store_url)?;
    if let Some(key) = &settings.api_key {
        durable = durable.with_api_key(key.clone());
    }

    let media: Arc<dyn MediaStore> = match &settings.media_url {
        Some(url) => {
            let mut store = RestMediaStore::new(url)?;
            if let Some(key) = &settings.api_key {
                store = store.with_api_key(key.clone());
            }
            Arc::new(store)
        }
        None => Arc::new(MissingMediaStore),
    };

    let overlay = DeviceStore::new(&settings.device_db).await?;

    // No realtime transport is wired here: the engine stays on the
    // authoritative fetch path and reports Connecting, which is exactly
    // what a headless snapshot/send tool needs.
    let engine = SyncEngine::new_with_dependencies(
        conversation,
        settings.sync_config(),
        Arc::new(durable),
        Arc::new(MissingTransport),
        media,
        Arc::new(overlay),
    );

    engine.start().await?;

    if let Some(text) = &args.send {
        let id = engine.send_text(text).await?;
        println!("sent message id={id}");
    }

    for entry in engine.timeline().await {
        let who = if entry.record.sender == *engine.conversation().local() {
            "me"
        } else {
            entry.record.sender.as_str()
        };
        let when = entry
            .record
            .created_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "<no timestamp>".to_string());
        let body = entry
            .record
            .text
            .as_deref()
            .or(entry.record.image_url.as_deref())
            .or(entry.record.audio_url.as_deref())
            .unwrap_or("<empty>");
        let tick = match entry.marker {
            DeliveryMarker::Pending => "…",
            DeliveryMarker::Failed => "!",
            DeliveryMarker::Sent => "✓",
            DeliveryMarker::Delivered => "✓✓",
            DeliveryMarker::Read => "✓✓ (read)",
        };
        println!("[{when}] {who}: {body} {tick}");
    }

    let presence = engine.presence().await;
    println!(
        "peer online={} typing={} last_active={}",
        presence.online,
        presence.typing,
        presence
            .last_active_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string())
    );

    engine.close().await;
    Ok(())
}
