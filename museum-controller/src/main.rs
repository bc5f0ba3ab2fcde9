use std::sync::Arc;

use anyhow::{Context, Result};
use bus_gateway::{BusGateway, GatewayHandle, InboundMessage, MemoryBus, MqttGateway};
use clap::Parser;
use museum_scene::SceneLibrary;
use show_engine::{
    init_logging, LoggingMediaPlayer, SceneTrigger, ShowController, ShowEvent, ShowHandle,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

mod settings;

use settings::{Args, Settings};

/// Log the effective configuration
fn print_summary(settings: &Settings) {
    info!("Configuration:");
    info!("  Room: {}", settings.engine.room);
    if settings.dry_run {
        info!("  Broker: none (dry run)");
    } else {
        info!(
            "  Broker: {}:{} as {}",
            settings.gateway.host, settings.gateway.port, settings.gateway.client_id
        );
    }
    info!("  Scenes: {}", settings.scenes_dir.join(&settings.engine.room).display());
    info!("  Default scene: {}", settings.default_scene);
    info!(
        "  Feedback: {} ({:?}, {}ms)",
        if settings.engine.feedback_tracking { "tracked" } else { "off" },
        settings.engine.feedback_channel,
        settings.engine.tracker.timeout.as_millis()
    );
    info!(
        "  Device staleness: {}s",
        settings.engine.registry.stale_after.as_secs()
    );
    match settings.media_playback {
        Some(duration) => info!("  Media: simulated, {}ms per file", duration.as_millis()),
        None => info!("  Media: simulated, playback never ends"),
    }
}

type Bus = (
    Arc<dyn BusGateway>,
    Option<GatewayHandle>,
    Option<mpsc::Receiver<InboundMessage>>,
);

/// Connect to the broker, or build an in-memory bus for a dry run.
fn connect_bus(settings: &Settings) -> Result<Bus> {
    if settings.dry_run {
        return Ok((Arc::new(MemoryBus::new()), None, None));
    }

    let (inbound_tx, inbound_rx) = mpsc::channel(settings.gateway.inbound_capacity);
    let (gateway, handle) = MqttGateway::connect(settings.gateway.clone(), inbound_tx)
        .context("Failed to start MQTT gateway")?;
    let gateway: Arc<dyn BusGateway> = gateway;
    Ok((gateway, Some(handle), Some(inbound_rx)))
}

/// Wire the scene library and media player into a controller.
fn build_show(settings: &Settings, bus: Arc<dyn BusGateway>) -> Result<(ShowController, ShowHandle)> {
    let library = SceneLibrary::new(
        settings.scenes_dir.clone(),
        settings.engine.room.clone(),
        settings.default_scene.clone(),
    );
    let mut media = LoggingMediaPlayer::new();
    if let Some(duration) = settings.media_playback {
        media = media.with_playback_duration(duration);
    }

    ShowController::new(settings.engine.clone(), library, bus, Arc::new(media))
        .context("Failed to create show controller")
}

/// Log show events for operators watching the console.
async fn log_events(mut events: broadcast::Receiver<ShowEvent>) {
    loop {
        match events.recv().await {
            Ok(ShowEvent::SceneStarted { scene_id, state }) => {
                info!("Scene '{}' started in '{}'", scene_id, state)
            }
            Ok(ShowEvent::SceneStopped { scene_id, reason }) => {
                info!("Scene '{}' finished ({})", scene_id, reason)
            }
            Ok(ShowEvent::SceneRejected { trigger, reason }) => {
                warn!("Rejected {}: {}", trigger, reason)
            }
            Ok(ShowEvent::Presence(change)) => info!("Device {}", change),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log lagged, {} events skipped", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn wait_for_gateway_failure(gateway: Option<&GatewayHandle>) -> Option<String> {
    match gateway {
        Some(handle) => handle.fatal().await.map(|fatal| fatal.to_string()),
        None => std::future::pending().await,
    }
}

async fn run(settings: Settings) -> Result<()> {
    if settings.list_scenes {
        let library = SceneLibrary::new(
            settings.scenes_dir.clone(),
            settings.engine.room.clone(),
            settings.default_scene.clone(),
        );
        let scenes = library
            .list()
            .with_context(|| format!("Failed to list {}", library.room_dir().display()))?;
        for scene in scenes {
            println!("{scene}");
        }
        return Ok(());
    }

    let (bus, gateway, inbound_rx) = connect_bus(&settings)?;
    let (controller, handle) = build_show(&settings, bus)?;

    let event_log = tokio::spawn(log_events(handle.subscribe()));
    let forwarder = inbound_rx.map(|rx| handle.forward_inbound(rx));
    let mut controller_task = tokio::spawn(controller.run());

    if settings.start {
        handle
            .start_scene(SceneTrigger::Default)
            .await
            .context("Failed to start default scene")?;
    }

    info!("Show controller ready, press Ctrl+C to stop");
    let mut failure = None;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down");
        }
        fatal = wait_for_gateway_failure(gateway.as_ref()) => {
            if let Some(fatal) = fatal {
                error!("MQTT gateway failed: {}", fatal);
                failure = Some(fatal);
            }
        }
        result = &mut controller_task => {
            result.context("Show controller panicked")??;
            warn!("Show controller stopped on its own");
        }
    }

    if !controller_task.is_finished() {
        if let Err(e) = handle.shutdown().await {
            warn!("Show controller already stopped: {}", e);
        }
        controller_task
            .await
            .context("Show controller panicked")?
            .context("Show controller failed during shutdown")?;
    }
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    event_log.abort();

    if let Some(gateway) = gateway {
        if let Err(e) = gateway.shutdown().await {
            warn!("Failed to shut down MQTT gateway: {}", e);
        }
    }

    info!("Final status: {}", serde_json::to_string(&handle.status())?);
    match failure {
        Some(fatal) => Err(anyhow::anyhow!("Broker unreachable: {fatal}")),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::resolve(Args::parse()).context("Failed to load settings")?;
    init_logging(settings.log_mode).context("Failed to initialize logging")?;
    print_summary(&settings);

    match run(settings).await {
        Ok(()) => {
            info!("Show controller exited cleanly");
            Ok(())
        }
        Err(e) => {
            error!("Show controller failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
