/// Hotword detection service binary
///
/// Listens on a capture source and logs every detected hotword.
///
/// Environment:
/// - `HOTWORD_CONFIG`: JSON configuration file (optional)
/// - `HOTWORD_REFERENCE_WAV`: build model #1 from a keyword recording
/// - `HOTWORD_INPUT_WAV`: replay a WAV file instead of the microphone
/// - `HOTWORD_MODE`: `auto_release` or `always_on`, overrides the config

use anyhow::{bail, Context, Result};
use hotword_detect::{
    AudioSource, ChannelListener, DetectorConfig, HotwordDetect, KeywordModel, ListenerEvent,
    ModelParams, ReplayDevice, ResourceControlMode,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hotword_detect=debug".parse()?),
        )
        .init();

    info!("Starting hotword detection service");

    let config = load_config()?;
    let models = load_models(&config)?;
    let source = open_source()?;
    let mode = config.resource_mode;

    let (listener, mut events) = ChannelListener::new();
    // Acquisition may retry for a while; keep it off the runtime threads
    let detector = tokio::task::spawn_blocking(move || {
        HotwordDetect::create(source, models, config, Arc::new(listener))
    })
    .await?
    .context("failed to create hotword session")?;
    let detector = Arc::new(detector);

    let mut detected_count: u64 = 0;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ListenerEvent::Initializing) => info!("Initializing..."),
                Some(ListenerEvent::Initialized) => info!("Initialized"),
                Some(ListenerEvent::StartDetect) => info!("Listening for hotwords"),
                Some(ListenerEvent::HotwordDetect(id)) => {
                    detected_count += 1;
                    info!("Hotword {} detected [{}]", id, detected_count);

                    if mode == ResourceControlMode::AutoRelease {
                        // Each detection ends the cycle; start the next one.
                        let detector = Arc::clone(&detector);
                        let restarted = tokio::task::spawn_blocking(move || detector.start_detection()).await?;
                        if let Err(e) = restarted {
                            error!("Failed to restart detection: {}", e);
                            break;
                        }
                    }
                }
                None => {
                    info!("Event channel closed, shutting down");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let stats = detector.stats();
    info!("Session stats: {}", serde_json::to_string(&stats)?);

    let detector = Arc::clone(&detector);
    tokio::task::spawn_blocking(move || detector.release()).await?;

    info!("Hotword detection service stopped");
    Ok(())
}

fn load_config() -> Result<DetectorConfig> {
    let mut config = match std::env::var("HOTWORD_CONFIG") {
        Ok(path) => DetectorConfig::from_file(&path)?,
        Err(_) => {
            warn!("HOTWORD_CONFIG not set, using defaults");
            DetectorConfig::default()
        }
    };

    if let Ok(mode) = std::env::var("HOTWORD_MODE") {
        config.resource_mode = mode
            .parse::<ResourceControlMode>()
            .map_err(anyhow::Error::msg)?;
    }

    Ok(config)
}

fn load_models(config: &DetectorConfig) -> Result<Vec<KeywordModel>> {
    let mut models = config.load_models()?;

    if let Ok(path) = std::env::var("HOTWORD_REFERENCE_WAV") {
        let mut reference = ReplayDevice::from_wav(&path)?;
        let samples = read_all(&mut reference)?;
        let model =
            KeywordModel::from_reference(1, &samples, &config.features, ModelParams::default())?;
        models.retain(|m| m.id() != model.id());
        models.push(model);
    }

    if models.is_empty() {
        bail!("no keyword models: set HOTWORD_CONFIG models or HOTWORD_REFERENCE_WAV");
    }
    Ok(models)
}

fn read_all(device: &mut ReplayDevice) -> Result<Vec<i16>> {
    use hotword_detect::CaptureDevice;

    device.open()?;
    let mut samples = Vec::new();
    let mut buf = [0i16; ReplayDevice::CHUNK_SIZE];
    loop {
        let before = device.position();
        let n = device.read(&mut buf)?;
        let fresh = device.position() - before;
        samples.extend_from_slice(&buf[..fresh]);
        if fresh < n || n == 0 {
            break;
        }
    }
    device.close()?;
    Ok(samples)
}

fn open_source() -> Result<AudioSource> {
    if let Ok(path) = std::env::var("HOTWORD_INPUT_WAV") {
        info!("Replaying {}", path);
        return Ok(AudioSource::new(ReplayDevice::from_wav(&path)?.paced(1.0)));
    }

    #[cfg(feature = "mic")]
    return Ok(AudioSource::new(hotword_detect::MicDevice::new()));

    #[cfg(not(feature = "mic"))]
    bail!("no input: set HOTWORD_INPUT_WAV or build with --features mic")
}
