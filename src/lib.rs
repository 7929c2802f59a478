pub mod dialog;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod settings;
pub mod state_machine;

use std::path::PathBuf;
use std::sync::Arc;

use dialog::{DialogAugmentor, DialogIdentity, HttpDialogBackend, RetryPolicy};
use protocol::ApiParam;
use relay::{HttpTransport, Relay, WorkerPool};
use settings::RelaySettings;

const USAGE: &str = "usage: asr-relay <audio.pcm> [client-output.bin]";

/// Command-line arguments
struct Args {
    audio: PathBuf,
    output: Option<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let audio = args.next().ok_or_else(|| USAGE.to_string())?;
    let output = args.next().map(PathBuf::from);
    if args.next().is_some() {
        return Err(USAGE.to_string());
    }
    Ok(Args {
        audio: PathBuf::from(audio),
        output,
    })
}

fn resolve_settings() -> Result<RelaySettings, String> {
    let mut settings = match settings::settings_path() {
        Ok(path) => {
            log::debug!("Settings: loading {:?}", path);
            settings::load_settings(&path)
        }
        Err(e) => {
            log::warn!("Settings: {}", e);
            RelaySettings::default()
        }
    };
    settings.apply_env_overrides();
    settings.validate()?;
    Ok(settings)
}

/// Relay one raw 16kHz PCM file through the configured ASR and dialog
/// backends, print the final transcript, and optionally write the client
/// byte stream to a file.
pub fn run() -> Result<(), String> {
    let args = parse_args(std::env::args().skip(1))?;
    let settings = resolve_settings()?;

    let audio = std::fs::read(&args.audio)
        .map_err(|e| format!("Failed to read {:?}: {}", args.audio, e))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start runtime: {}", e))?;

    runtime.block_on(async move {
        let pool = WorkerPool::new(tokio::runtime::Handle::current(), settings.worker_pool_size);
        let transport = HttpTransport::new(settings.clone()).map_err(|e| e.to_string())?;

        let identity = DialogIdentity::new(
            settings.dialog.device_id.clone(),
            settings.dialog.user_id.clone(),
        );
        let backend = HttpDialogBackend::new(settings.dialog.clone()).map_err(|e| e.to_string())?;
        let augmentor = DialogAugmentor::new(backend, RetryPolicy::from_settings(&settings.dialog))
            .with_fallback_identity(identity.clone());

        let auth = ApiParam::pcm16k(identity.device_id.clone(), String::new());
        let relay = Relay::new(Arc::new(transport), Arc::new(augmentor), pool, settings);

        log::info!("Relaying {} bytes from {:?}", audio.len(), args.audio);
        let output = relay
            .relay_audio(identity, auth, &audio)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(path) = &args.output {
            std::fs::write(path, output.encode_for_client())
                .map_err(|e| format!("Failed to write {:?}: {}", path, e))?;
            log::info!("Client stream written to {:?}", path);
        }

        match output.transcript() {
            Some(text) => println!("{}", text),
            None => println!(),
        }

        let summary = relay.metrics().lock().await.get_summary();
        log::info!(
            "Session {}: {} ({} frames, augmentation {}, {}ms)",
            output.session_id,
            output.completion.as_str(),
            output.frames.len(),
            output.augmentation.as_str(),
            output.metrics.total_ms
        );
        log::debug!("Metrics summary: {:?}", summary);

        if output.is_complete() {
            Ok(())
        } else {
            Err(output
                .incomplete_error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "session incomplete".to_string()))
        }
    })
}
