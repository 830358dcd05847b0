use std::process::ExitCode;
use std::time::Duration;

use live_translate::client::RealtimeClient;
use live_translate::connection::get_api_key;
use live_translate::{logging, settings};

/// Audio handed to the pipeline per step, mimicking a capture callback
const FRAME_MS: u64 = 100;

/// Time left for server responses after the last frame
const DRAIN_WAIT: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    logging::init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), String> {
    let path = std::env::args()
        .nth(1)
        .ok_or("usage: live-translate <input.wav>")?;
    let credential =
        get_api_key().ok_or("OpenAI API key not configured. Set OPENAI_API_KEY environment variable.")?;

    let (samples, sample_rate) = read_wav_mono(&path)?;
    log::info!(
        "Loaded {} ({} samples at {}Hz, {:.1}s)",
        path,
        samples.len(),
        sample_rate,
        samples.len() as f64 / sample_rate.max(1) as f64
    );

    let settings = settings::load_settings();
    let client = RealtimeClient::from_settings(&settings, &credential).map_err(|e| e.to_string())?;
    client.on_message(|message| log::info!("Server: {}", message.kind()));

    let info = client.start().await.map_err(|e| e.to_string())?;
    log::info!("Streaming into session {}", info.id);

    let frame_len = (sample_rate as u64 * FRAME_MS / 1000).max(1) as usize;
    for frame in samples.chunks(frame_len) {
        client.pipeline().stream_samples(frame, sample_rate).await;
        tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
    }

    if let Err(e) = client.commit().await {
        log::warn!("Commit failed: {}", e);
    }
    tokio::time::sleep(DRAIN_WAIT).await;

    if let Some(metrics) = client.monitor().latest_metrics() {
        log::info!(
            "Performance: {:.2}ms avg processing, {:.1} frames/s",
            metrics.avg_processing_ms,
            metrics.frame_rate
        );
    }
    let pipeline = client.pipeline().stats();
    if let Some(stats) = client.dispose() {
        log::info!(
            "Done: {} slices sent ({} failed, {} dropped), {} messages received, {:.1}s active",
            pipeline.slices_sent,
            pipeline.send_failures,
            pipeline.slices_dropped,
            stats.messages_received,
            stats.active_duration
        );
    }
    Ok(())
}

/// Read a WAV file as mono `f32` samples in [-1.0, 1.0]
fn read_wav_mono(path: &str) -> Result<(Vec<f32>, u32), String> {
    let mut reader =
        hound::WavReader::open(path).map_err(|e| format!("Failed to open {}: {}", path, e))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| format!("Failed to read {}: {}", path, e))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| format!("Failed to read {}: {}", path, e))?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}
