/// Live endpoint detection demo
/// Prints utterance events as you speak and saves every utterance as a WAV file
use std::error::Error;
use std::time::Instant;
use voiceloop::audio::{AudioFrame, AudioInput, PulseMicrophone, CHANNELS, SAMPLE_RATE};
use voiceloop::config::AssistantConfig;
use voiceloop::endpoint::{EndReason, EndpointConfig, EndpointDetector, EndpointEvent};

/// Save PCM audio data to a WAV file
fn save_wav(frames: &[AudioFrame], filename: &str) -> Result<(), Box<dyn Error>> {
    let spec = hound::WavSpec {
        channels: u16::from(CHANNELS),
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(filename, spec)?;
    for frame in frames {
        for &sample in &frame.samples {
            writer.write_sample(sample)?;
        }
    }
    writer.finalize()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Endpoint settings come from the same variables as the assistant; the
    // credentials are not needed here.
    let endpoint = AssistantConfig::from_env()
        .map(|cfg| cfg.dialogue.endpoint)
        .unwrap_or_else(|_| EndpointConfig::default());

    println!("🎤 Endpoint Detection Demo");
    println!(
        "Threshold {} | end after {} silent frames | give up after {} | cap {}",
        endpoint.silence_threshold,
        endpoint.max_silence_frames,
        endpoint.initial_wait_frames,
        endpoint.max_duration_frames
    );
    println!("Press Ctrl+C to exit\n");

    let mic = PulseMicrophone::new("endpoint_demo");
    let mut frames = mic.open().await?;
    let mut detector = EndpointDetector::new(endpoint);

    let mut utterance: Vec<AudioFrame> = Vec::new();
    let mut utterances = 0;
    let mut started = Instant::now();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let frame = tokio::select! {
            _ = &mut ctrl_c => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        utterance.push(frame.clone());

        match detector.push(&frame) {
            Some(EndpointEvent::UtteranceStarted) => {
                println!("🗣️  Speech started (peak {})", frame.peak());
                started = Instant::now();
            }
            Some(EndpointEvent::UtteranceEnded(reason)) => {
                utterances += 1;
                let reason = match reason {
                    EndReason::Silence => "silence",
                    EndReason::MaxDuration => "max duration",
                };
                println!("\n🎯 UTTERANCE #{} - ended by {}", utterances, reason);
                println!("⏱️  Speech lasted {:.2}s", started.elapsed().as_secs_f32());

                let filename = format!("utterance_{:03}_{}.wav", utterances, reason.replace(' ', "_"));
                match save_wav(&utterance, &filename) {
                    Ok(()) => println!("💾 Saved: {}", filename),
                    Err(e) => eprintln!("❌ Save error: {}", e),
                }
                println!("{}", "─".repeat(60));
                utterance.clear();
                detector.reset();
            }
            Some(EndpointEvent::Timeout) => {
                println!("🔍 No speech yet, still listening...");
                utterance.clear();
                detector.reset();
            }
            None => {}
        }
    }

    println!("\nDetected {} utterances", utterances);
    Ok(())
}
