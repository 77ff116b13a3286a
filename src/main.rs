use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use beacon_voice::dialogue::Utterance;
use beacon_voice::voice::{
    AudioCapture, AudioOutput, AudioPlayback, FrameQueue, QueueRecv, SpeechSynthesisStage,
    TextToSpeech, tone,
};
use beacon_voice::{Config, Daemon, POLL_INTERVAL};

/// Beacon Voice - talk to a language model, hands free
#[derive(Parser)]
#[command(name = "beacon-voice", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/omni/beacon-voice/config.toml)
    #[arg(short, long, env = "BEACON_VOICE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Run the spoken conversation loop (default)
    Run,
    /// Type instead of speaking
    Chat {
        /// Print replies without speaking them
        #[arg(long)]
        mute: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,beacon_voice=info",
        1 => "info,beacon_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command.unwrap_or(Command::Run) {
        Command::TestMic { duration } => test_mic(config_path, duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(config_path, &text).await,
        Command::Chat { mute } => {
            let config = Config::load(config_path)?;
            tracing::debug!(?config, "loaded configuration");

            let summary = Daemon::new(config).chat(mute).await?;
            tracing::info!(turns = summary.turns, "chat ended");
            Ok(())
        }
        Command::Run => {
            let config = Config::load(config_path)?;
            tracing::debug!(?config, "loaded configuration");
            tracing::info!(
                llm = %config.llm.model,
                stt = ?config.stt.provider,
                tts = ?config.tts.provider,
                "starting beacon voice"
            );

            let summary = Daemon::new(config).run().await?;
            if summary.ended_by_user {
                tracing::info!(turns = summary.turns, "conversation ended by user");
            } else {
                tracing::info!(turns = summary.turns, "beacon voice stopped");
            }
            Ok(())
        }
    }
}

/// Test microphone input
async fn test_mic(config_path: Option<&std::path::Path>, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let config = Config::load(config_path)?;
    let queue = Arc::new(FrameQueue::new(config.audio.queue_capacity));
    let mut capture = AudioCapture::spawn(
        &config.audio,
        Arc::clone(&queue),
        Box::new(|e: beacon_voice::Error| eprintln!("device error: {e}")),
    )?;

    println!("Device: {}", capture.device_name());
    println!("Sample rate: {} Hz", config.audio.sample_rate);
    println!("---");

    for i in 0..duration {
        let second = Instant::now() + Duration::from_secs(1);
        let mut energy = 0.0_f32;
        let mut frames = 0_u32;
        let mut peak = 0_i16;

        while Instant::now() < second {
            match queue.recv_timeout(POLL_INTERVAL).await {
                QueueRecv::Frame(frame) => {
                    energy += frame.rms();
                    frames += 1;
                    peak = frame
                        .samples()
                        .iter()
                        .map(|s| s.saturating_abs())
                        .fold(peak, i16::max);
                }
                QueueRecv::Empty => {}
                QueueRecv::Closed => anyhow::bail!("capture stopped unexpectedly"),
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let rms = if frames == 0 { 0.0 } else { energy / frames as f32 };
        let peak = f32::from(peak) / 32768.0;

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (rms * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            rms,
            peak,
            meter
        );
    }

    capture.stop();

    println!("\n---");
    println!("Dropped frames: {}", capture.dropped_frames());
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");
    println!("  4. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let playback = AudioPlayback::new()?;
    let sample_rate = 24000;
    let samples = tone(440.0, Duration::from_secs(2), sample_rate, 0.3);

    println!(
        "Playing {} samples at {} Hz (device {} at {} Hz)...",
        samples.len(),
        sample_rate,
        playback.device_name(),
        playback.device_rate()
    );

    let session = playback.session();
    playback.play(session, &samples, sample_rate).await?;
    playback.drain(session).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Test TTS through the streaming synthesis path
async fn test_tts(config_path: Option<&std::path::Path>, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load(config_path)?;
    let synthesizer = Arc::new(TextToSpeech::from_config(&config.tts)?);
    let sink = Arc::new(AudioPlayback::new()?);

    println!(
        "Synthesizing with {:?} ({}, voice {})...",
        config.tts.provider,
        config.tts.format.as_str(),
        config.tts.voice
    );

    let stage = SpeechSynthesisStage::new(synthesizer, sink).with_timeout(config.tts.timeout);
    let (tx, rx) = mpsc::channel(1);
    tx.send(Utterance {
        index: 0,
        text: text.to_string(),
    })
    .await?;
    drop(tx);

    let started = Instant::now();
    let outcome = stage.run(0, rx, CancellationToken::new()).await;
    if let Some(e) = outcome.error {
        anyhow::bail!("TTS failed: {e}");
    }

    println!("Played {} utterance(s) in {:.1?}", outcome.played, started.elapsed());
    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}
