use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use echoverse_core::collaborators::{
    DryRunSynthesizer, HeuristicRewriter, OpenAiConfig, OpenAiRewriter, OpenAiSynthesizer,
};
use echoverse_core::strategy::{self, alternatives_within};
use echoverse_core::{
    Document, JobOutput, Processor, ProgressEvent, Rewriter, Settings, SpeedQuality,
    Synthesizer, Tone, Voice,
};

#[derive(Parser, Debug)]
#[command(name = "echoverse")]
#[command(about = "Turn text into tone-adapted narration")]
struct Args {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rewrite and narrate a text file ("-" reads stdin)
    Process {
        input: PathBuf,
        #[arg(long)]
        tone: Option<Tone>,
        #[arg(long)]
        voice: Option<Voice>,
        /// speed, balanced or quality
        #[arg(long)]
        preference: Option<SpeedQuality>,
        /// Write the rewritten text here instead of stdout
        #[arg(long)]
        out_text: Option<PathBuf>,
        /// Write the concatenated WAV audio here
        #[arg(long)]
        out_audio: Option<PathBuf>,
        /// Use the heuristic rewriter and silent audio, no network
        #[arg(long)]
        offline: bool,
        /// Print the job output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the strategy plan and text analysis without processing
    Plan {
        input: PathBuf,
        #[arg(long)]
        preference: Option<SpeedQuality>,
        /// Also list strategies that fit this many seconds
        #[arg(long)]
        budget_secs: Option<u64>,
    },
    /// List the available voices
    Voices,
    /// Write the current (or default) settings file
    InitSettings,
}

/// Initialize tracing/logging with the given directives
fn init_logging(directives: &[&str]) {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in directives {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring log directive '{}': {}", directive, e),
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(&["echoverse=info", "echoverse_core=info"]);

    let args = Args::parse();
    let settings_path = args.settings.unwrap_or_else(Settings::default_path);
    let settings = Settings::load(&settings_path);

    match args.command {
        Command::Process {
            input,
            tone,
            voice,
            preference,
            out_text,
            out_audio,
            offline,
            json,
        } => {
            let text = read_input(&input)?;
            let tone = tone.unwrap_or(settings.default_tone);
            let voice = voice.unwrap_or(settings.default_voice);
            let preference = preference.unwrap_or(settings.pipeline.preference);

            let output = process(&settings, text, tone, voice, preference, offline).await?;
            write_output(&output, out_text.as_deref(), out_audio.as_deref(), json)?;
        }
        Command::Plan {
            input,
            preference,
            budget_secs,
        } => {
            let document = Document::new(read_input(&input)?);
            let preference = preference.unwrap_or(settings.pipeline.preference);
            let plan = strategy::plan(&settings.pipeline.thresholds, document.length(), preference);

            let mut report = serde_json::json!({
                "plan": plan,
                "analysis": document.analyze(),
            });
            if let Some(secs) = budget_secs {
                report["alternatives"] = serde_json::to_value(alternatives_within(
                    document.length(),
                    Duration::from_secs(secs),
                ))?;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Voices => {
            for voice in Voice::ALL {
                println!(
                    "{:<8} {:<6} {:<7} {}",
                    voice.name(),
                    voice.locale().tag(),
                    format!("{:?}", voice.gender()).to_lowercase(),
                    voice.description()
                );
            }
        }
        Command::InitSettings => {
            settings.save(&settings_path)?;
            println!("Settings written to {}", settings_path.display());
        }
    }

    Ok(())
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Remote collaborators when a provider is configured, offline ones otherwise.
fn collaborators(settings: &Settings, offline: bool) -> (Arc<dyn Rewriter>, Arc<dyn Synthesizer>) {
    let provider = settings.provider.clone().or_else(|| {
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .map(|key| OpenAiConfig::new(&key))
    });

    match provider {
        Some(config) if !offline => {
            tracing::info!(base_url = %config.base_url, "Using remote collaborators");
            (
                Arc::new(OpenAiRewriter::new(config.clone())),
                Arc::new(OpenAiSynthesizer::new(config)),
            )
        }
        _ => {
            tracing::info!("Using offline collaborators");
            (Arc::new(HeuristicRewriter::new()), Arc::new(DryRunSynthesizer))
        }
    }
}

async fn process(
    settings: &Settings,
    text: String,
    tone: Tone,
    voice: Voice,
    preference: SpeedQuality,
    offline: bool,
) -> Result<JobOutput> {
    let (rewriter, synthesizer) = collaborators(settings, offline);
    let processor = Processor::new(settings.pipeline.clone(), rewriter, synthesizer)
        .context("Invalid pipeline settings")?;

    let id = processor.submit(text, tone, voice, preference).await;
    let mut events = processor.subscribe(id).await?;
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => report(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                tracing::info!("Interrupted, cancelling job");
                processor.cancel(id).await?;
                cancel_sent = true;
            }
        }
    }

    let output = processor.result(id).await?;
    for warning in &output.warnings {
        match warning.chunk_index() {
            Some(chunk_index) => tracing::warn!(chunk_index, "{}", warning),
            None => tracing::warn!("{}", warning),
        }
    }
    Ok(output)
}

fn report(event: &ProgressEvent) {
    match event {
        ProgressEvent::StrategySelected { plan } => eprintln!(
            "strategy: {} ({} chars, ~{} chunks)",
            plan.strategy, plan.length, plan.estimated_chunks
        ),
        ProgressEvent::ChunksCreated { total, .. } => eprintln!("chunks: {}", total),
        ProgressEvent::ChunkFinished {
            chunk_index,
            state,
            from_cache,
            rewritten_text,
            progress,
        } => eprintln!(
            "[{:>5.1}%] chunk {} {:?}{}: {}",
            progress.percent,
            chunk_index,
            state,
            if *from_cache { " (cached)" } else { "" },
            preview(rewritten_text, 60)
        ),
        ProgressEvent::StateChanged { state, .. } => tracing::debug!(state = %state, "Job state"),
        ProgressEvent::Progress(_) => {}
    }
}

/// First `max` characters of `text` on one line.
fn preview(text: &str, max: usize) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match line.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &line[..end]),
        None => line,
    }
}

fn write_output(
    output: &JobOutput,
    out_text: Option<&Path>,
    out_audio: Option<&Path>,
    json: bool,
) -> Result<()> {
    if let Some(path) = out_audio {
        std::fs::write(path, &output.audio)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), bytes = output.audio.len(), "Audio written");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(output)?);
        return Ok(());
    }

    match out_text {
        Some(path) => std::fs::write(path, &output.rewritten_text)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", output.rewritten_text),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_process_args() {
        let args = Args::try_parse_from([
            "echoverse",
            "process",
            "story.txt",
            "--tone",
            "suspenseful",
            "--voice",
            "james",
            "--preference",
            "speed",
            "--offline",
        ])
        .unwrap();

        match args.command {
            Command::Process {
                tone,
                voice,
                preference,
                offline,
                ..
            } => {
                assert_eq!(tone, Some(Tone::Suspenseful));
                assert_eq!(voice, Some(Voice::James));
                assert_eq!(preference, Some(SpeedQuality::Speed));
                assert!(offline);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_offline_flag_forces_local_collaborators() {
        let settings = Settings {
            provider: Some(OpenAiConfig::new("sk-test")),
            ..Default::default()
        };
        let (rewriter, synthesizer) = collaborators(&settings, true);
        assert_eq!(rewriter.name(), HeuristicRewriter::new().name());
        assert_eq!(synthesizer.name(), DryRunSynthesizer.name());
    }

    #[test]
    fn test_preview_flattens_and_shortens() {
        assert_eq!(preview("One line.\n\nTwo  lines.", 60), "One line. Two lines.");
        assert_eq!(preview("Straße ist lang", 6), "Straße...");
        assert_eq!(preview("", 10), "");
    }

    #[tokio::test]
    async fn test_offline_round_trip_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let text_path = dir.path().join("out.txt");
        let audio_path = dir.path().join("out.wav");

        let output = process(
            &Settings::default(),
            "The storm rolled in over the quiet harbor town. Nobody slept.".to_string(),
            Tone::Suspenseful,
            Voice::Sarah,
            SpeedQuality::Balanced,
            true,
        )
        .await
        .unwrap();
        write_output(&output, Some(&text_path), Some(&audio_path), false).unwrap();

        assert!(!std::fs::read_to_string(&text_path).unwrap().is_empty());
        assert!(std::fs::read(&audio_path).unwrap().starts_with(b"RIFF"));
    }
}
