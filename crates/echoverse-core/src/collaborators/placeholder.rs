//! Silent WAV audio for placeholders and dry runs.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;

use super::{CollaboratorError, Locale, Synthesizer, Voice};

const SAMPLE_RATE: u32 = 16_000;

/// Speaking rate used to size dry-run audio.
const WORDS_PER_MINUTE: u64 = 150;

/// Shortest clip the dry-run synthesizer produces.
const MIN_CLIP_MS: u64 = 250;

/// Encode `duration_ms` of silence as 16 kHz mono 16-bit WAV.
pub fn silent_wav(duration_ms: u64) -> Result<Bytes, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let samples = SAMPLE_RATE as u64 * duration_ms / 1000;

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for _ in 0..samples {
        writer.write_sample(0i16)?;
    }
    writer.finalize()?;
    Ok(Bytes::from(cursor.into_inner()))
}

/// The pre-baked clip returned when synthesis is exhausted.
/// `None` when disabled (`duration_ms == 0`).
pub fn placeholder_clip(duration_ms: u64) -> Option<Bytes> {
    if duration_ms == 0 {
        return None;
    }
    match silent_wav(duration_ms) {
        Ok(clip) => Some(clip),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode placeholder clip");
            None
        }
    }
}

/// Estimated reading time of `text` in milliseconds.
pub(crate) fn reading_time_ms(text: &str) -> u64 {
    let words = text.split_whitespace().count() as u64;
    (words * 60_000 / WORDS_PER_MINUTE).max(MIN_CLIP_MS)
}

/// Synthesizer that returns silence of the right length without any
/// network access.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunSynthesizer;

#[async_trait]
impl Synthesizer for DryRunSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: Voice,
        locale: Locale,
    ) -> Result<Bytes, CollaboratorError> {
        tracing::debug!(voice = %voice, locale = locale.tag(), chars = text.len(), "Dry-run synthesis");
        silent_wav(reading_time_ms(text)).map_err(|e| CollaboratorError::Other(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}
