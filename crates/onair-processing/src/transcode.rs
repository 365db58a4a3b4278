//! Loudness-normalizing MP3 transcode

use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use onair_core::{tail_message, MAX_ERROR_MESSAGE_CHARS};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::process::Command;

use crate::probe::ProbeResult;
use crate::toolchain::{Toolchain, ToolchainError};

/// EBU R128 normalization target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessTarget {
    /// Integrated loudness, LUFS.
    pub integrated: f64,
    /// True peak, dBTP.
    pub true_peak: f64,
    /// Loudness range, LU.
    pub range: f64,
}

impl Default for LoudnessTarget {
    fn default() -> Self {
        Self {
            integrated: -14.0,
            true_peak: -1.5,
            range: 11.0,
        }
    }
}

impl LoudnessTarget {
    /// `loudnorm` filter expression. The JSON summary lands on stderr.
    pub fn filter(&self) -> String {
        format!(
            "loudnorm=I={}:TP={}:LRA={}:print_format=json",
            self.integrated, self.true_peak, self.range
        )
    }
}

/// Output loudness reported by `loudnorm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoudnessMeasurement {
    pub integrated_lufs: Option<Decimal>,
    pub true_peak_dbfs: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct LoudnormSummary {
    output_i: Option<String>,
    output_tp: Option<String>,
}

impl LoudnessMeasurement {
    /// Extract the last `loudnorm` JSON summary from ffmpeg's stderr.
    pub fn from_stderr(stderr: &str) -> Option<Self> {
        let end = stderr.rfind('}')?;
        let start = stderr[..end].rfind('{')?;
        let summary: LoudnormSummary = serde_json::from_str(&stderr[start..=end]).ok()?;

        let parse = |v: Option<String>| {
            v.and_then(|s| Decimal::from_str(s.trim()).ok())
                .map(|d| d.round_dp(2))
        };
        let measurement = Self {
            integrated_lufs: parse(summary.output_i),
            true_peak_dbfs: parse(summary.output_tp),
        };
        (measurement != Self::default()).then_some(measurement)
    }
}

#[derive(Debug, Clone)]
pub struct TranscodeRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeOutcome {
    Success {
        measurement: Option<LoudnessMeasurement>,
    },
    /// The transcoder ran and exited non-zero.
    Failed {
        exit_code: Option<i32>,
        /// Tail of the diagnostic output, bounded.
        diagnostics: String,
    },
}

/// The external probe/transcode step.
///
/// `Err` from [`Transcoder::probe`] or [`Transcoder::transcode`] means the tool could
/// not be run at all; a clean non-zero exit is [`TranscodeOutcome::Failed`].
#[async_trait]
pub trait Transcoder: Send + Sync {
    fn resolve_toolchain(&self) -> Result<Toolchain, ToolchainError>;

    async fn probe(&self, toolchain: &Toolchain, input: &Path) -> anyhow::Result<ProbeResult>;

    async fn transcode(
        &self,
        toolchain: &Toolchain,
        request: &TranscodeRequest<'_>,
    ) -> anyhow::Result<TranscodeOutcome>;
}

/// [`Transcoder`] backed by the ffmpeg/ffprobe binaries.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTranscoder {
    ffmpeg_path: Option<String>,
    ffprobe_path: Option<String>,
    target: LoudnessTarget,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: Option<String>, ffprobe_path: Option<String>) -> Self {
        Self {
            ffmpeg_path,
            ffprobe_path,
            target: LoudnessTarget::default(),
        }
    }

    pub fn with_target(mut self, target: LoudnessTarget) -> Self {
        self.target = target;
        self
    }

    fn ffmpeg_args(&self, request: &TranscodeRequest<'_>) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-i".to_string(),
            request.input.display().to_string(),
            "-af".to_string(),
            self.target.filter(),
            "-map_metadata".to_string(),
            "0".to_string(),
            "-c:a".to_string(),
            "libmp3lame".to_string(),
            "-b:a".to_string(),
            format!("{}k", request.bitrate_kbps),
            request.output.display().to_string(),
        ]
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn resolve_toolchain(&self) -> Result<Toolchain, ToolchainError> {
        Toolchain::resolve(self.ffmpeg_path.as_deref(), self.ffprobe_path.as_deref())
    }

    #[tracing::instrument(skip(self, toolchain), fields(input = %input.display()))]
    async fn probe(&self, toolchain: &Toolchain, input: &Path) -> anyhow::Result<ProbeResult> {
        let output = Command::new(&toolchain.ffprobe)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(input)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run ffprobe: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "ffprobe exited with {}: {}",
                output.status,
                tail_message(stderr.trim(), MAX_ERROR_MESSAGE_CHARS)
            ));
        }

        ProbeResult::from_json(&output.stdout)
    }

    #[tracing::instrument(
        skip(self, toolchain, request),
        fields(input = %request.input.display(), bitrate_kbps = request.bitrate_kbps)
    )]
    async fn transcode(
        &self,
        toolchain: &Toolchain,
        request: &TranscodeRequest<'_>,
    ) -> anyhow::Result<TranscodeOutcome> {
        let args = self.ffmpeg_args(request);
        tracing::info!(ffmpeg = %toolchain.ffmpeg.display(), args = ?args, "Running ffmpeg");

        let start = Instant::now();
        let output = Command::new(&toolchain.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run ffmpeg: {}", e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let diagnostics = tail_message(&stderr, MAX_ERROR_MESSAGE_CHARS);
            tracing::error!(
                exit_code = ?output.status.code(),
                stderr = %diagnostics,
                "ffmpeg failed"
            );
            return Ok(TranscodeOutcome::Failed {
                exit_code: output.status.code(),
                diagnostics,
            });
        }

        tracing::info!(
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "ffmpeg finished"
        );

        Ok(TranscodeOutcome::Success {
            measurement: LoudnessMeasurement::from_stderr(&stderr),
        })
    }
}
