//! In-process [`Transcoder`] for pipeline and HTTP tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::probe::{ProbeResult, TagMap};
use crate::toolchain::{Toolchain, ToolchainError};
use crate::transcode::{LoudnessMeasurement, TranscodeOutcome, TranscodeRequest, Transcoder};

/// Writes fixed bytes instead of running ffmpeg.
#[derive(Debug)]
pub struct ScriptedTranscoder {
    output: Vec<u8>,
    probe: Option<ProbeResult>,
    exit_failure: Option<String>,
    missing_toolchain: bool,
    launch_failures: AtomicUsize,
    delay: Option<Duration>,
    transcodes: AtomicUsize,
}

impl Default for ScriptedTranscoder {
    fn default() -> Self {
        Self {
            output: b"ID3-normalized-mp3-output".to_vec(),
            probe: Some(ProbeResult {
                duration_seconds: 1.5,
                tags: TagMap::new(),
            }),
            exit_failure: None,
            missing_toolchain: false,
            launch_failures: AtomicUsize::new(0),
            delay: None,
            transcodes: AtomicUsize::new(0),
        }
    }
}

impl ScriptedTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.output = bytes.into();
        self
    }

    pub fn with_probe(mut self, duration_seconds: f64, tags: TagMap) -> Self {
        self.probe = Some(ProbeResult {
            duration_seconds,
            tags,
        });
        self
    }

    /// Probing fails; transcoding still works.
    pub fn with_failing_probe(mut self) -> Self {
        self.probe = None;
        self
    }

    /// Transcode exits non-zero with `stderr`.
    pub fn failing_with(mut self, stderr: impl Into<String>) -> Self {
        self.exit_failure = Some(stderr.into());
        self
    }

    pub fn without_toolchain(mut self) -> Self {
        self.missing_toolchain = true;
        self
    }

    /// The first `n` transcode calls fail to launch.
    pub fn with_launch_failures(self, n: usize) -> Self {
        self.launch_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    /// Number of transcode calls that got past launching.
    pub fn transcodes(&self) -> usize {
        self.transcodes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    fn resolve_toolchain(&self) -> Result<Toolchain, ToolchainError> {
        if self.missing_toolchain {
            return Err(ToolchainError::NotFound {
                name: "ffmpeg".to_string(),
                env: "FFMPEG".to_string(),
            });
        }
        Ok(Toolchain {
            ffmpeg: PathBuf::from("/scripted/ffmpeg"),
            ffprobe: PathBuf::from("/scripted/ffprobe"),
        })
    }

    async fn probe(&self, _toolchain: &Toolchain, _input: &Path) -> anyhow::Result<ProbeResult> {
        self.probe
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ffprobe exited with 1: scripted probe failure"))
    }

    async fn transcode(
        &self,
        _toolchain: &Toolchain,
        request: &TranscodeRequest<'_>,
    ) -> anyhow::Result<TranscodeOutcome> {
        let remaining = self.launch_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.launch_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow::anyhow!("Failed to run ffmpeg: scripted launch failure"));
        }

        self.transcodes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(stderr) = &self.exit_failure {
            return Ok(TranscodeOutcome::Failed {
                exit_code: Some(1),
                diagnostics: stderr.clone(),
            });
        }

        tokio::fs::write(request.output, &self.output).await?;
        Ok(TranscodeOutcome::Success {
            measurement: Some(LoudnessMeasurement {
                integrated_lufs: Some(Decimal::new(-1400, 2)),
                true_peak_dbfs: Some(Decimal::new(-150, 2)),
            }),
        })
    }
}
