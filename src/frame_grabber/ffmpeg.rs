//! FfmpegBackend - Frame decode via the ffmpeg/ffprobe executables
//!
//! ## Responsibilities
//!
//! - Inspect a source with ffprobe (dimensions, frame count)
//! - Network streams: one short-lived ffmpeg per grab, raw RGB on stdout
//! - File sources: one persistent ffmpeg pipe read frame by frame
//! - Classify decoder noise on stderr apart from real failures
//!
//! Short-lived processes run under a wall-clock deadline and are killed
//! when it passes. Readers are driven from `spawn_blocking` and reach the
//! runtime through the `Handle` captured at open.

use super::reader::{FrameBackend, FrameReader, GrabOutcome};
use super::types::{SourceConfig, SourceKind};
use crate::error::{Error, Result};
use image::RgbImage;
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Output, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;

/// Lower-cased stderr fragments that denote a recoverable decode glitch
const DECODER_NOISE: [&str; 6] = [
    "no frame",
    "missing picture",
    "error while decoding",
    "corrupt",
    "non-existing pps",
    "decode_slice_header",
];

/// ffmpeg invocation settings
#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// `tcp` or `udp`
    pub rtsp_transport: String,
    /// Socket I/O timeout handed to ffmpeg
    pub io_timeout: Duration,
    /// Wall-clock limit for one ffmpeg/ffprobe run; the process is killed after it
    pub process_timeout: Duration,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            rtsp_transport: "tcp".to_string(),
            io_timeout: Duration::from_secs(10),
            process_timeout: Duration::from_secs(15),
        }
    }
}

impl FfmpegSettings {
    /// Input options placed before `-i`
    fn input_args(&self, input: &str) -> Vec<String> {
        let micros = self.io_timeout.as_micros().to_string();
        if input.to_ascii_lowercase().starts_with("rtsp://") {
            vec![
                "-rtsp_transport".to_string(),
                self.rtsp_transport.clone(),
                "-timeout".to_string(),
                micros,
            ]
        } else if input.contains("://") {
            vec!["-rw_timeout".to_string(), micros]
        } else {
            Vec::new()
        }
    }
}

/// Result of an ffprobe call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub total_frames: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    /// ffprobe prints this as a string
    nb_frames: Option<String>,
}

/// Parse `ffprobe -of json` output for the first video stream
pub fn parse_stream_info(json: &str) -> Result<StreamInfo> {
    let output: FfprobeOutput = serde_json::from_str(json)?;
    let stream = output
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| Error::Capture("No video stream found".to_string()))?;

    match (stream.width, stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => Ok(StreamInfo {
            width,
            height,
            total_frames: stream
                .nb_frames
                .and_then(|n| n.trim().parse::<u64>().ok())
                .filter(|n| *n > 0),
        }),
        _ => Err(Error::Capture("Video stream has no dimensions".to_string())),
    }
}

/// First stderr line that looks like decoder noise
pub fn classify_decoder_noise(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .find(|line| {
            let lower = line.to_ascii_lowercase();
            DECODER_NOISE.iter().any(|marker| lower.contains(marker))
        })
        .map(|line| line.trim().to_string())
}

/// Run a command to completion, killing it once `deadline` passes
pub async fn output_with_deadline(
    mut command: tokio::process::Command,
    deadline: Duration,
    program: &str,
) -> Result<Output> {
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Capture(format!("{} spawn failed: {}", program, e)))?;

    match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(Error::Capture(format!("{} execution failed: {}", program, e))),
        Err(_) => {
            // Dropping the wait future dropped the child, which kills it
            tracing::warn!(
                program = program,
                timeout_ms = deadline.as_millis() as u64,
                "Process timed out, killed"
            );
            Err(Error::Capture(format!(
                "{} timed out after {}ms",
                program,
                deadline.as_millis()
            )))
        }
    }
}

fn current_runtime() -> Result<Handle> {
    Handle::try_current().map_err(|e| Error::Internal(format!("no tokio runtime: {}", e)))
}

/// Production backend
pub struct FfmpegBackend {
    settings: FfmpegSettings,
}

impl FfmpegBackend {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &FfmpegSettings {
        &self.settings
    }

    /// Read stream dimensions and frame count with ffprobe
    pub async fn inspect(&self, input: &str) -> Result<StreamInfo> {
        let mut command = tokio::process::Command::new(&self.settings.ffprobe_path);
        command
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=width,height,nb_frames"])
            .args(["-of", "json"])
            .args(self.settings.input_args(input))
            .arg(input);
        let output = output_with_deadline(command, self.settings.process_timeout, "ffprobe").await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Capture(format!("ffprobe failed: {}", stderr.trim())));
        }

        parse_stream_info(&String::from_utf8_lossy(&output.stdout))
    }

    /// ffmpeg version line, logged at startup
    pub async fn check_ffmpeg(&self) -> Result<String> {
        let mut command = tokio::process::Command::new(&self.settings.ffmpeg_path);
        command.arg("-version");
        let output = output_with_deadline(command, self.settings.process_timeout, "ffmpeg").await?;

        if !output.status.success() {
            return Err(Error::Capture("ffmpeg version check failed".to_string()));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }
}

impl FrameBackend for FfmpegBackend {
    fn open(&self, config: &SourceConfig) -> Result<Box<dyn FrameReader>> {
        let runtime = current_runtime()?;
        match config.resolved_kind() {
            SourceKind::Stream => {
                let url = config.stream_url();
                let info = runtime.block_on(self.inspect(&url))?;
                tracing::debug!(
                    source_id = %config.id,
                    width = info.width,
                    height = info.height,
                    "Stream inspected"
                );
                Ok(Box::new(StreamReader {
                    runtime,
                    settings: self.settings.clone(),
                    url,
                    info,
                    position: 0,
                    released: false,
                }))
            }
            SourceKind::File => {
                let path = config.local_path();
                let input = path.to_string_lossy().to_string();
                let info = runtime.block_on(self.inspect(&input))?;
                let reader = FileReader::spawn(&self.settings, &input, info)?;
                tracing::debug!(
                    source_id = %config.id,
                    path = %path.display(),
                    width = info.width,
                    height = info.height,
                    total_frames = ?info.total_frames,
                    "File opened"
                );
                Ok(Box::new(reader))
            }
        }
    }
}

fn scale_filter(info: &StreamInfo) -> String {
    format!("scale={}:{}", info.width, info.height)
}

fn frame_len(info: &StreamInfo) -> usize {
    info.width as usize * info.height as usize * 3
}

/// Network stream: one ffmpeg run per grab
struct StreamReader {
    runtime: Handle,
    settings: FfmpegSettings,
    url: String,
    info: StreamInfo,
    position: u64,
    released: bool,
}

impl FrameReader for StreamReader {
    fn read_frame(&mut self) -> GrabOutcome {
        if self.released {
            return GrabOutcome::Failed("Stream released".to_string());
        }

        let mut command = tokio::process::Command::new(&self.settings.ffmpeg_path);
        command
            .args(["-hide_banner", "-loglevel", "error"])
            .args(self.settings.input_args(&self.url))
            .args(["-i", &self.url])
            .args(["-frames:v", "1", "-vf", &scale_filter(&self.info)])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"]);

        let deadline = self.settings.process_timeout;
        let output = match self
            .runtime
            .block_on(output_with_deadline(command, deadline, "ffmpeg"))
        {
            Ok(output) => output,
            Err(e) => return GrabOutcome::Failed(e.to_string()),
        };

        let expected = frame_len(&self.info);
        let stdout_len = output.stdout.len();
        if stdout_len >= expected {
            let mut data = output.stdout;
            data.truncate(expected);
            if let Some(frame) = RgbImage::from_raw(self.info.width, self.info.height, data) {
                self.position += 1;
                return GrabOutcome::Frame(frame);
            }
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        match classify_decoder_noise(&stderr) {
            Some(line) => GrabOutcome::DecoderError(line),
            None if !output.status.success() => {
                GrabOutcome::Failed(format!("ffmpeg failed: {}", stderr.trim()))
            }
            None => GrabOutcome::Failed(format!(
                "short frame: {} of {} bytes",
                stdout_len,
                expected
            )),
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn total_frames(&self) -> Option<u64> {
        None
    }

    fn release(&mut self) {
        self.released = true;
    }
}

/// Decoder noise lines kept before the oldest is discarded
const MAX_PENDING_NOISE: usize = 32;

/// What a persistent ffmpeg has said on stderr
#[derive(Debug, Default)]
struct StderrLog {
    /// Decoder noise not yet reported
    noise: VecDeque<String>,
    last_line: Option<String>,
}

impl StderrLog {
    fn push_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if let Some(noise) = classify_decoder_noise(line) {
            if self.noise.len() == MAX_PENDING_NOISE {
                self.noise.pop_front();
            }
            self.noise.push_back(noise);
        }
        self.last_line = Some(line.to_string());
    }
}

/// File source: persistent rawvideo pipe
struct FileReader {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr_log: Arc<Mutex<StderrLog>>,
    info: StreamInfo,
    position: u64,
}

impl FileReader {
    fn spawn(settings: &FfmpegSettings, input: &str, info: StreamInfo) -> Result<Self> {
        let mut child = Command::new(&settings.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(["-i", input])
            .args(["-vf", &scale_filter(&info)])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Capture(format!("ffmpeg spawn failed: {}", e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Capture("ffmpeg pipes unavailable".to_string()));
        };

        // Drained until ffmpeg closes stderr
        let stderr_log = Arc::new(Mutex::new(StderrLog::default()));
        let sink = stderr_log.clone();
        let drain = std::thread::Builder::new()
            .name("ffmpeg-stderr".to_string())
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(std::io::Result::ok) {
                    sink.lock().unwrap_or_else(PoisonError::into_inner).push_line(&line);
                }
            });
        if let Err(e) = drain {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Capture(format!("stderr reader spawn failed: {}", e)));
        }

        Ok(Self {
            child: Some(child),
            stdout: Some(stdout),
            stderr_log,
            info,
            position: 0,
        })
    }

    fn take_noise(&self) -> Option<String> {
        self.stderr_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .noise
            .pop_front()
    }

    fn last_stderr_line(&self) -> Option<String> {
        self.stderr_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_line
            .clone()
    }

    /// Reap the child once its output is exhausted
    fn finish(&mut self) -> GrabOutcome {
        self.stdout = None;
        match self.child.take().map(|mut child| child.wait()) {
            Some(Ok(status)) if status.success() => GrabOutcome::EndOfStream,
            Some(Ok(status)) => match self.last_stderr_line() {
                Some(line) => GrabOutcome::Failed(format!("ffmpeg exited with {}: {}", status, line)),
                None => GrabOutcome::Failed(format!("ffmpeg exited with {}", status)),
            },
            Some(Err(e)) => GrabOutcome::Failed(format!("ffmpeg wait failed: {}", e)),
            None => GrabOutcome::EndOfStream,
        }
    }
}

impl FrameReader for FileReader {
    fn read_frame(&mut self) -> GrabOutcome {
        // Reported one per call; the frame stays in the pipe for the next read
        if self.stdout.is_some() {
            if let Some(noise) = self.take_noise() {
                return GrabOutcome::DecoderError(noise);
            }
        }
        let Some(stdout) = self.stdout.as_mut() else {
            return GrabOutcome::Failed("File released".to_string());
        };

        let expected = frame_len(&self.info);
        let mut data = vec![0u8; expected];
        let mut filled = 0;

        while filled < expected {
            match stdout.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return GrabOutcome::Failed(format!("pipe read failed: {}", e)),
            }
        }

        if filled == 0 {
            return self.finish();
        }
        if filled < expected {
            self.finish();
            return GrabOutcome::Failed(format!("truncated frame: {} of {} bytes", filled, expected));
        }

        match RgbImage::from_raw(self.info.width, self.info.height, data) {
            Some(frame) => {
                self.position += 1;
                GrabOutcome::Frame(frame)
            }
            None => GrabOutcome::Failed("frame buffer size mismatch".to_string()),
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn total_frames(&self) -> Option<u64> {
        self.info.total_frames
    }

    fn release(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.release();
    }
}
