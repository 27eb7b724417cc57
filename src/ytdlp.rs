//! Thin wrapper around the yt-dlp executable.
//!
//! All calls are synchronous (`std::process::Command`); the server runs them
//! inside `spawn_blocking`. A configured timeout kills a hung process so it
//! cannot hold a job slot forever. Conversion is done by ffmpeg through yt-dlp's own
//! post-processors, so ffmpeg never has to be spawned directly.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

use crate::media::{OutputFormat, Variant, VideoInfo};

/// Output template relative to the per-download directory.
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
/// Emitted once per finished file so we never have to guess the final name.
const PRINT_TEMPLATE: &str = "after_move:%(.{title,filepath})j";
const WAV_POSTPROCESSOR_ARGS: &str = "ExtractAudio+ffmpeg_o:-ar 44100 -ac 2 -sample_fmt s16";

/// Suffixes yt-dlp uses for in-progress or sidecar files.
const SKIPPED_SUFFIXES: &[&str] = &[".part", ".ytdl", ".json", ".temp", ".tmp", ".description"];
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "mp3", "wav", "m4a", "webm", "mkv", "opus", "ogg"];
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    ffmpeg_location: Option<PathBuf>,
    timeout: Option<Duration>,
}

/// A file produced by a successful download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub file_name: String,
    pub title: String,
}

#[derive(Deserialize)]
struct PrintedFile {
    title: Option<String>,
    filepath: Option<String>,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>, ffmpeg_location: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ffmpeg_location,
            timeout: None,
        }
    }

    /// Kills any yt-dlp run that takes longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs `--dump-single-json` without downloading anything.
    pub fn probe(&self, url: &str) -> Result<VideoInfo> {
        tracing::debug!(url, "probing media");
        let mut command = Command::new(&self.binary);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--no-playlist")
            .arg(url);
        let output = self.run(&mut command)?;
        ensure_success(&output)?;

        serde_json::from_slice(&output.stdout).context("parsing yt-dlp metadata response")
    }

    /// Downloads `url` into `output_dir`, converting to the requested
    /// container, and returns the produced file.
    pub fn download(&self, url: &str, variant: Variant, output_dir: &Path) -> Result<DownloadedFile> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;

        tracing::info!(url, variant = %variant.label(), dir = %output_dir.display(), "starting download");
        let mut command = Command::new(&self.binary);
        command.args(self.download_args(url, variant, output_dir));
        let output = self.run(&mut command)?;
        ensure_success(&output)?;

        let printed = String::from_utf8_lossy(&output.stdout);
        if let Some(file) = printed_file(&printed, output_dir) {
            return Ok(file);
        }

        // Older yt-dlp builds ignore the dict template; fall back to looking at
        // what landed on disk.
        let path = find_output_file(output_dir, variant.format)?
            .ok_or_else(|| anyhow!("File not found after download"))?;
        let title = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().replace('_', " "))
            .unwrap_or_else(|| "video".to_string());
        downloaded_file(path, title)
    }

    /// Spawns `command` and collects its output, killing it once the timeout
    /// passes. Both pipes are drained on their own threads so a large
    /// metadata dump cannot stall the child.
    fn run(&self, command: &mut Command) -> Result<Output> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("launching {}", self.binary.display()))?;
        let stdout = child.stdout.take().map(drain_pipe);
        let stderr = child.stderr.take().map(drain_pipe);

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let status = loop {
            if let Some(status) = child.try_wait().context("waiting for yt-dlp")? {
                break status;
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                if let Err(err) = child.kill() {
                    tracing::warn!("could not kill timed out yt-dlp: {err}");
                }
                // Reap; the reader threads are left to finish on their own.
                child.wait().context("reaping timed out yt-dlp")?;
                let secs = self.timeout.map(|timeout| timeout.as_secs()).unwrap_or_default();
                tracing::warn!(timeout_secs = secs, "yt-dlp timed out, killed");
                bail!("yt-dlp timed out after {secs}s");
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(Output {
            status,
            stdout: collect_pipe(stdout),
            stderr: collect_pipe(stderr),
        })
    }

    fn download_args(&self, url: &str, variant: Variant, output_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();

        match variant.format {
            OutputFormat::Mp3 => {
                let kbps = variant.quality.unwrap_or(320);
                args.extend(
                    [
                        "--format",
                        "bestaudio/best",
                        "--extract-audio",
                        "--audio-format",
                        "mp3",
                        "--audio-quality",
                    ]
                    .map(OsString::from),
                );
                args.push(format!("{kbps}K").into());
            }
            OutputFormat::Wav => {
                args.extend(
                    [
                        "--format",
                        "bestaudio/best",
                        "--extract-audio",
                        "--audio-format",
                        "wav",
                        "--postprocessor-args",
                        WAV_POSTPROCESSOR_ARGS,
                    ]
                    .map(OsString::from),
                );
            }
            OutputFormat::Mp4 => {
                args.push("--format".into());
                args.push(mp4_format_selector(variant.quality).into());
                args.push("--merge-output-format".into());
                args.push("mp4".into());
            }
        }

        if let Some(location) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".into());
            args.push(location.into());
        }

        args.extend(
            [
                "--no-playlist",
                "--restrict-filenames",
                "--no-progress",
                "--no-warnings",
                "-o",
            ]
            .map(OsString::from),
        );
        args.push(output_dir.join(OUTPUT_TEMPLATE).into());
        args.extend(["--print", PRINT_TEMPLATE, "--no-simulate", url].map(OsString::from));
        args
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(err) = pipe.read_to_end(&mut buf) {
            tracing::debug!("yt-dlp pipe closed early: {err}");
        }
        buf
    })
}

fn collect_pipe(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn mp4_format_selector(max_height: Option<u32>) -> String {
    match max_height {
        Some(height) => format!(
            "bestvideo[height<={height}][ext=mp4]+bestaudio[ext=m4a]/best[height<={height}][ext=mp4]/best"
        ),
        None => "best[ext=mp4]/bestvideo[ext=mp4]+bestaudio[ext=m4a]/best".to_string(),
    }
}

fn ensure_success(output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    match error_summary(&stderr) {
        Some(message) => bail!("{message}"),
        None => bail!("yt-dlp exited with {}", output.status),
    }
}

/// Picks the most useful line out of yt-dlp's stderr: the last `ERROR:` line,
/// or the last non-empty line.
fn error_summary(stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|line| line.to_string())
}

/// Reads the JSON lines produced by `--print`, keeping the last one that
/// names an existing file inside `output_dir`.
fn printed_file(stdout: &str, output_dir: &Path) -> Option<DownloadedFile> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<PrintedFile>(line.trim()).ok())
        .filter_map(|printed| {
            let path = PathBuf::from(printed.filepath?);
            (path.is_file() && path.starts_with(output_dir)).then_some((path, printed.title))
        })
        .last()
        .and_then(|(path, title)| {
            let title = title.unwrap_or_else(|| "video".to_string());
            downloaded_file(path, title).ok()
        })
}

fn downloaded_file(path: PathBuf, title: String) -> Result<DownloadedFile> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("downloaded file has no valid name: {}", path.display()))?
        .to_string();
    Ok(DownloadedFile {
        path,
        file_name,
        title,
    })
}

/// Scans `dir` for a finished file, preferring the requested container's
/// extension over any other media file.
pub fn find_output_file(dir: &Path, format: OutputFormat) -> Result<Option<PathBuf>> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if SKIPPED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            continue;
        }
        candidates.push(entry.path());
    }
    candidates.sort();

    let extension_of = |path: &Path| {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    };
    let preferred = candidates
        .iter()
        .find(|path| extension_of(path).as_deref() == Some(format.extension()));
    let fallback = || {
        candidates.iter().find(|path| {
            extension_of(path).is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
        })
    };
    Ok(preferred.or_else(fallback).cloned())
}

/// Runs `<program> <version_flag>` to find out early whether a required tool
/// is installed.
pub fn ensure_program_available(program: impl AsRef<OsStr>, version_flag: &str) -> Result<()> {
    let program = program.as_ref();
    let status = Command::new(program)
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            program.to_string_lossy()
        ),
        Err(err) => bail!(
            "{} is not installed or not in PATH: {}",
            program.to_string_lossy(),
            err
        ),
    }
}
