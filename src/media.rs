//! Request vocabulary (output container + quality) and the quality summary
//! shown to the user before downloading.
//!
//! Everything here is pure data shaping; spawning yt-dlp lives in
//! [`crate::ytdlp`].

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

pub const INVALID_FORMAT_MESSAGE: &str = "Invalid format. Choose mp4, mp3, or wav.";

const DEFAULT_MP3_KBPS: u32 = 320;
const MIN_MP3_KBPS: u32 = 32;
const MAX_MP3_KBPS: u32 = 320;
const MIN_VIDEO_HEIGHT: u32 = 144;
const MAX_VIDEO_HEIGHT: u32 = 4320;
/// Progressive formats below this height are not offered.
const LISTED_MIN_HEIGHT: i64 = 360;
const WAV_KBPS: f64 = 1411.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Container the user asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Mp3,
    Wav,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Some(Self::Mp4),
            "mp3" => Some(Self::Mp3),
            "wav" => Some(Self::Wav),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
        }
    }

    /// File extension yt-dlp produces for this container.
    pub fn extension(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container plus its normalized quality qualifier.
///
/// * `Mp4`: `quality` is a maximum height, `None` meaning "best available".
/// * `Mp3`: `quality` is the bitrate in kbps and always set.
/// * `Wav`: `quality` is always `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variant {
    pub format: OutputFormat,
    pub quality: Option<u32>,
}

impl Variant {
    /// Validates the raw `quality` form field against `format`.
    pub fn resolve(format: OutputFormat, raw_quality: Option<&str>) -> Result<Self> {
        let raw = raw_quality.map(str::trim).filter(|value| !value.is_empty());
        let quality = match format {
            OutputFormat::Wav => None,
            OutputFormat::Mp3 => Some(match raw {
                Some(value) => parse_bitrate(value)?,
                None => DEFAULT_MP3_KBPS,
            }),
            OutputFormat::Mp4 => raw.map(parse_height).transpose()?,
        };
        Ok(Self { format, quality })
    }

    /// Short label used in log lines, e.g. `mp4-720p` or `mp3-192k`.
    pub fn label(&self) -> String {
        match (self.format, self.quality) {
            (OutputFormat::Mp4, Some(height)) => format!("mp4-{height}p"),
            (OutputFormat::Mp3, Some(kbps)) => format!("mp3-{kbps}k"),
            (format, _) => format.as_str().to_string(),
        }
    }
}

fn parse_bitrate(value: &str) -> Result<u32> {
    let digits = value.trim_end_matches(['k', 'K']);
    let kbps: u32 = match digits.parse() {
        Ok(kbps) => kbps,
        Err(_) => bail!("Invalid quality '{value}'. Use an audio bitrate such as 192 or 320."),
    };
    if !(MIN_MP3_KBPS..=MAX_MP3_KBPS).contains(&kbps) {
        bail!("Invalid quality '{value}'. Bitrate must be between {MIN_MP3_KBPS} and {MAX_MP3_KBPS} kbps.");
    }
    Ok(kbps)
}

fn parse_height(value: &str) -> Result<u32> {
    let digits = value.trim_end_matches(['p', 'P']);
    let height: u32 = match digits.parse() {
        Ok(height) => height,
        Err(_) => bail!("Invalid quality '{value}'. Use a video height such as 720p."),
    };
    if !(MIN_VIDEO_HEIGHT..=MAX_VIDEO_HEIGHT).contains(&height) {
        bail!("Invalid quality '{value}'. Height must be between {MIN_VIDEO_HEIGHT}p and {MAX_VIDEO_HEIGHT}p.");
    }
    Ok(height)
}

/// The subset of yt-dlp's `--dump-single-json` payload we read. Every field is
/// optional because extractors other than YouTube fill in far less.
#[derive(Debug, Default, Deserialize)]
pub struct VideoInfo {
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FormatInfo {
    pub height: Option<i64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
}

impl FormatInfo {
    /// True when the stream carries both audio and video.
    fn is_progressive(&self) -> bool {
        codec_present(self.vcodec.as_deref()) && codec_present(self.acodec.as_deref())
    }

    fn size_bytes(&self) -> u64 {
        self.filesize
            .filter(|size| *size > 0.0)
            .or(self.filesize_approx)
            .filter(|size| size.is_finite() && *size > 0.0)
            .map(|size| size as u64)
            .unwrap_or(0)
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    codec.is_some_and(|codec| !codec.is_empty() && codec != "none")
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QualityOption {
    pub quality: String,
    pub size: u64,
    pub size_mb: f64,
}

/// Approximate output sizes in MB for the audio containers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AudioEstimates {
    pub mp3_320: f64,
    pub mp3_192: f64,
    pub wav: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MediaSummary {
    pub title: String,
    pub duration: u64,
    pub thumbnail: Option<String>,
    pub video_formats: Vec<QualityOption>,
    pub audio_estimates: AudioEstimates,
}

pub fn summarize(info: &VideoInfo) -> MediaSummary {
    // height -> largest size seen for that height
    let mut by_height: BTreeMap<i64, u64> = BTreeMap::new();
    for format in &info.formats {
        if !format.is_progressive() {
            continue;
        }
        let Some(height) = format.height.filter(|height| *height >= LISTED_MIN_HEIGHT) else {
            continue;
        };
        let size = format.size_bytes();
        by_height
            .entry(height)
            .and_modify(|best| *best = (*best).max(size))
            .or_insert(size);
    }

    let video_formats = by_height
        .into_iter()
        .rev()
        .map(|(height, size)| QualityOption {
            quality: format!("{height}p"),
            size,
            size_mb: round_one_decimal(size as f64 / BYTES_PER_MB),
        })
        .collect();

    let duration = info
        .duration
        .filter(|duration| duration.is_finite() && *duration > 0.0)
        .unwrap_or(0.0);

    MediaSummary {
        title: info
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or("Unknown")
            .to_string(),
        duration: duration.round() as u64,
        thumbnail: info.thumbnail.clone(),
        video_formats,
        audio_estimates: AudioEstimates {
            mp3_320: estimate_mb(duration, 320.0),
            mp3_192: estimate_mb(duration, 192.0),
            wav: estimate_mb(duration, WAV_KBPS),
        },
    }
}

fn estimate_mb(duration_secs: f64, kbps: f64) -> f64 {
    round_one_decimal(duration_secs * kbps / 8.0 / 1024.0)
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn format(height: i64, vcodec: &str, acodec: &str, size: Option<f64>) -> FormatInfo {
        FormatInfo {
            height: Some(height),
            vcodec: Some(vcodec.into()),
            acodec: Some(acodec.into()),
            filesize: size,
            filesize_approx: None,
        }
    }

    #[test]
    fn format_parsing_is_case_insensitive() {
        assert_eq!(OutputFormat::parse(" MP3 "), Some(OutputFormat::Mp3));
        assert_eq!(OutputFormat::parse("wav"), Some(OutputFormat::Wav));
        assert_eq!(OutputFormat::parse("Mp4"), Some(OutputFormat::Mp4));
        assert_eq!(OutputFormat::parse("flac"), None);
        assert_eq!(OutputFormat::parse(""), None);
    }

    #[test]
    fn mp3_quality_defaults_and_normalizes() {
        let variant = Variant::resolve(OutputFormat::Mp3, None).unwrap();
        assert_eq!(variant.quality, Some(320));
        let variant = Variant::resolve(OutputFormat::Mp3, Some("  ")).unwrap();
        assert_eq!(variant.quality, Some(320));
        let variant = Variant::resolve(OutputFormat::Mp3, Some("192k")).unwrap();
        assert_eq!(variant.quality, Some(192));
        assert_eq!(variant.label(), "mp3-192k");
        assert!(Variant::resolve(OutputFormat::Mp3, Some("999")).is_err());
        assert!(Variant::resolve(OutputFormat::Mp3, Some("loud")).is_err());
    }

    #[test]
    fn mp4_quality_is_optional_height() {
        let best = Variant::resolve(OutputFormat::Mp4, None).unwrap();
        assert_eq!(best.quality, None);
        assert_eq!(best.label(), "mp4");
        let hd = Variant::resolve(OutputFormat::Mp4, Some("720p")).unwrap();
        assert_eq!(hd.quality, Some(720));
        assert_eq!(hd, Variant::resolve(OutputFormat::Mp4, Some("720")).unwrap());
        assert!(Variant::resolve(OutputFormat::Mp4, Some("720p; rm -rf")).is_err());
        assert!(Variant::resolve(OutputFormat::Mp4, Some("10p")).is_err());
    }

    #[test]
    fn wav_ignores_quality() {
        let variant = Variant::resolve(OutputFormat::Wav, Some("garbage")).unwrap();
        assert_eq!(variant.quality, None);
        assert_eq!(variant.label(), "wav");
    }

    #[test]
    fn summarize_keeps_largest_progressive_format_per_height() {
        let info = VideoInfo {
            title: Some("Clip".into()),
            duration: Some(60.0),
            thumbnail: Some("https://img.test/t.jpg".into()),
            formats: vec![
                format(360, "avc1", "mp4a", Some(1_048_576.0)),
                format(360, "avc1", "mp4a", Some(3_145_728.0)),
                format(720, "avc1", "mp4a", Some(10_485_760.0)),
                // video-only and audio-only streams are not offered
                format(1080, "avc1", "none", Some(99_999_999.0)),
                format(480, "none", "mp4a", Some(1.0)),
                // too small
                format(240, "avc1", "mp4a", Some(1.0)),
            ],
        };
        let summary = summarize(&info);
        assert_eq!(
            summary.video_formats,
            vec![
                QualityOption {
                    quality: "720p".into(),
                    size: 10_485_760,
                    size_mb: 10.0,
                },
                QualityOption {
                    quality: "360p".into(),
                    size: 3_145_728,
                    size_mb: 3.0,
                },
            ]
        );
        assert_eq!(summary.title, "Clip");
        assert_eq!(summary.duration, 60);
    }

    #[test]
    fn summarize_falls_back_to_approximate_size() {
        let mut entry = format(480, "avc1", "mp4a", None);
        entry.filesize_approx = Some(2_621_440.0);
        let summary = summarize(&VideoInfo {
            formats: vec![entry],
            ..VideoInfo::default()
        });
        assert_eq!(summary.video_formats[0].size, 2_621_440);
        assert_eq!(summary.video_formats[0].size_mb, 2.5);
    }

    #[test]
    fn audio_estimates_follow_duration() {
        let summary = summarize(&VideoInfo {
            duration: Some(200.0),
            ..VideoInfo::default()
        });
        assert_eq!(summary.audio_estimates.mp3_320, 7.8);
        assert_eq!(summary.audio_estimates.mp3_192, 4.7);
        assert_eq!(summary.audio_estimates.wav, 34.4);
    }

    #[test]
    fn missing_metadata_yields_defaults() {
        let summary = summarize(&VideoInfo::default());
        assert_eq!(summary.title, "Unknown");
        assert_eq!(summary.duration, 0);
        assert!(summary.video_formats.is_empty());
        assert_eq!(summary.audio_estimates.wav, 0.0);
    }

    #[test]
    fn video_info_tolerates_nulls_and_extra_fields() {
        let info: VideoInfo = serde_json::from_value(json!({
            "id": "abc",
            "title": "T",
            "duration": null,
            "formats": [
                {"format_id": "18", "height": 360, "vcodec": "avc1", "acodec": "mp4a",
                 "filesize": null, "filesize_approx": 1234, "tbr": 1.5}
            ]
        }))
        .unwrap();
        let summary = summarize(&info);
        assert_eq!(summary.video_formats.len(), 1);
        assert_eq!(summary.video_formats[0].size, 1234);
    }
}
