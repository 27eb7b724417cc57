#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOADS_DIR: &str = "downloads";
pub const DEFAULT_WWW_ROOT: &str = "www";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_CACHE_TTL_MINUTES: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_MAX_JOBS: usize = 3;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

/// Fully resolved runtime configuration for the server binary.
#[derive(Debug, Clone)]
pub struct Settings {
    pub downloads_dir: PathBuf,
    pub www_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub max_jobs: usize,
    /// Wall-clock limit for a single yt-dlp run.
    pub job_timeout: Duration,
    pub ytdlp_bin: PathBuf,
    pub ffmpeg_location: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

/// Values passed on the command line. They win over both the process
/// environment and the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub downloads_dir: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings(&file_vars, env_var_string, overrides))
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Settings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let downloads_dir = overrides
        .downloads_dir
        .or_else(|| lookup("TUBEGRAB_DOWNLOADS_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADS_DIR));
    let www_root = overrides
        .www_root
        .or_else(|| lookup("TUBEGRAB_WWW_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("TUBEGRAB_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("TUBEGRAB_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);

    let ttl_minutes = positive_number(lookup("TUBEGRAB_CACHE_TTL_MINUTES"))
        .unwrap_or(DEFAULT_CACHE_TTL_MINUTES);
    let sweep_secs = positive_number(lookup("TUBEGRAB_SWEEP_INTERVAL_SECS"))
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    let max_jobs = positive_number(lookup("TUBEGRAB_MAX_JOBS"))
        .map(|value| value as usize)
        .unwrap_or(DEFAULT_MAX_JOBS);
    let job_timeout_secs = positive_number(lookup("TUBEGRAB_JOB_TIMEOUT_SECS"))
        .unwrap_or(DEFAULT_JOB_TIMEOUT_SECS);

    let ytdlp_bin = lookup("TUBEGRAB_YTDLP_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));

    Settings {
        downloads_dir,
        www_root,
        host,
        port,
        cache_ttl: Duration::from_secs(ttl_minutes * 60),
        sweep_interval: Duration::from_secs(sweep_secs),
        max_jobs,
        job_timeout: Duration::from_secs(job_timeout_secs),
        ytdlp_bin,
        ffmpeg_location: lookup("TUBEGRAB_FFMPEG_LOCATION").map(PathBuf::from),
        log_file: lookup("TUBEGRAB_LOG_FILE").map(PathBuf::from),
    }
}

fn positive_number(value: Option<String>) -> Option<u64> {
    value
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> Settings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_settings(&vars, |_| None, SettingsOverrides::default())
    }

    #[test]
    fn empty_file_uses_defaults() {
        let settings = settings_from("");
        assert_eq!(settings.downloads_dir, PathBuf::from(DEFAULT_DOWNLOADS_DIR));
        assert_eq!(settings.www_root, PathBuf::from(DEFAULT_WWW_ROOT));
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.cache_ttl, Duration::from_secs(30 * 60));
        assert_eq!(settings.sweep_interval, Duration::from_secs(300));
        assert_eq!(settings.max_jobs, 3);
        assert_eq!(settings.job_timeout, Duration::from_secs(3600));
        assert_eq!(settings.ytdlp_bin, PathBuf::from("yt-dlp"));
        assert!(settings.ffmpeg_location.is_none());
        assert!(settings.log_file.is_none());
    }

    #[test]
    fn file_values_are_applied() {
        let settings = settings_from(
            "TUBEGRAB_DOWNLOADS_DIR=\"/srv/dl\"\nTUBEGRAB_PORT=\"8081\"\n\
             TUBEGRAB_CACHE_TTL_MINUTES=5\nTUBEGRAB_FFMPEG_LOCATION=/opt/ffmpeg\n\
             TUBEGRAB_JOB_TIMEOUT_SECS=90\n",
        );
        assert_eq!(settings.downloads_dir, PathBuf::from("/srv/dl"));
        assert_eq!(settings.port, 8081);
        assert_eq!(settings.cache_ttl, Duration::from_secs(300));
        assert_eq!(settings.ffmpeg_location, Some(PathBuf::from("/opt/ffmpeg")));
        assert_eq!(settings.job_timeout, Duration::from_secs(90));
    }

    #[test]
    fn invalid_or_zero_numbers_fall_back() {
        let settings = settings_from(
            "TUBEGRAB_PORT=nope\nTUBEGRAB_CACHE_TTL_MINUTES=0\nTUBEGRAB_MAX_JOBS=-2\n\
             TUBEGRAB_JOB_TIMEOUT_SECS=0\n",
        );
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.cache_ttl, Duration::from_secs(30 * 60));
        assert_eq!(settings.max_jobs, DEFAULT_MAX_JOBS);
        assert_eq!(settings.job_timeout, Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS));
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("TUBEGRAB_WWW_ROOT=/file\n").path()).unwrap();
        let settings = build_settings(
            &vars,
            |key| (key == "TUBEGRAB_WWW_ROOT").then(|| "/env".to_string()),
            SettingsOverrides::default(),
        );
        assert_eq!(settings.www_root, PathBuf::from("/env"));
    }

    #[test]
    fn overrides_win_over_env_and_file() {
        let mut vars = HashMap::new();
        vars.insert("TUBEGRAB_DOWNLOADS_DIR".to_string(), "/file".to_string());
        vars.insert("TUBEGRAB_HOST".to_string(), "10.0.0.1".to_string());
        let settings = build_settings(
            &vars,
            |key| (key == "TUBEGRAB_PORT").then(|| "7000".to_string()),
            SettingsOverrides {
                downloads_dir: Some(PathBuf::from("/cli")),
                port: Some(9000),
                ..SettingsOverrides::default()
            },
        );
        assert_eq!(settings.downloads_dir, PathBuf::from("/cli"));
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.host, "10.0.0.1");
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let settings = build_settings(
            &HashMap::new(),
            |_| None,
            SettingsOverrides {
                host: Some("   ".into()),
                ..SettingsOverrides::default()
            },
        );
        assert_eq!(settings.host, DEFAULT_HOST);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export TUBEGRAB_DOWNLOADS_DIR="/media"
            TUBEGRAB_WWW_ROOT='/www'
            TUBEGRAB_HOST =  "0.0.0.0"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("TUBEGRAB_DOWNLOADS_DIR").unwrap(), "/media");
        assert_eq!(vars.get("TUBEGRAB_WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("TUBEGRAB_HOST").unwrap(), "0.0.0.0");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn resolve_settings_reads_custom_env_path() {
        let cfg = make_config("TUBEGRAB_YTDLP_BIN=/opt/yt-dlp\n");
        let settings = resolve_settings(SettingsOverrides {
            env_path: Some(cfg.path().to_path_buf()),
            ..SettingsOverrides::default()
        })
        .unwrap();
        // The process env may define this key on a developer box; only assert
        // when it is absent.
        if env::var("TUBEGRAB_YTDLP_BIN").is_err() {
            assert_eq!(settings.ytdlp_bin, PathBuf::from("/opt/yt-dlp"));
        }
    }
}
