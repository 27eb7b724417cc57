#![forbid(unsafe_code)]

//! Process and path guards shared by the server.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use std::path::{Component, Path};

/// Fails fast when the server is started as root. yt-dlp and ffmpeg run with
/// the server's privileges and write wherever the output template points.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::effective(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// True when `value` is a single, plain path component that cannot climb out
/// of the directory it gets joined onto.
pub fn is_safe_path_segment(value: &str) -> bool {
    if value.is_empty() || value.contains('/') || value.contains('\\') {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// True when every component of a relative request path is a normal segment.
pub fn is_safe_relative_path(value: &str) -> bool {
    !value.is_empty()
        && Path::new(value)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}
