#![forbid(unsafe_code)]

//! Shared pieces of the tubegrab server: settings, the yt-dlp wrapper, and
//! the TTL download cache.

pub mod cache;
pub mod config;
pub mod logging;
pub mod media;
pub mod security;
pub mod ytdlp;
