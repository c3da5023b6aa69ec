use std::path::PathBuf;

/// Fixed path the media proxy serves and the playback device is pointed at.
pub const STREAM_PATH: &str = "/stream.mp3";

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/relay/ (XDG standard)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("relay")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relay")
    }
}

pub fn config_dir() -> PathBuf {
    // On Windows, a config.toml beside the executable wins (portable install)
    #[cfg(windows)]
    {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let portable_config = exe_dir.join("config.toml");
                if portable_config.exists() {
                    return exe_dir.to_path_buf();
                }
            }
        }
    }

    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("relay")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relay")
    }
}

/// Public URL of the media proxy as seen from the playback device.
pub fn stream_url(host: &str, port: u16) -> String {
    format!("http://{}:{}{}", host, port, STREAM_PATH)
}

#[cfg(unix)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg"]
}

#[cfg(windows)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg.exe", "ffmpeg"]
}

#[cfg(unix)]
fn yt_dlp_binary_names() -> &'static [&'static str] {
    &["yt-dlp", "yt-dlp_linux", "yt-dlp_macos"]
}

#[cfg(windows)]
fn yt_dlp_binary_names() -> &'static [&'static str] {
    &["yt-dlp.exe", "yt-dlp"]
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
        let p = dir.join("external").join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in names {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

fn find_binary(env_var: &str, names: &[&str]) -> Option<PathBuf> {
    if let Ok(p) = std::env::var(env_var) {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    find_beside_exe(names).or_else(|| find_on_path(names))
}

/// Find the ffmpeg binary used as the transcoder.
///
/// Searches `FFMPEG_PATH`, then beside the current executable (and its
/// `external/` folder), then `PATH`.
pub fn find_ffmpeg_binary() -> Option<PathBuf> {
    find_binary("FFMPEG_PATH", ffmpeg_binary_names())
}

/// Find the yt-dlp binary used as the resolver.
///
/// Same search order as [`find_ffmpeg_binary`], keyed on `YT_DLP_PATH`.
pub fn find_yt_dlp_binary() -> Option<PathBuf> {
    find_binary("YT_DLP_PATH", yt_dlp_binary_names())
}
