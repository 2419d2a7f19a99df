//! yt-dlp discovery, metadata queries and mp3 caching.

use std::{path::PathBuf, process::Stdio};

use anyhow::{Context as AnyhowContext, Result, anyhow};
use once_cell::sync::Lazy;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use tokio::{fs, process::Command as TokioCommand, sync::OnceCell};
use tracing::{debug, info};

use crate::track::TrackReference;

static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent("chorus-bot/0.1")
        .build()
        .unwrap_or_default()
});

static BINARY: Lazy<OnceCell<PathBuf>> = Lazy::new(OnceCell::new);

const GITHUB_RELEASES_API: &str = "https://api.github.com/repos/yt-dlp/yt-dlp/releases/latest";

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    assets: Vec<ReleaseAsset>,
}

fn cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().ok_or_else(|| anyhow!("no cache dir available on this system"))?;
    Ok(base.join("chorus").join("yt-dlp"))
}

fn platform_asset_name() -> &'static str {
    if cfg!(target_os = "windows") {
        if cfg!(target_arch = "x86_64") {
            "yt-dlp.exe"
        } else {
            "yt-dlp_x86.exe"
        }
    } else if cfg!(target_os = "linux") {
        "yt-dlp_linux"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else {
        "yt-dlp"
    }
}

/// Path to a usable yt-dlp: `$PATH` first, then a cached release download.
pub async fn binary() -> Result<PathBuf> {
    BINARY.get_or_try_init(locate_or_fetch).await.cloned()
}

async fn locate_or_fetch() -> Result<PathBuf> {
    if let Ok(p) = which::which("yt-dlp") {
        return Ok(p);
    }

    let dir = cache_dir()?;
    fs::create_dir_all(&dir).await.ok();

    let local = dir.join(if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    });
    if fs::try_exists(&local).await.unwrap_or(false) {
        return Ok(local);
    }

    info!("yt-dlp not found, fetching latest release into {}", dir.display());
    let rel: ReleaseInfo = HTTP
        .get(GITHUB_RELEASES_API)
        .header(ACCEPT, "application/vnd.github+json")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let wanted = platform_asset_name();
    let asset = rel
        .assets
        .into_iter()
        .find(|a| a.name == wanted)
        .ok_or_else(|| anyhow!("no suitable yt-dlp asset for this platform: {}", wanted))?;

    let bytes = HTTP
        .get(asset.browser_download_url)
        .header(USER_AGENT, "chorus-bot/0.1")
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    fs::write(&local, &bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&local).await?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&local, perms).await?;
    }
    Ok(local)
}

/// One line of `yt-dlp -j --flat-playlist` output.
#[derive(Debug, Deserialize)]
struct Entry {
    id: String,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    webpage_url: Option<String>,
    url: Option<String>,
    is_live: Option<bool>,
    extractor_key: Option<String>,
}

impl Entry {
    fn into_track(self) -> TrackReference {
        let uri = self.webpage_url.or(self.url);
        let mut track = TrackReference::new(
            uri.clone().unwrap_or_else(|| self.id.clone()),
            self.title.unwrap_or_else(|| self.id.clone()),
        );
        track.author = self.uploader.or(self.channel).unwrap_or_default();
        track.uri = uri;
        track.duration_ms = self
            .duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| (d * 1000.0) as u64)
            .unwrap_or(0);
        track.is_stream = self.is_live.unwrap_or(false);
        track.source = self
            .extractor_key
            .unwrap_or_else(|| "yt-dlp".to_string())
            .to_lowercase();
        track
    }
}

fn parse_entries(stdout: &str) -> Vec<TrackReference> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str::<Entry>(l) {
            Ok(e) => Some(e.into_track()),
            Err(e) => {
                debug!("skipping unparsable yt-dlp line: {e}");
                None
            }
        })
        .collect()
}

/// Metadata for `target`: a URL or a `ytsearchN:`-style search expression.
pub async fn dump(target: &str) -> Result<Vec<TrackReference>> {
    let ytdlp = binary().await?;
    let out = TokioCommand::new(&ytdlp)
        .arg("-j")
        .arg("--flat-playlist")
        .arg("--skip-download")
        .arg("-q")
        .arg(target)
        .stdin(Stdio::null())
        .output()
        .await
        .context("running yt-dlp to dump metadata")?;
    if !out.status.success() {
        return Err(anyhow!(
            "yt-dlp -j failed with status {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(parse_entries(&String::from_utf8_lossy(&out.stdout)))
}

async fn extract_id(ytdlp: &PathBuf, url: &str) -> Result<String> {
    let out = TokioCommand::new(ytdlp)
        .arg("--print")
        .arg("id")
        .arg("--skip-download")
        .arg("--no-playlist")
        .arg("-q")
        .arg(url)
        .stdin(Stdio::null())
        .output()
        .await
        .context("running yt-dlp to extract id")?;
    if !out.status.success() {
        return Err(anyhow!("yt-dlp --print id failed with status: {}", out.status));
    }
    let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if id.is_empty() {
        return Err(anyhow!("empty id from yt-dlp"));
    }
    Ok(id)
}

pub fn download_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("DOWNLOAD_FOLDER") {
        let p = PathBuf::from(dir);
        if p.is_absolute() {
            Ok(p)
        } else {
            Ok(std::env::current_dir()?.join(p))
        }
    } else {
        Ok(cache_dir()?.join("downloads"))
    }
}

/// Download `url` as 48 kHz stereo mp3, reusing a cached copy keyed by media id.
pub async fn download_mp3(url: &str) -> Result<PathBuf> {
    let ytdlp = binary().await?;
    let base = download_dir()?;
    fs::create_dir_all(&base).await?;

    let id = extract_id(&ytdlp, url).await?;
    let cached = base.join(format!("{}.mp3", sanitize(&id)));
    if fs::try_exists(&cached).await.unwrap_or(false) {
        debug!("cache hit for {url}");
        return Ok(cached);
    }

    let job = base.join(format!("job-{}", uuid::Uuid::new_v4()));
    fs::create_dir_all(&job).await?;

    let status = TokioCommand::new(&ytdlp)
        .arg("-f")
        .arg("bestaudio/best")
        .arg("-x")
        .arg("--audio-format")
        .arg("mp3")
        .arg("--audio-quality")
        .arg("0")
        .arg("--postprocessor-args")
        .arg("ffmpeg:-ar 48000 -ac 2")
        .arg("--no-playlist")
        .arg("-q")
        .arg("-o")
        .arg(job.join("%(id)s.%(ext)s").to_string_lossy().to_string())
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("running yt-dlp download")?;
    if !status.success() {
        let _ = fs::remove_dir_all(&job).await;
        return Err(anyhow!("yt-dlp failed with status: {status}"));
    }

    let mut produced = None;
    let mut entries = fs::read_dir(&job).await?;
    while let Some(e) = entries.next_entry().await? {
        let p = e.path();
        if p.extension().and_then(|s| s.to_str()) == Some("mp3") {
            produced = Some(p);
            break;
        }
    }
    let produced = produced.ok_or_else(|| anyhow!("no mp3 produced for {url}"))?;

    // Another job may have finished the same id first.
    let final_path = if fs::try_exists(&cached).await.unwrap_or(false)
        || fs::rename(&produced, &cached).await.is_ok()
    {
        cached
    } else {
        fs::copy(&produced, &cached).await?;
        cached
    };
    let _ = fs::remove_dir_all(&job).await;
    Ok(final_path)
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
