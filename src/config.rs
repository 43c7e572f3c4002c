use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Runtime settings resolved once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub github_token: Option<String>,
    pub db_path: PathBuf,
}

impl Config {
    /// Resolve settings from `.env`, the environment and an optional `--db` override
    pub fn load(db_override: Option<&Path>) -> Result<Self> {
        // A missing .env file is fine
        dotenv::dotenv().ok();

        let db_path = resolve_db_path(
            db_override,
            std::env::var("DATABASE_URL").ok().as_deref(),
            Self::default_db_path,
        )?;

        Ok(Self {
            github_token: Self::github_token(),
            db_path,
        })
    }

    /// Token or a startup error for commands that talk to GitHub
    pub fn require_token(&self) -> Result<String> {
        self.github_token.clone().context(
            "No GitHub token found. Set GITHUB_TOKEN (or GH_TOKEN), or log in with `gh auth login`",
        )
    }

    /// Get the data directory path
    fn data_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "star-crawler", "star-crawler")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .context("Could not determine data directory")
    }

    fn default_db_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("repos.db"))
    }

    /// Get GitHub token from environment or gh CLI config
    fn github_token() -> Option<String> {
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if !token.trim().is_empty() {
                return Some(token.trim().to_string());
            }
        }

        // Try GH_TOKEN (used by gh CLI)
        if let Ok(token) = std::env::var("GH_TOKEN") {
            if !token.trim().is_empty() {
                return Some(token.trim().to_string());
            }
        }

        if let Ok(output) = std::process::Command::new("gh")
            .args(["auth", "token"])
            .output()
        {
            if output.status.success() {
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !token.is_empty() {
                    return Some(token);
                }
            }
        }

        None
    }
}

/// Pick the store path: override, then a usable `DATABASE_URL`, then the default
fn resolve_db_path(
    db_override: Option<&Path>,
    database_url: Option<&str>,
    default: impl FnOnce() -> Result<PathBuf>,
) -> Result<PathBuf> {
    if let Some(path) = db_override {
        return Ok(path.to_path_buf());
    }

    let url = database_url.map(str::trim).filter(|url| !url.is_empty());
    if let Some(path) = url.and_then(db_path_from_url) {
        return Ok(path);
    }

    let path = default()?;
    if let Some(url) = url {
        warn!(
            url = %redact_url(url),
            path = %path.display(),
            "DATABASE_URL is not a SQLite path, using the default database"
        );
    }
    Ok(path)
}

/// Hide the `user:password@` part of a connection URL
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Turn a `DATABASE_URL` value into a file path
///
/// Accepts a bare path or a `sqlite:` URL (`sqlite://data/repos.db`, `sqlite:repos.db`).
/// Query strings are dropped. Blank values and other schemes yield `None`.
pub fn db_path_from_url(url: &str) -> Option<PathBuf> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let path = match url.strip_prefix("sqlite:") {
        Some(rest) => rest.strip_prefix("//").unwrap_or(rest),
        None if url.contains("://") => return None,
        None => url,
    };
    let path = path.split('?').next().unwrap_or(path);

    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}
