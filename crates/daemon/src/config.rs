use crate::launcher::{LauncherConfig, ReadinessMarker, DEFAULT_MARKER};
use crate::registry::DEFAULT_BASE_PORT;
use crate::source::DEFAULT_TABLE;
use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Deck preview daemon: runs one renderer per deck on a leased port.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address the HTTP API listens on
    #[arg(long, env = "PREVIEW_LISTEN", default_value = "0.0.0.0:3407")]
    pub listen: SocketAddr,

    /// Host name used in returned preview URLs
    #[arg(long, env = "PREVIEW_PUBLIC_HOST", default_value = "localhost")]
    pub public_host: String,

    /// Directory where deck sources are written for the renderer
    #[arg(long, env = "PREVIEW_DECK_DIR", default_value = "decks")]
    pub deck_dir: PathBuf,

    /// Port lease database, shared by every daemon on this host (default: ~/.deck-preview/ports.db)
    #[arg(long, env = "PREVIEW_DB")]
    pub db_path: Option<PathBuf>,

    /// Lowest port handed to renderers
    #[arg(long, env = "PREVIEW_BASE_PORT", default_value_t = DEFAULT_BASE_PORT)]
    pub base_port: u16,

    /// Highest port handed to renderers
    #[arg(long, env = "PREVIEW_MAX_PORT", default_value_t = u16::MAX)]
    pub max_port: u16,

    /// Renderer executable
    #[arg(long, env = "PREVIEW_RENDERER", default_value = "npx")]
    pub renderer: String,

    /// Arguments placed before `<deck> --port <port> --remote`
    #[arg(long = "renderer-arg", env = "PREVIEW_RENDERER_ARGS", value_delimiter = ',', default_value = "slidev")]
    pub renderer_args: Vec<String>,

    /// Text the renderer prints once serving; `{port}` is substituted
    #[arg(long, env = "PREVIEW_READY_MARKER", default_value = DEFAULT_MARKER)]
    pub ready_marker: String,

    /// Seconds a renderer gets to print its readiness marker
    #[arg(long, env = "PREVIEW_STARTUP_TIMEOUT", default_value_t = 60)]
    pub startup_timeout_secs: u64,

    /// Seconds without requests before a renderer is stopped
    #[arg(long, env = "PREVIEW_IDLE_TIMEOUT", default_value_t = 30 * 60)]
    pub idle_timeout_secs: u64,

    /// Seconds between idle sweeps
    #[arg(long, env = "PREVIEW_SWEEP_INTERVAL", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Content store base URL (PostgREST / Supabase)
    #[arg(long, env = "SUPABASE_URL", requires = "supabase_key")]
    pub supabase_url: Option<String>,

    /// Content store API key
    #[arg(long, env = "SUPABASE_KEY", hide_env_values = true)]
    pub supabase_key: Option<String>,

    /// Table holding `file_name` / `md_text` rows
    #[arg(long, env = "PREVIEW_DECK_TABLE", default_value = DEFAULT_TABLE)]
    pub deck_table: String,

    /// Read decks from `<dir>/<deck>.md` instead of the content store
    #[arg(long, env = "PREVIEW_DECK_SOURCE_DIR", conflicts_with = "supabase_url")]
    pub deck_source_dir: Option<PathBuf>,
}

impl Config {
    /// Reject settings that would let the daemon delete its own inputs.
    ///
    /// Deck files in `deck_dir` are removed when a renderer stops, so a
    /// local deck source must not be that directory or overlap it.
    pub fn validate(&self) -> anyhow::Result<()> {
        let Some(source_dir) = &self.deck_source_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(&self.deck_dir)
            .with_context(|| format!("failed to create deck directory {}", self.deck_dir.display()))?;
        let work = self
            .deck_dir
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", self.deck_dir.display()))?;
        let source = source_dir
            .canonicalize()
            .with_context(|| format!("failed to resolve deck source directory {}", source_dir.display()))?;
        if work.starts_with(&source) || source.starts_with(&work) {
            anyhow::bail!(
                "deck source directory {} overlaps the deck directory {}; stopped previews would delete source decks",
                source.display(),
                work.display()
            );
        }
        Ok(())
    }

    pub fn launcher(&self) -> LauncherConfig {
        LauncherConfig {
            program: self.renderer.clone(),
            args: self.renderer_args.clone(),
            marker: ReadinessMarker::new(self.ready_marker.clone()),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::path::Path;

    #[test]
    fn defaults_match_renderer_conventions() {
        let config = Config::try_parse_from(["preview-daemon"]).unwrap();
        assert_eq!(config.listen.port(), 3407);
        assert_eq!(config.base_port, 1024);
        assert_eq!(config.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));

        let launcher = config.launcher();
        assert_eq!(launcher.program, "npx");
        assert_eq!(launcher.args, vec!["slidev"]);
        assert_eq!(launcher.startup_timeout, Duration::from_secs(60));
        assert_eq!(launcher.marker.expected(1024), "http://localhost:1024");
    }

    #[test]
    fn renderer_args_split_on_commas() {
        let config = Config::try_parse_from([
            "preview-daemon",
            "--renderer",
            "node",
            "--renderer-arg",
            "cli.js,--open=false",
        ])
        .unwrap();
        assert_eq!(config.renderer_args, vec!["cli.js", "--open=false"]);
    }

    #[test]
    fn content_sources_are_exclusive() {
        let result = Config::try_parse_from([
            "preview-daemon",
            "--supabase-url",
            "https://example.supabase.co",
            "--supabase-key",
            "k",
            "--deck-source-dir",
            "/tmp/decks",
        ]);
        assert!(result.is_err());
    }

    fn with_dirs(deck_dir: &Path, source_dir: &Path) -> Config {
        Config::try_parse_from([
            OsStr::new("preview-daemon"),
            OsStr::new("--deck-dir"),
            deck_dir.as_os_str(),
            OsStr::new("--deck-source-dir"),
            source_dir.as_os_str(),
        ])
        .unwrap()
    }

    #[test]
    fn source_dir_equal_to_deck_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(with_dirs(dir.path(), dir.path()).validate().is_err());
        assert!(with_dirs(&dir.path().join("."), dir.path()).validate().is_err());
    }

    #[test]
    fn nested_dirs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("work");
        assert!(with_dirs(&inner, dir.path()).validate().is_err());

        let source = dir.path().join("src");
        std::fs::create_dir(&source).unwrap();
        assert!(with_dirs(dir.path(), &source).validate().is_err());
    }

    #[test]
    fn disjoint_dirs_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("content");
        std::fs::create_dir(&source).unwrap();
        let work = dir.path().join("work");

        with_dirs(&work, &source).validate().unwrap();
        assert!(work.is_dir());
    }

    #[test]
    fn remote_source_needs_no_dir_check() {
        let config = Config::try_parse_from(["preview-daemon", "--deck-dir", "/nonexistent/decks"]).unwrap();
        config.validate().unwrap();
    }
}
