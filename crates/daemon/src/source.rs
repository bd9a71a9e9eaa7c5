//! Where deck markdown comes from.

use crate::deck::DeckId;
use crate::error::{PreviewError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::debug;

pub const DEFAULT_TABLE: &str = "md-ppt";

#[async_trait]
pub trait DeckSource: Send + Sync {
    /// Markdown source for `deck`. Fails with `ContentFetchFailed` if there is none.
    async fn fetch(&self, deck: &DeckId) -> Result<String>;
}

fn fetch_failed(deck: &DeckId, reason: impl Into<String>) -> PreviewError {
    PreviewError::ContentFetchFailed {
        deck: deck.to_string(),
        reason: reason.into(),
    }
}

/// Reads decks from a PostgREST table (`file_name`, `md_text`), e.g. Supabase.
pub struct RestDeckSource {
    client: Client,
    base_url: String,
    api_key: String,
    table: String,
}

#[derive(Deserialize)]
struct DeckRow {
    md_text: Option<String>,
}

impl RestDeckSource {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            table: table.into(),
        }
    }
}

#[async_trait]
impl DeckSource for RestDeckSource {
    async fn fetch(&self, deck: &DeckId) -> Result<String> {
        let url = format!("{}/rest/v1/{}", self.base_url, self.table);
        let resp = self
            .client
            .get(&url)
            .query(&[("select", "md_text".to_string()), ("file_name", format!("eq.{deck}"))])
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| fetch_failed(deck, e.to_string()))?;

        if !resp.status().is_success() {
            return Err(fetch_failed(deck, format!("content store returned {}", resp.status())));
        }

        let rows: Vec<DeckRow> = resp
            .json()
            .await
            .map_err(|e| fetch_failed(deck, e.to_string()))?;

        match rows.into_iter().next().and_then(|row| row.md_text) {
            Some(text) if !text.is_empty() => {
                debug!(%deck, bytes = text.len(), "fetched deck source");
                Ok(text)
            }
            _ => Err(fetch_failed(deck, "no markdown content found")),
        }
    }
}

/// Reads `<dir>/<deck>.md` from a local directory.
pub struct DirDeckSource {
    dir: PathBuf,
}

impl DirDeckSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DeckSource for DirDeckSource {
    async fn fetch(&self, deck: &DeckId) -> Result<String> {
        let path = deck.artifact_path(&self.dir);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| fetch_failed(deck, format!("{}: {}", path.display(), e)))?;
        if text.is_empty() {
            return Err(fetch_failed(deck, "no markdown content found"));
        }
        Ok(text)
    }
}
