use crate::error::{PreviewError, Result};
use std::fmt;
use std::path::{Path, PathBuf};

const MAX_DECK_LEN: usize = 128;

/// Validated deck identifier. Safe to use as a file name component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeckId(String);

impl DeckId {
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_DECK_LEN
            && !raw.starts_with('.')
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(PreviewError::InvalidDeck(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Location of the deck's markdown source inside `dir`.
    pub fn artifact_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.md", self.0))
    }
}

impl fmt::Display for DeckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        for name in ["slides", "sample_50", "q3-review.v2"] {
            assert_eq!(DeckId::parse(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn rejects_path_like_names() {
        for name in ["", "../etc/passwd", "a/b", ".hidden", "a b", "deck\\x"] {
            assert!(
                matches!(DeckId::parse(name), Err(PreviewError::InvalidDeck(_))),
                "{name:?} should be rejected"
            );
        }
        assert!(DeckId::parse(&"x".repeat(MAX_DECK_LEN + 1)).is_err());
    }

    #[test]
    fn artifact_lives_in_deck_dir() {
        let deck = DeckId::parse("intro").unwrap();
        assert_eq!(
            deck.artifact_path(Path::new("/srv/decks")),
            PathBuf::from("/srv/decks/intro.md")
        );
    }
}
