//! Local content: the index page, static game pages and dataset files

use crate::error::GatewayErrorCode;
use crate::registry::{Registry, ServiceId};
use hyper::body::Bytes;
use std::fmt::Write;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to read {file}: {source}")]
    Unreadable {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{file} is not valid JSON: {source}")]
    Malformed {
        file: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ContentError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            ContentError::NotFound(_) => GatewayErrorCode::ContentNotFound,
            ContentError::Unreadable { .. } | ContentError::Malformed { .. } => {
                GatewayErrorCode::ContentUnreadable
            }
        }
    }
}

/// Reads pages and datasets from disk on every request
#[derive(Debug, Clone)]
pub struct ContentStore {
    static_dir: PathBuf,
    dataset_dir: PathBuf,
}

impl ContentStore {
    pub fn new(static_dir: impl Into<PathBuf>, dataset_dir: impl Into<PathBuf>) -> Self {
        Self {
            static_dir: static_dir.into(),
            dataset_dir: dataset_dir.into(),
        }
    }

    /// HTML file from the static directory
    pub async fn page(&self, file: &str) -> Result<Bytes, ContentError> {
        read_file(&self.static_dir, file).await
    }

    /// JSON file from the dataset directory. The file is parsed before it is
    /// served so a truncated dataset is reported instead of relayed.
    pub async fn dataset(&self, file: &str) -> Result<Bytes, ContentError> {
        let bytes = read_file(&self.dataset_dir, file).await?;
        serde_json::from_slice::<serde::de::IgnoredAny>(&bytes).map_err(|source| {
            ContentError::Malformed {
                file: file.to_string(),
                source,
            }
        })?;
        Ok(bytes)
    }
}

async fn read_file(dir: &Path, file: &str) -> Result<Bytes, ContentError> {
    match tokio::fs::read(dir.join(file)).await {
        Ok(bytes) => Ok(Bytes::from(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ContentError::NotFound(file.to_string())),
        Err(source) => Err(ContentError::Unreadable {
            file: file.to_string(),
            source,
        }),
    }
}

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Sanskrit Learning System</title>
<style>
body { font-family: Arial, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
.game-card { border: 1px solid #ddd; padding: 20px; margin: 20px 0; border-radius: 8px; }
.btn { background: #4CAF50; color: white; padding: 10px 20px; border-radius: 4px; text-decoration: none; margin: 5px; display: inline-block; }
.btn:hover { background: #45a049; }
</style>
</head>
<body>
<h1>Sanskrit Learning System</h1>
"#;

const PAGE_TAIL: &str = r#"<div class="game-card"><h3>Controls</h3><a href="/api/restart-servers" class="btn">Restart Servers</a><a href="/api/status" class="btn">System Status</a></div>
</body>
</html>
"#;

/// Index page with a card per registered game
pub fn home_page(registry: &Registry) -> String {
    let games: [(ServiceId, &str, &str); 4] = [
        (ServiceId::Sentence, "Sentence Analysis Game", "/sentence-game"),
        (ServiceId::Verb, "Verb Conjugation Game", "/verb-game"),
        (ServiceId::Number, "Number Game", "/number-game"),
        (ServiceId::Matching, "Matching Game", "/api/get-matching-game"),
    ];

    let mut html = String::from(PAGE_HEAD);
    for (id, title, play) in games {
        if !registry.contains(id) {
            continue;
        }
        let _ = writeln!(
            html,
            r#"<div class="game-card"><h3>{}</h3><a href="{}" class="btn">Play</a><a href="/api/{}-status" class="btn">Status</a></div>"#,
            title,
            play,
            id.slug()
        );
    }
    html.push_str(PAGE_TAIL);
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::ServiceDescriptor;

    #[tokio::test]
    async fn test_page_and_dataset_reads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("verb.html"), "<h1>verbs</h1>").unwrap();
        std::fs::write(dir.path().join("sentences.json"), r#"[{"text":"rāmaḥ gacchati"}]"#).unwrap();

        let store = ContentStore::new(dir.path(), dir.path());

        let page = store.page("verb.html").await.unwrap();
        assert_eq!(&page[..], b"<h1>verbs</h1>");

        let dataset = store.dataset("sentences.json").await.unwrap();
        assert_eq!(&dataset[..], r#"[{"text":"rāmaḥ gacchati"}]"#.as_bytes());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path(), dir.path());

        let err = store.dataset("matching_game.json").await.unwrap_err();
        assert!(matches!(err, ContentError::NotFound(_)));
        assert_eq!(err.code(), GatewayErrorCode::ContentNotFound);
        assert_eq!(err.to_string(), "matching_game.json not found");
    }

    #[tokio::test]
    async fn test_malformed_dataset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sentences.json"), "[{\"text\":").unwrap();
        let store = ContentStore::new(dir.path(), dir.path());

        let err = store.dataset("sentences.json").await.unwrap_err();
        assert!(matches!(err, ContentError::Malformed { .. }));
        assert_eq!(err.code(), GatewayErrorCode::ContentUnreadable);
    }

    #[test]
    fn test_home_page_lists_registered_games() {
        let html = home_page(&Registry::from_config(&Config::default()).unwrap());
        assert!(html.contains(r#"href="/sentence-game""#));
        assert!(html.contains(r#"href="/api/mtc-status""#));
        assert!(html.contains("/api/restart-servers"));

        let registry = Registry::new(vec![ServiceDescriptor::external(ServiceId::Verb, 7002)]).unwrap();
        let html = home_page(&registry);
        assert!(html.contains("Verb Conjugation Game"));
        assert!(!html.contains("Number Game"));
    }
}
