use serenity::async_trait;
use tracing::debug;

use crate::error::SearchError;
use crate::search::{LoadResult, SearchBackend, SearchMode, SearchProvider};
use crate::track::TrackReference;

/// Search through the local yt-dlp binary. There is no multi-category search,
/// so every query goes through `load`.
pub struct YtDlpSearch {
    /// Candidates requested per search expression.
    limit: usize,
}

impl YtDlpSearch {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    /// yt-dlp only knows YouTube and SoundCloud search expressions.
    fn expression(&self, query: &str, mode: SearchMode) -> String {
        match mode {
            SearchMode::Direct => query.to_string(),
            SearchMode::Provider(SearchProvider::SoundCloud) => {
                format!("scsearch{}:{}", self.limit, query)
            }
            SearchMode::Provider(p) => {
                if p != SearchProvider::YouTube {
                    debug!("{} search is not available through yt-dlp, using YouTube", p.label());
                }
                format!("ytsearch{}:{}", self.limit, query)
            }
        }
    }
}

impl Default for YtDlpSearch {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl SearchBackend for YtDlpSearch {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn search_rich(
        &self,
        _query: &str,
        _mode: SearchMode,
    ) -> Result<Vec<TrackReference>, SearchError> {
        Err(SearchError::Unsupported)
    }

    async fn load(&self, query: &str, mode: SearchMode) -> Result<LoadResult, SearchError> {
        let target = self.expression(query, mode);
        let tracks = crate::ytdlp::dump(&target)
            .await
            .map_err(|e| SearchError::Backend(format!("{e:#}")))?;
        let playlist = mode == SearchMode::Direct && tracks.len() > 1;
        Ok(LoadResult { tracks, playlist })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_search_expressions() {
        let b = YtDlpSearch::new(3);
        assert_eq!(b.expression("https://x.y/z", SearchMode::Direct), "https://x.y/z");
        assert_eq!(
            b.expression("lofi", SearchMode::Provider(SearchProvider::SoundCloud)),
            "scsearch3:lofi"
        );
        assert_eq!(
            b.expression("lofi", SearchMode::Provider(SearchProvider::Deezer)),
            "ytsearch3:lofi"
        );
    }

    #[tokio::test]
    async fn rich_search_is_unsupported() {
        let b = YtDlpSearch::default();
        assert!(matches!(
            b.search_rich("x", SearchMode::Provider(SearchProvider::YouTube)).await,
            Err(SearchError::Unsupported)
        ));
    }
}
