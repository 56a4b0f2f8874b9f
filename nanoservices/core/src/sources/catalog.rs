use std::sync::Arc;

use dimload_utils::DimloadResult;

use crate::sources::traits::SourceProvider;

/// Enumerates the source databases a run extracts from.
#[derive(Clone)]
pub struct SourceCatalog {
    provider: Arc<dyn SourceProvider>,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl SourceCatalog {
    pub fn new(provider: Arc<dyn SourceProvider>) -> Self {
        Self { provider, include: Vec::new(), exclude: Vec::new() }
    }

    /// Keep only databases whose name contains one of these (case-insensitive).
    pub fn include_keywords(mut self, keywords: &[String]) -> Self {
        self.include = normalize(keywords);
        self
    }

    /// Drop databases whose name contains one of these (case-insensitive).
    pub fn exclude_keywords(mut self, keywords: &[String]) -> Self {
        self.exclude = normalize(keywords);
        self
    }

    pub fn provider(&self) -> &Arc<dyn SourceProvider> {
        &self.provider
    }

    /// Candidate databases, sorted and deduplicated.
    pub async fn candidates(&self) -> DimloadResult<Vec<String>> {
        let mut databases: Vec<String> = self
            .provider
            .list_databases()
            .await?
            .into_iter()
            .filter(|db| self.matches(db))
            .collect();
        databases.sort();
        databases.dedup();
        tracing::debug!(count = databases.len(), "resolved candidate source databases");
        Ok(databases)
    }

    fn matches(&self, database: &str) -> bool {
        let name = database.to_lowercase();
        let included = self.include.is_empty() || self.include.iter().any(|k| name.contains(k));
        let excluded = self.exclude.iter().any(|k| name.contains(k));
        included && !excluded
    }
}

fn normalize(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}
