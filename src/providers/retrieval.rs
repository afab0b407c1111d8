use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub content: String,
    pub relevance: f32,
}

/// The memory/search collaborator. Best-effort: a failure here degrades a
/// work brief, never a spawn.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        min_relevance: f32,
    ) -> Result<Vec<ContextSnippet>>;
}

#[derive(Debug, Clone)]
pub struct HttpRetriever {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RetrievalRequest<'a> {
    query: &'a str,
    limit: usize,
    min_relevance: f32,
}

#[derive(Debug, Deserialize)]
struct RetrievalResponse {
    results: Vec<ContextSnippet>,
}

impl HttpRetriever {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ContextRetriever for HttpRetriever {
    async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        min_relevance: f32,
    ) -> Result<Vec<ContextSnippet>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RetrievalRequest {
                query,
                limit,
                min_relevance,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            anyhow::bail!("retrieval service error {}: {}", status, body);
        }

        let result: RetrievalResponse = response.json().await?;
        Ok(result
            .results
            .into_iter()
            .filter(|s| s.relevance >= min_relevance)
            .take(limit)
            .collect())
    }
}

/// No-op retriever for runs without a memory service.
pub struct NullRetriever;

#[async_trait]
impl ContextRetriever for NullRetriever {
    async fn retrieve(
        &self,
        _query: &str,
        _limit: usize,
        _min_relevance: f32,
    ) -> Result<Vec<ContextSnippet>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_retriever_is_empty() {
        let retriever = NullRetriever;
        let snippets = retriever.retrieve("anything", 5, 0.5).await.unwrap();
        assert!(snippets.is_empty());
    }

    #[test]
    fn test_snippet_serialization() {
        let snippet = ContextSnippet {
            content: "prior decision: use UUIDv4 ids".to_string(),
            relevance: 0.83,
        };
        let json = serde_json::to_string(&snippet).unwrap();
        let back: ContextSnippet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content, snippet.content);
    }
}
