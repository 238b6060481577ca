//! Remote model catalogs - where downloadable models come from

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::inventory::quantization_from_filename;
use super::types::{CatalogMetadata, RemoteModelInfo};
use crate::llm_engine::provider::LlmError;

const HF_API_BASE: &str = "https://huggingface.co/api/models";
const HF_SEARCH_LIMIT: usize = 20;

/// Source of downloadable models
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    async fn list_available(&self) -> Result<Vec<RemoteModelInfo>, LlmError>;
    async fn search(&self, query: &str) -> Result<Vec<RemoteModelInfo>, LlmError>;
}

fn hf_file_url(repo: &str, filename: &str) -> String {
    format!("https://huggingface.co/{}/resolve/main/{}", repo, filename)
}

fn curated(
    name: &str,
    description: &str,
    repo: &str,
    filename: &str,
    size_bytes: u64,
    context_length: u32,
    recommended_for: &[&str],
) -> RemoteModelInfo {
    RemoteModelInfo {
        filename: filename.to_string(),
        url: hf_file_url(repo, filename),
        size_bytes,
        quantization: quantization_from_filename(filename),
        sha256: None,
        catalog_metadata: CatalogMetadata {
            name: name.to_string(),
            description: Some(description.to_string()),
            repo: Some(repo.to_string()),
            context_length: Some(context_length),
            recommended_for: recommended_for.iter().map(|s| s.to_string()).collect(),
            is_downloaded: false,
        },
    }
}

/// Built-in list of recommended GGUF models
#[derive(Default)]
pub struct CuratedCatalog;

impl CuratedCatalog {
    pub fn models() -> Vec<RemoteModelInfo> {
        vec![
            curated(
                "Llama 3.2 3B Instruct",
                "Meta's small model, good at summarization and chat.",
                "bartowski/Llama-3.2-3B-Instruct-GGUF",
                "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
                2_020_000_000, // ~2 GB
                131072,
                &["summarization", "chat"],
            ),
            curated(
                "Llama 3.2 1B Instruct",
                "Smallest Llama model, fast and lightweight.",
                "bartowski/Llama-3.2-1B-Instruct-GGUF",
                "Llama-3.2-1B-Instruct-Q4_K_M.gguf",
                808_000_000, // ~0.8 GB
                131072,
                &["quick"],
            ),
            curated(
                "Mistral 7B Instruct",
                "7B model with strong instruction following.",
                "bartowski/Mistral-7B-Instruct-v0.3-GGUF",
                "Mistral-7B-Instruct-v0.3-Q4_K_M.gguf",
                4_370_000_000, // ~4.4 GB
                32768,
                &["summarization", "chat"],
            ),
            curated(
                "Qwen 2.5 7B Instruct",
                "Multilingual 7B model.",
                "Qwen/Qwen2.5-7B-Instruct-GGUF",
                "qwen2.5-7b-instruct-q4_k_m.gguf",
                4_680_000_000, // ~4.7 GB
                32768,
                &["multilingual", "chat"],
            ),
            curated(
                "Phi 3.5 Mini",
                "Microsoft's efficient small model.",
                "bartowski/Phi-3.5-mini-instruct-GGUF",
                "Phi-3.5-mini-instruct-Q4_K_M.gguf",
                2_390_000_000, // ~2.4 GB
                131072,
                &["suggestions"],
            ),
        ]
    }
}

#[async_trait]
impl RemoteCatalog for CuratedCatalog {
    async fn list_available(&self) -> Result<Vec<RemoteModelInfo>, LlmError> {
        Ok(Self::models())
    }

    async fn search(&self, query: &str) -> Result<Vec<RemoteModelInfo>, LlmError> {
        let query = query.to_lowercase();
        Ok(Self::models()
            .into_iter()
            .filter(|m| {
                m.filename.to_lowercase().contains(&query)
                    || m.catalog_metadata.name.to_lowercase().contains(&query)
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct HfModel {
    id: String,
    #[serde(default)]
    siblings: Vec<HfSibling>,
}

#[derive(Debug, Deserialize)]
struct HfSibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Searches the HuggingFace model API for GGUF repositories
pub struct HuggingFaceCatalog {
    client: reqwest::Client,
    api_base: String,
}

impl HuggingFaceCatalog {
    pub fn new(timeout: Duration) -> Result<Self, LlmError> {
        Self::with_api_base(HF_API_BASE, timeout)
    }

    pub fn with_api_base(api_base: &str, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::IoFailure(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn query(&self, search: &str) -> Result<Vec<RemoteModelInfo>, LlmError> {
        let limit = HF_SEARCH_LIMIT.to_string();
        let response = self
            .client
            .get(&self.api_base)
            .query(&[
                ("search", search),
                ("filter", "gguf"),
                ("full", "true"),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| LlmError::IoFailure(format!("Catalog request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(LlmError::IoFailure(format!(
                "Catalog returned status {}",
                response.status()
            )));
        }

        let repos: Vec<HfModel> = response
            .json()
            .await
            .map_err(|e| LlmError::IoFailure(format!("Failed to parse catalog response: {}", e)))?;

        Ok(repos.into_iter().flat_map(repo_files).collect())
    }
}

fn repo_files(repo: HfModel) -> Vec<RemoteModelInfo> {
    let HfModel { id, siblings } = repo;
    siblings
        .into_iter()
        .filter(|s| s.rfilename.to_lowercase().ends_with(".gguf") && !s.rfilename.contains('/'))
        .map(|s| RemoteModelInfo {
            url: hf_file_url(&id, &s.rfilename),
            size_bytes: s.size.unwrap_or(0),
            quantization: quantization_from_filename(&s.rfilename),
            sha256: None,
            catalog_metadata: CatalogMetadata {
                name: s.rfilename.trim_end_matches(".gguf").to_string(),
                repo: Some(id.clone()),
                ..Default::default()
            },
            filename: s.rfilename,
        })
        .collect()
}

#[async_trait]
impl RemoteCatalog for HuggingFaceCatalog {
    async fn list_available(&self) -> Result<Vec<RemoteModelInfo>, LlmError> {
        self.query("instruct").await
    }

    async fn search(&self, query: &str) -> Result<Vec<RemoteModelInfo>, LlmError> {
        self.query(query).await
    }
}

/// Curated entries first, then the other sources, deduplicated by filename.
///
/// A failing source is skipped as long as one source answered.
pub struct CompositeCatalog {
    sources: Vec<Arc<dyn RemoteCatalog>>,
}

impl CompositeCatalog {
    pub fn new(sources: Vec<Arc<dyn RemoteCatalog>>) -> Self {
        Self { sources }
    }

    fn merge(results: Vec<Result<Vec<RemoteModelInfo>, LlmError>>) -> Result<Vec<RemoteModelInfo>, LlmError> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        let mut last_error = None;
        let mut any_ok = false;

        for result in results {
            match result {
                Ok(models) => {
                    any_ok = true;
                    for model in models {
                        if seen.insert(model.filename.to_lowercase()) {
                            merged.push(model);
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Model catalog source failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match (any_ok, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(merged),
        }
    }
}

#[async_trait]
impl RemoteCatalog for CompositeCatalog {
    async fn list_available(&self) -> Result<Vec<RemoteModelInfo>, LlmError> {
        let results = futures_util::future::join_all(self.sources.iter().map(|s| s.list_available())).await;
        Self::merge(results)
    }

    async fn search(&self, query: &str) -> Result<Vec<RemoteModelInfo>, LlmError> {
        let results = futures_util::future::join_all(self.sources.iter().map(|s| s.search(query))).await;
        Self::merge(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::testing::{remote_model, StaticCatalog};

    #[tokio::test]
    async fn test_curated_search_is_case_insensitive() {
        let catalog = CuratedCatalog;
        let hits = catalog.search("MISTRAL").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].quantization.as_deref(), Some("Q4_K_M"));
        assert!(hits[0].url.ends_with("/Mistral-7B-Instruct-v0.3-Q4_K_M.gguf"));
    }

    #[tokio::test]
    async fn test_composite_dedups_and_tolerates_failing_source() {
        let composite = CompositeCatalog::new(vec![
            Arc::new(StaticCatalog::new(vec![remote_model("a.gguf", "http://x/a.gguf")])),
            Arc::new(StaticCatalog::unavailable()),
            Arc::new(StaticCatalog::new(vec![
                remote_model("A.gguf", "http://y/a.gguf"),
                remote_model("b.gguf", "http://y/b.gguf"),
            ])),
        ]);

        let models = composite.list_available().await.unwrap();
        let names: Vec<_> = models.iter().map(|m| m.filename.as_str()).collect();
        assert_eq!(names, vec!["a.gguf", "b.gguf"]);
        assert_eq!(models[0].url, "http://x/a.gguf");
    }

    #[tokio::test]
    async fn test_composite_fails_when_every_source_fails() {
        let composite = CompositeCatalog::new(vec![Arc::new(StaticCatalog::unavailable())]);
        assert!(composite.list_available().await.is_err());
    }

    #[test]
    fn test_repo_files_keeps_top_level_gguf() {
        let repo: HfModel = serde_json::from_value(serde_json::json!({
            "id": "org/Model-GGUF",
            "siblings": [
                {"rfilename": "README.md"},
                {"rfilename": "model-Q8_0.gguf", "size": 1234},
                {"rfilename": "sub/model-Q4_0.gguf"}
            ]
        }))
        .unwrap();

        let files = repo_files(repo);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size_bytes, 1234);
        assert_eq!(files[0].quantization.as_deref(), Some("Q8_0"));
        assert_eq!(files[0].url, "https://huggingface.co/org/Model-GGUF/resolve/main/model-Q8_0.gguf");
    }
}
