//! Language retrieval: map a free-text task description onto the catalog.

use anyhow::{bail, Context};
use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::{Task, TaskCatalog};
use crate::config::ChatConfig;
use crate::error::{Result, RetrievalError};
use crate::models::Embedder;

/// Picks the catalog task that best matches a task description
#[async_trait]
pub trait LanguageRetriever: Send + Sync {
    async fn retrieve_task(&self, catalog: &TaskCatalog, query: &str) -> Result<Task>;
}

/// Argmax cosine similarity between text embeddings
pub struct EmbeddingRetriever {
    embedder: Arc<dyn Embedder>,
    task_embeddings: Mutex<FxHashMap<String, Vec<f32>>>,
}

impl EmbeddingRetriever {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            task_embeddings: Mutex::new(FxHashMap::default()),
        }
    }

    fn task_embedding(&self, task: &Task) -> Result<Vec<f32>> {
        if let Some(hit) = self.lock_cache().get(task.name()) {
            return Ok(hit.clone());
        }
        let embedding = self
            .embedder
            .embed_text(task.name())
            .with_context(|| format!("Failed to embed task name '{}'", task))?;
        self.lock_cache()
            .insert(task.name().to_string(), embedding.clone());
        Ok(embedding)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, Vec<f32>>> {
        self.task_embeddings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LanguageRetriever for EmbeddingRetriever {
    async fn retrieve_task(&self, catalog: &TaskCatalog, query: &str) -> Result<Task> {
        let query_embedding = self
            .embedder
            .embed_text(query)
            .context("Failed to embed task description")?;

        let mut best: Option<(&Task, f32)> = None;
        for task in catalog.tasks() {
            let score = self
                .embedder
                .similarity(&query_embedding, &self.task_embedding(task)?);
            debug!("Task '{}' similarity {:.4}", task, score);
            // Strict comparison: the first maximum wins ties.
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((task, score));
            }
        }

        let (task, score) = best.ok_or_else(|| RetrievalError::EmptyCatalog(catalog.source_dir()))?;
        info!("Matched '{}' to task '{}' ({:.4})", query, task, score);
        Ok(task.clone())
    }
}

/// Conversational model that names one task from a list
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn choose_task(&self, tasks: &[&str], query: &str) -> anyhow::Result<String>;
}

/// Delegates the choice to a chat model and validates its answer
pub struct ConversationalRetriever {
    client: Arc<dyn ChatClient>,
}

impl ConversationalRetriever {
    pub fn new(client: Arc<dyn ChatClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LanguageRetriever for ConversationalRetriever {
    async fn retrieve_task(&self, catalog: &TaskCatalog, query: &str) -> Result<Task> {
        let answer = self
            .client
            .choose_task(&catalog.names(), query)
            .await
            .context("Conversational task retrieval failed")?;
        let cleaned = clean_answer(&answer);

        let task = catalog
            .find(cleaned)
            .or_else(|| catalog.find_ignore_case(cleaned))
            .ok_or_else(|| {
                warn!("Chat model answered '{}', which is not in the catalog", answer);
                RetrievalError::UnknownTask(answer.trim().to_string())
            })?;

        info!("Chat model matched '{}' to task '{}'", query, task);
        Ok(task.clone())
    }
}

/// Strip whitespace, wrapping quotes/backticks and a trailing period
fn clean_answer(answer: &str) -> &str {
    const QUOTES: [char; 3] = ['"', '\'', '`'];
    let s = answer.trim().trim_matches(QUOTES).trim();
    let s = s.strip_suffix('.').unwrap_or(s).trim();
    s.trim_matches(QUOTES).trim()
}

/// OpenAI-compatible chat completions client
pub struct OpenAiChatClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl OpenAiChatClient {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        Self::with_api_key(config, config.resolve_api_key())
    }

    fn with_api_key(config: &ChatConfig, api_key: Option<String>) -> Result<Self> {
        let api_key = api_key.ok_or_else(|| {
            RetrievalError::Config("conversational mode needs an API key".to_string())
        })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RetrievalError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Instruction and question sent to the chat model
pub fn task_retrieval_messages(tasks: &[&str], query: &str) -> serde_json::Value {
    let listing = tasks
        .iter()
        .map(|t| format!("- {t}"))
        .collect::<Vec<_>>()
        .join("\n");
    json!([
        {
            "role": "system",
            "content": "You match a robot manipulation task to the most similar task in a list. \
                        Reply with exactly one task copied verbatim from the list and nothing else."
        },
        {
            "role": "user",
            "content": format!("Task list:\n{listing}\n\nCurrent task: {query}")
        }
    ])
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn choose_task(&self, tasks: &[&str], query: &str) -> anyhow::Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": task_retrieval_messages(tasks, query),
            "temperature": 0,
        });

        debug!("Sending task retrieval request to {}", self.endpoint);
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Chat request failed ({})", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Chat request failed ({status}): {body}");
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("Failed to decode chat response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("Chat response contained no message")
    }
}
