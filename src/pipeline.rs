//! Retrieval pipeline: language match, episode loading, segmentation,
//! visual filtering and geometric ranking.

use image::RgbImage;
use std::sync::Arc;
use tracing::{debug, info};

use crate::catalog::{Task, TaskCatalog};
use crate::config::{LanguageMode, PipelineConfig};
use crate::crop::crop_frame;
use crate::error::{Result, RetrievalError};
use crate::language::{ChatClient, ConversationalRetriever, EmbeddingRetriever, LanguageRetriever};
use crate::models::{Embedder, FeatureExtractor, ObjectSegmenter};
use crate::rerank::{GeometricRanker, VisualFilterParams, VisualReranker};
use crate::segmentation::{segment_frame, SegmentThresholds};
use crate::store::{EnrichOptions, EpisodeStore};
use crate::types::{BBox, QueryObject, RetrievalBundle, TopMatch};
use crate::visualize::save_grid;

/// Model collaborators injected into the pipeline
#[derive(Clone)]
pub struct PipelineModels {
    pub segmenter: Arc<dyn ObjectSegmenter>,
    pub embedder: Arc<dyn Embedder>,
    pub featurizer: Arc<dyn FeatureExtractor>,
    /// Required in conversational mode only
    pub chat: Option<Arc<dyn ChatClient>>,
}

/// Complete retrieval pipeline over one data source
pub struct SubsetRetrievePipeline {
    config: PipelineConfig,
    catalog: TaskCatalog,
    store: EpisodeStore,
    segmenter: Arc<dyn ObjectSegmenter>,
    retriever: Box<dyn LanguageRetriever>,
    visual: VisualReranker,
    geometric: GeometricRanker,
}

impl SubsetRetrievePipeline {
    /// Validate `config`, list the task catalog and wire up the stages.
    ///
    /// Fails on invalid settings, a missing or empty source directory, or
    /// conversational mode without a chat client.
    pub fn new(config: PipelineConfig, models: PipelineModels) -> Result<Self> {
        info!("Initializing retrieval pipeline");
        config.validate()?;

        let catalog = TaskCatalog::load(&config.subset_dir, config.data_source)?;
        info!(
            "Task catalog for '{}' holds {} task(s)",
            config.data_source,
            catalog.len()
        );

        let retriever: Box<dyn LanguageRetriever> = match config.lang_mode {
            LanguageMode::Embedding => {
                Box::new(EmbeddingRetriever::new(Arc::clone(&models.embedder)))
            }
            LanguageMode::Conversational => {
                let chat = models.chat.clone().ok_or_else(|| {
                    RetrievalError::Config(
                        "conversational mode needs a chat client".to_string(),
                    )
                })?;
                Box::new(ConversationalRetriever::new(chat))
            }
        };
        debug!("Language retrieval mode: {}", config.lang_mode);

        let visual = VisualReranker::new(
            Arc::clone(&models.embedder),
            VisualFilterParams {
                max_ranking: config.max_ranking,
                dedup_threshold: config.dedup_threshold,
                min_joint: config.min_joint,
            },
        );
        let geometric = GeometricRanker::new(Arc::clone(&models.featurizer));

        info!("Retrieval pipeline initialized successfully");
        Ok(Self {
            config,
            catalog,
            store: EpisodeStore::new(),
            segmenter: models.segmenter,
            retriever,
            visual,
            geometric,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    /// Number of episode bundles held in memory
    pub fn loaded_bundles(&self) -> usize {
        self.store.len()
    }

    /// Find the recorded episode most useful for `task_text` given the
    /// current `observation`.
    ///
    /// Returns `(0, top1)`: the index of the best candidate within the
    /// geometric top-k and the match itself.
    pub async fn retrieve(&self, task_text: &str, observation: &RgbImage) -> Result<(usize, TopMatch)> {
        let task = self.retriever.retrieve_task(&self.catalog, task_text).await?;
        let object_name = task.object_name().to_string();
        let object_prompt = task.object_prompt();
        info!("Retrieved task '{}' (object '{}')", task, object_name);

        let bundle = self.store.get(&self.catalog, &task).await?;

        let query = self.segment_query(observation, task_text)?;
        debug!(
            "Query object crop is {}x{}",
            query.masked_image.width(),
            query.masked_image.height()
        );

        let candidates = {
            let mut bundle = bundle.lock().await;
            bundle.ensure_enriched(self.segmenter.as_ref(), &object_name, self.enrich_options())?;
            bundle.candidates()?
        };
        info!("Ranking {} candidate frame(s)", candidates.len());

        let filtered = self
            .visual
            .rerank_and_filter(RetrievalBundle { query, candidates }, &object_prompt)?;
        let topk = self
            .geometric
            .geometric_topk(filtered, &object_prompt, self.config.top_k)?;
        if topk.is_empty() {
            return Err(RetrievalError::NoCandidates(task.to_string()));
        }

        save_grid(&topk, &self.config.visualization_path())?;

        let RetrievalBundle { query, candidates } = topk;
        let candidate = candidates
            .into_iter()
            .next()
            .ok_or_else(|| RetrievalError::NoCandidates(task.to_string()))?;

        info!("Retrieval complete for '{}'", task);
        Ok((
            0,
            TopMatch {
                task: task.name().to_string(),
                query,
                candidate,
            },
        ))
    }

    /// Write the in-memory (possibly enriched) bundle for `task` back to its
    /// cache file
    pub async fn persist_enrichment(&self, task: &Task) -> Result<()> {
        self.store.persist(&self.catalog, task).await
    }

    fn thresholds(&self) -> SegmentThresholds {
        SegmentThresholds {
            box_threshold: self.config.box_threshold,
            text_threshold: self.config.text_threshold,
        }
    }

    fn enrich_options(&self) -> EnrichOptions {
        EnrichOptions {
            thresholds: self.thresholds(),
            crop_margin: self.config.crop.then_some(self.config.crop_margin),
        }
    }

    /// Segment the observation with the raw task text as prompt
    fn segment_query(&self, observation: &RgbImage, task_text: &str) -> Result<QueryObject> {
        let crop = segment_frame(
            self.segmenter.as_ref(),
            observation,
            task_text,
            None,
            self.thresholds(),
        )?;

        if !self.config.crop {
            return Ok(QueryObject {
                image: observation.clone(),
                masked_image: crop.masked_image,
                mask: crop.mask,
                bounds: BBox {
                    x1: 0,
                    y1: 0,
                    x2: observation.width(),
                    y2: observation.height(),
                },
            });
        }

        let cropped = crop_frame(&crop.masked_image, &crop.mask, &[], self.config.crop_margin);
        Ok(QueryObject {
            image: observation.clone(),
            masked_image: cropped.masked_image,
            mask: cropped.mask,
            bounds: cropped.bounds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataSource;
    use crate::models::FeatureMap;
    use crate::types::Mask;
    use anyhow::bail;
    use async_trait::async_trait;

    struct NoSegmenter;

    impl ObjectSegmenter for NoSegmenter {
        fn segment(&self, _: &RgbImage, _: &str, _: f32, _: f32) -> anyhow::Result<Vec<Mask>> {
            Ok(vec![])
        }
    }

    struct ConstEmbedder;

    impl Embedder for ConstEmbedder {
        fn embed_text(&self, _: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }

        fn embed_image(&self, _: &RgbImage) -> anyhow::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct NoFeatures;

    impl FeatureExtractor for NoFeatures {
        fn extract(&self, _: &RgbImage, _: &str) -> anyhow::Result<FeatureMap> {
            bail!("not used")
        }
    }

    struct CannedChat;

    #[async_trait]
    impl ChatClient for CannedChat {
        async fn choose_task(&self, _: &[&str], _: &str) -> anyhow::Result<String> {
            Ok("pick up cup".to_string())
        }
    }

    fn models(chat: Option<Arc<dyn ChatClient>>) -> PipelineModels {
        PipelineModels {
            segmenter: Arc::new(NoSegmenter),
            embedder: Arc::new(ConstEmbedder),
            featurizer: Arc::new(NoFeatures),
            chat,
        }
    }

    fn subset_with_task() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("droid").join("pick_up_cup")).unwrap();
        dir
    }

    #[test]
    fn test_new_requires_source_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::new(dir.path(), DataSource::Hoi4d);
        assert!(matches!(
            SubsetRetrievePipeline::new(config, models(None)),
            Err(RetrievalError::CatalogNotFound(_))
        ));
    }

    #[test]
    fn test_conversational_mode_needs_chat_client() {
        let dir = subset_with_task();
        let mut config = PipelineConfig::new(dir.path(), DataSource::Droid);
        config.lang_mode = LanguageMode::Conversational;
        config.chat.api_key = Some("sk-test".to_string());

        assert!(matches!(
            SubsetRetrievePipeline::new(config.clone(), models(None)),
            Err(RetrievalError::Config(_))
        ));
        let pipeline =
            SubsetRetrievePipeline::new(config, models(Some(Arc::new(CannedChat)))).unwrap();
        assert_eq!(pipeline.catalog().names(), vec!["pick up cup"]);
    }

    #[tokio::test]
    async fn test_retrieve_reports_missing_cache() {
        let dir = subset_with_task();
        let mut config = PipelineConfig::new(dir.path(), DataSource::Droid);
        config.save_root = dir.path().to_path_buf();
        let pipeline = SubsetRetrievePipeline::new(config, models(None)).unwrap();

        let err = pipeline
            .retrieve("pick up the cup", &RgbImage::new(8, 8))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::MissingCache { .. }));
        assert_eq!(pipeline.loaded_bundles(), 0);
    }

    #[test]
    fn test_query_crop_follows_config() {
        let dir = subset_with_task();
        let mut config = PipelineConfig::new(dir.path(), DataSource::Droid);
        config.crop = false;
        let pipeline = SubsetRetrievePipeline::new(config, models(None)).unwrap();

        // No detection: the whole frame becomes the query object.
        let query = pipeline
            .segment_query(&RgbImage::new(12, 6), "pick up the cup")
            .unwrap();
        assert!(query.mask.is_full());
        assert_eq!(query.masked_image.dimensions(), (12, 6));
        assert_eq!(pipeline.enrich_options().crop_margin, None);
    }
}
