//! End-to-end tests for subset-retrieve with deterministic stand-in models.

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use ndarray::Array3;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use subset_retrieve::catalog::Task;
use subset_retrieve::language::ChatClient;
use subset_retrieve::models::{Embedder, FeatureExtractor, FeatureMap, ObjectSegmenter};
use subset_retrieve::rerank::{GeometricRanker, VisualFilterParams, VisualReranker};
use subset_retrieve::store::{save_bundle, EpisodeBundle, EpisodeRecord};
use subset_retrieve::types::{BBox, Candidate, Mask, Point, QueryObject, RetrievalBundle};
use subset_retrieve::{
    DataSource, LanguageMode, PipelineConfig, PipelineModels, RetrievalError,
    SubsetRetrievePipeline,
};

const SIZE: u32 = 40;
const GRAY: Rgb<u8> = Rgb([128, 128, 128]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

const RED: Rgb<u8> = Rgb([255, 0, 0]);
const GREEN: Rgb<u8> = Rgb([0, 220, 0]);
const BLUE: Rgb<u8> = Rgb([0, 0, 180]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

fn is_object(p: &Rgb<u8>) -> bool {
    *p != GRAY && *p != WHITE
}

/// Gray frame with a colored square spanning `x0..x1` and rows 10..30
fn frame(color: Rgb<u8>, x0: u32, x1: u32) -> RgbImage {
    RgbImage::from_fn(SIZE, SIZE, |x, y| {
        if (x0..x1).contains(&x) && (10..30).contains(&y) {
            color
        } else {
            GRAY
        }
    })
}

fn empty_frame() -> RgbImage {
    RgbImage::from_pixel(SIZE, SIZE, GRAY)
}

fn object_mask(image: &RgbImage) -> Mask {
    Mask::new(
        image.width(),
        image.height(),
        image.pixels().map(is_object).collect(),
    )
}

/// Foreground = every non-gray pixel; counts calls
#[derive(Default)]
struct ColorSegmenter {
    calls: AtomicUsize,
}

impl ObjectSegmenter for ColorSegmenter {
    fn segment(&self, image: &RgbImage, _: &str, _: f32, _: f32) -> anyhow::Result<Vec<Mask>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mask = object_mask(image);
        Ok(if mask.is_empty() { vec![] } else { vec![mask] })
    }
}

/// Text embeddings from a table; image embeddings from the object color
struct ColorEmbedder;

impl Embedder for ColorEmbedder {
    fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let v = match text {
            t if t.starts_with("A photo of") => [1.0, 0.0, 0.0, 0.0],
            "pick up apple" => [0.0, 1.0, 0.0, 0.0],
            "pick up banana" => [0.0, 0.0, 1.0, 0.0],
            "grab the apple" => [0.0, 0.9, 0.1, 0.0],
            "grab the banana" => [0.0, 0.1, 0.9, 0.0],
            other => anyhow::bail!("no embedding for '{other}'"),
        };
        Ok(v.to_vec())
    }

    fn embed_image(&self, image: &RgbImage) -> anyhow::Result<Vec<f32>> {
        let object: Vec<&Rgb<u8>> = image.pixels().filter(|p| is_object(p)).collect();
        let n = object.len().max(1) as f32;
        let mean = |c: usize| object.iter().map(|p| p[c] as f32).sum::<f32>() / n / 255.0;
        Ok(vec![0.5, mean(0), mean(1), mean(2)])
    }
}

/// One-cell feature map holding the object's normalized centroid x;
/// distance is the centroid offset
struct CentroidFeaturizer;

impl FeatureExtractor for CentroidFeaturizer {
    fn extract(&self, image: &RgbImage, _: &str) -> anyhow::Result<FeatureMap> {
        let xs: Vec<u32> = image
            .enumerate_pixels()
            .filter(|(_, _, p)| is_object(p))
            .map(|(x, _, _)| x)
            .collect();
        let centroid = if xs.is_empty() {
            0.5
        } else {
            xs.iter().sum::<u32>() as f32 / xs.len() as f32 / image.width() as f32
        };
        Ok(FeatureMap::new(Array3::from_elem((1, 1, 1), centroid)))
    }

    fn distance(&self, src: &FeatureMap, tgt: &FeatureMap, _: &Mask, _: &Mask) -> f32 {
        (src.data[[0, 0, 0]] - tgt.data[[0, 0, 0]]).abs()
    }
}

struct CannedChat(&'static str);

#[async_trait]
impl ChatClient for CannedChat {
    async fn choose_task(&self, _: &[&str], _: &str) -> anyhow::Result<String> {
        Ok(self.0.to_string())
    }
}

fn record(image: RgbImage, contact: Point) -> EpisodeRecord {
    EpisodeRecord::new(image, vec![contact, [30.0, 5.0]])
}

/// Apple episodes: A (red, near the query position), B (green), a frame with
/// no object, and C (blue, far from the query)
fn apple_records() -> Vec<EpisodeRecord> {
    vec![
        record(frame(RED, 12, 32), [22.0, 20.0]),
        record(frame(GREEN, 4, 24), [14.0, 20.0]),
        record(empty_frame(), [20.0, 20.0]),
        record(frame(BLUE, 0, 16), [8.0, 20.0]),
    ]
}

fn observation() -> RgbImage {
    frame(BLACK, 10, 30)
}

/// Subset root with apple (cached) and banana (no cache) tasks
async fn subset_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("droid");
    std::fs::create_dir_all(source.join("pick_up_banana")).unwrap();

    let task = Task::new("pick up apple");
    let path = source.join("pick_up_apple").join("pick_up_apple_new.pkl");
    save_bundle(&path, &EpisodeBundle::new(task, apple_records()))
        .await
        .unwrap();
    dir
}

fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::new(root, DataSource::Droid);
    config.save_root = root.join("out");
    config
}

fn models(segmenter: Arc<ColorSegmenter>) -> PipelineModels {
    PipelineModels {
        segmenter,
        embedder: Arc::new(ColorEmbedder),
        featurizer: Arc::new(CentroidFeaturizer),
        chat: None,
    }
}

#[tokio::test]
async fn test_retrieves_closest_apple_episode() {
    let dir = subset_dir().await;
    let pipeline =
        SubsetRetrievePipeline::new(config(dir.path()), models(Arc::default())).unwrap();

    let (index, top) = pipeline
        .retrieve("grab the apple", &observation())
        .await
        .unwrap();

    assert_eq!(index, 0);
    assert_eq!(top.task, "pick up apple");
    // Red square sits closest to the query object.
    assert_eq!(top.candidate.trajectory, vec![[22.0, 20.0], [30.0, 5.0]]);
    assert_eq!(*top.candidate.masked_image.get_pixel(20, 20), RED);
    assert!(!top.candidate.mask.is_full());
    assert!(dir.path().join("out").join("imd_top5.png").exists());
}

#[tokio::test]
async fn test_query_keeps_raw_observation_and_crop_bounds() {
    let dir = subset_dir().await;
    let mut config = config(dir.path());
    config.crop_margin = 2;
    let pipeline = SubsetRetrievePipeline::new(config, models(Arc::default())).unwrap();

    let observation = observation();
    let (_, top) = pipeline.retrieve("grab the apple", &observation).await.unwrap();

    assert_eq!(top.query.image.dimensions(), observation.dimensions());
    assert_eq!(top.query.image, observation);
    assert_eq!(
        top.query.bounds,
        BBox {
            x1: 8,
            y1: 8,
            x2: 32,
            y2: 32
        }
    );
    assert_eq!(top.query.masked_image.dimensions(), (24, 24));
    assert_eq!(top.query.mask.width, 24);
}

#[tokio::test]
async fn test_enrichment_runs_once_per_task() {
    let dir = subset_dir().await;
    let segmenter = Arc::new(ColorSegmenter::default());
    let pipeline =
        SubsetRetrievePipeline::new(config(dir.path()), models(Arc::clone(&segmenter))).unwrap();

    pipeline.retrieve("grab the apple", &observation()).await.unwrap();
    // Query plus four episode frames
    assert_eq!(segmenter.calls.load(Ordering::SeqCst), 5);

    pipeline.retrieve("grab the apple", &observation()).await.unwrap();
    // Only the query is segmented again
    assert_eq!(segmenter.calls.load(Ordering::SeqCst), 6);
    assert_eq!(pipeline.loaded_bundles(), 1);
}

#[tokio::test]
async fn test_persisted_enrichment_is_reused() {
    let dir = subset_dir().await;
    let pipeline =
        SubsetRetrievePipeline::new(config(dir.path()), models(Arc::default())).unwrap();
    let (_, top) = pipeline.retrieve("grab the apple", &observation()).await.unwrap();
    pipeline
        .persist_enrichment(&Task::new(&top.task))
        .await
        .unwrap();

    let segmenter = Arc::new(ColorSegmenter::default());
    let fresh =
        SubsetRetrievePipeline::new(config(dir.path()), models(Arc::clone(&segmenter))).unwrap();
    let (_, again) = fresh.retrieve("grab the apple", &observation()).await.unwrap();
    assert_eq!(segmenter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(again.candidate.trajectory, top.candidate.trajectory);
}

#[tokio::test]
async fn test_task_without_cache_is_an_error() {
    let dir = subset_dir().await;
    let pipeline =
        SubsetRetrievePipeline::new(config(dir.path()), models(Arc::default())).unwrap();

    let err = pipeline
        .retrieve("grab the banana", &observation())
        .await
        .unwrap_err();
    match err {
        RetrievalError::MissingCache { task, path } => {
            assert_eq!(task, "pick up banana");
            assert!(path.ends_with("pick_up_banana/pick_up_banana_new.pkl"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_conversational_mode_uses_chat_answer() {
    let dir = subset_dir().await;
    let mut config = config(dir.path());
    config.lang_mode = LanguageMode::Conversational;
    config.chat.api_key = Some("sk-test".to_string());

    let mut models = models(Arc::default());
    models.chat = Some(Arc::new(CannedChat("Pick up apple.")));
    let pipeline = SubsetRetrievePipeline::new(config.clone(), models.clone()).unwrap();
    let (_, top) = pipeline.retrieve("fetch fruit", &observation()).await.unwrap();
    assert_eq!(top.task, "pick up apple");

    models.chat = Some(Arc::new(CannedChat("open the fridge")));
    let pipeline = SubsetRetrievePipeline::new(config, models).unwrap();
    let err = pipeline
        .retrieve("fetch fruit", &observation())
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::UnknownTask(_)));
}

#[test]
fn test_invalid_data_source_is_fatal() {
    assert!(matches!(
        "kitchen".parse::<DataSource>(),
        Err(RetrievalError::InvalidDataSource(_))
    ));
    let json = r#"{ "subset_dir": "/data", "data_source": "kitchen" }"#;
    assert!(serde_json::from_str::<PipelineConfig>(json).is_err());
}

fn candidate(image: RgbImage, no_object: bool) -> Candidate {
    let mask = if no_object {
        Mask::full(SIZE, SIZE)
    } else {
        object_mask(&image)
    };
    let masked_image = RgbImage::from_fn(SIZE, SIZE, |x, y| {
        if mask.get(x, y) {
            *image.get_pixel(x, y)
        } else {
            WHITE
        }
    });
    Candidate {
        image,
        trajectory: vec![],
        masked_image,
        mask,
    }
}

fn ranking_bundle() -> RetrievalBundle {
    let query = observation();
    let mask = object_mask(&query);
    RetrievalBundle {
        query: QueryObject {
            masked_image: query.clone(),
            image: query,
            mask,
            bounds: BBox {
                x1: 0,
                y1: 0,
                x2: SIZE,
                y2: SIZE,
            },
        },
        candidates: vec![
            candidate(frame(RED, 12, 32), false),
            candidate(frame(GREEN, 4, 24), false),
            candidate(empty_frame(), true),
            candidate(frame(BLUE, 0, 16), false),
        ],
    }
}

#[test]
fn test_all_foreground_candidate_is_excluded() {
    let reranker = VisualReranker::new(Arc::new(ColorEmbedder), VisualFilterParams::default());
    let filtered = reranker
        .rerank_and_filter(ranking_bundle(), "A photo of apple")
        .unwrap();

    assert_eq!(filtered.len(), 3);
    assert!(filtered.candidates.iter().all(|c| !c.mask.is_full()));
    // Descending joint similarity: blue, green, red
    let colors: Vec<Rgb<u8>> = filtered
        .candidates
        .iter()
        .map(|c| *c.masked_image.get_pixel(12, 20))
        .collect();
    assert_eq!(colors, vec![BLUE, GREEN, RED]);
}

#[test]
fn test_top_k_larger_than_survivors_returns_all_ascending() {
    let reranker = VisualReranker::new(Arc::new(ColorEmbedder), VisualFilterParams::default());
    let ranker = GeometricRanker::new(Arc::new(CentroidFeaturizer));

    let filtered = reranker
        .rerank_and_filter(ranking_bundle(), "A photo of apple")
        .unwrap();
    let topk = ranker
        .geometric_topk(filtered, "A photo of apple", 5)
        .unwrap();
    assert_eq!(topk.len(), 3);

    let distances = ranker.distances(&topk, "A photo of apple").unwrap();
    assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*topk.candidates[0].masked_image.get_pixel(20, 20), RED);
}
