//! subset-retrieve CLI - episode retrieval for robot manipulation

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::sync::Arc;

use subset_retrieve::cli::{get_log_level, Cli, OutputFormat};
use subset_retrieve::language::{ChatClient, OpenAiChatClient};
use subset_retrieve::models::{ClipModel, DenseFeaturizer, GroundedSegmenter};
use subset_retrieve::types::end_start_direction;
use subset_retrieve::{LanguageMode, PipelineConfig, PipelineModels, SubsetRetrievePipeline, Task};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    let log_level = get_log_level(cli.verbose);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(log_level.parse().unwrap_or_else(|_| "info".parse().unwrap())),
        )
        .init();

    tracing::info!("subset-retrieve started");

    let config = cli.pipeline_config()?;
    let models = load_models(&cli, &config)?;
    let pipeline = SubsetRetrievePipeline::new(config, models)?;

    let observation = image::open(&cli.observation)
        .with_context(|| format!("Failed to load image: {}", cli.observation.display()))?
        .to_rgb8();
    tracing::info!("Processing: {}", cli.observation.display());

    let (index, top) = pipeline.retrieve(&cli.task, &observation).await?;

    if cli.persist_enrichment {
        pipeline.persist_enrichment(&Task::new(&top.task)).await?;
    }

    let trajectory = &top.candidate.trajectory;
    let direction = end_start_direction(trajectory);
    let visualization = pipeline.config().visualization_path();

    match cli.format {
        OutputFormat::Json => {
            let json = json!({
                "image": cli.observation.display().to_string(),
                "query": cli.task,
                "task": top.task,
                "index": index,
                "trajectory": trajectory,
                "end_start_direction": direction,
                "candidate_size": [top.candidate.masked_image.width(), top.candidate.masked_image.height()],
                "mask_pixels": top.candidate.mask.pixel_count(),
                "visualization": visualization.display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("Image: {}", cli.observation.display());
            println!("Query: {}", cli.task);
            println!("Retrieved task: {}", top.task);
            println!("Top match index: {}", index);
            println!(
                "  Crop: {}x{} ({} object pixels)",
                top.candidate.masked_image.width(),
                top.candidate.masked_image.height(),
                top.candidate.mask.pixel_count()
            );
            println!("  Trajectory points: {}", trajectory.len());
            if let Some([dx, dy]) = direction {
                println!("  End-start direction: ({:.1}, {:.1})", dx, dy);
            }
            println!("Visualization: {}", visualization.display());
        }
    }

    tracing::info!("Retrieval complete");
    Ok(())
}

fn load_models(cli: &Cli, config: &PipelineConfig) -> Result<PipelineModels> {
    let segmenter = GroundedSegmenter::new(&cli.segmenter_model, &cli.vocab)
        .context("Failed to load segmentation model")?;
    let clip = ClipModel::new(&cli.clip_vision_model, &cli.clip_text_model, &cli.vocab)
        .context("Failed to load CLIP model")?;
    let featurizer = DenseFeaturizer::new(&cli.featurizer_model, &cli.vocab)
        .context("Failed to load feature extractor")?;

    let chat: Option<Arc<dyn ChatClient>> = match config.lang_mode {
        LanguageMode::Conversational => Some(Arc::new(OpenAiChatClient::new(&config.chat)?)),
        LanguageMode::Embedding => None,
    };

    Ok(PipelineModels {
        segmenter: Arc::new(segmenter),
        embedder: Arc::new(clip),
        featurizer: Arc::new(featurizer),
        chat,
    })
}
