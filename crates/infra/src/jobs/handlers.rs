//! Default handlers for the built-in job kinds.
//!
//! The actual content work (course rendering, TTS, video assembly, speech
//! recognition) sits behind [`ContentPipeline`]; the handlers only validate
//! the payload, drive the stages, report progress and store the result.

use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use coursegen_core::CourseId;

use super::context::{JobCancelled, JobContext};
use super::error::EngineError;
use super::registry::{HandlerRegistry, JobHandler};
use super::types::{JobId, JobKind, JsonMap};

pub const VIDEO_STAGES: [&str; 6] = [
    "Preparing audio for video assembly",
    "Generating background visuals",
    "Creating text overlays",
    "Assembling video components",
    "Applying post-processing effects",
    "Finalizing video output",
];

pub const AUDIO_STAGES: [&str; 6] = [
    "Preprocessing text for TTS",
    "Generating speech using TTS engine",
    "Applying audio processing",
    "Normalizing audio levels",
    "Adding background music if requested",
    "Finalizing audio output",
];

pub const SUBTITLE_STAGES: [&str; 6] = [
    "Extracting audio features",
    "Performing speech recognition",
    "Generating time-coded text",
    "Optimizing subtitle timing",
    "Formatting subtitle output",
    "Validating subtitle synchronization",
];

/// Placeholder media duration (seconds) reported for generated courses and videos.
const DEFAULT_MEDIA_DURATION_SECS: u64 = 300;

/// Course rendering options carried in the `options` payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingOptions {
    pub voice: Option<String>,
    pub background_music: bool,
    pub background_style: Option<String>,
    pub languages: Vec<String>,
    pub quality: String,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            voice: None,
            background_music: true,
            background_style: None,
            languages: vec!["en".to_string()],
            quality: "standard".to_string(),
        }
    }
}

impl ProcessingOptions {
    /// Read options leniently: fields with the wrong type keep their default.
    pub fn from_value(value: Option<&Value>) -> Self {
        let mut options = Self::default();
        let Some(map) = value.and_then(Value::as_object) else {
            return options;
        };

        if let Some(voice) = map.get("voice").and_then(Value::as_str) {
            options.voice = Some(voice.to_string());
        }
        if let Some(music) = map.get("background_music").and_then(Value::as_bool) {
            options.background_music = music;
        }
        if let Some(style) = map.get("background_style").and_then(Value::as_str) {
            options.background_style = Some(style.to_string());
        }
        if let Some(langs) = map.get("languages").and_then(Value::as_array) {
            let languages: Vec<String> = langs
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if !languages.is_empty() {
                options.languages = languages;
            }
        }
        if let Some(quality) = map.get("quality").and_then(Value::as_str) {
            options.quality = quality.to_string();
        }
        options
    }
}

/// Input for a course generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct CourseRequest {
    pub job_id: JobId,
    pub input_path: String,
    pub output_path: String,
    pub options: ProcessingOptions,
}

/// What the pipeline produced for a course.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCourse {
    pub course_id: CourseId,
    pub lesson_count: usize,
}

/// External content-production collaborator used by the default handlers.
#[async_trait]
pub trait ContentPipeline: Send + Sync + 'static {
    async fn generate_course(&self, request: CourseRequest) -> anyhow::Result<GeneratedCourse>;

    /// Execute one named stage of a media job.
    async fn run_stage(&self, job_id: JobId, kind: &JobKind, stage: &str) -> anyhow::Result<()>;
}

/// Progress after `done` of `total` stages: 10% up front, 90% spread over the stages.
pub fn stage_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = done.min(total);
    (10 + 90 * done / total) as u8
}

fn required_str<'a>(payload: &'a JsonMap, field: &str) -> anyhow::Result<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("{field} is required"))
}

fn optional_str<'a>(payload: &'a JsonMap, field: &str, default: &'a str) -> &'a str {
    payload.get(field).and_then(Value::as_str).unwrap_or(default)
}

fn into_map(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

/// Run `stages` in order, stopping early if the job is cancelled.
async fn run_stages(
    pipeline: &dyn ContentPipeline,
    ctx: &JobContext,
    stages: &[&str],
) -> anyhow::Result<()> {
    ctx.report_progress(stage_progress(0, stages.len())).await;

    for (i, stage) in stages.iter().enumerate() {
        ctx.ensure_active()?;
        debug!(job_id = %ctx.id(), step = i + 1, total = stages.len(), stage, "running stage");

        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(JobCancelled(ctx.id()).into()),
            res = pipeline.run_stage(ctx.id(), ctx.kind(), stage) => {
                res.with_context(|| format!("stage '{stage}' failed"))?
            }
        }

        ctx.report_progress(stage_progress(i + 1, stages.len())).await;
    }
    Ok(())
}

/// Generates a full course from a markdown source.
pub struct CourseGenerationHandler {
    pipeline: Arc<dyn ContentPipeline>,
}

impl CourseGenerationHandler {
    pub fn new(pipeline: Arc<dyn ContentPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for CourseGenerationHandler {
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()> {
        let payload = ctx.payload();
        let input_path = required_str(payload, "input_path")?;
        let output_path = required_str(payload, "output_path")?;
        let options = ProcessingOptions::from_value(payload.get("options"));
        info!(job_id = %ctx.id(), input_path, quality = %options.quality, "starting course generation");

        ctx.report_progress(5).await;

        let request = CourseRequest {
            job_id: ctx.id(),
            input_path: input_path.to_string(),
            output_path: output_path.to_string(),
            options,
        };
        let course = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(JobCancelled(ctx.id()).into()),
            res = self.pipeline.generate_course(request) => {
                res.context("failed to generate course")?
            }
        };

        ctx.report_result(into_map(json!({
            "course_id": course.course_id,
            "output_path": output_path,
            "duration": DEFAULT_MEDIA_DURATION_SECS,
            "lesson_count": course.lesson_count,
        })))
        .await
        .context("failed to store course result")?;

        if let Err(e) = ctx.set_course(course.course_id.clone()).await {
            warn!(job_id = %ctx.id(), error = %e, "failed to link job to course");
        }
        Ok(())
    }
}

/// Assembles the video for one lesson.
pub struct VideoProcessingHandler {
    pipeline: Arc<dyn ContentPipeline>,
}

impl VideoProcessingHandler {
    pub fn new(pipeline: Arc<dyn ContentPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for VideoProcessingHandler {
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()> {
        let course_id = required_str(ctx.payload(), "course_id")?;
        let lesson_id = required_str(ctx.payload(), "lesson_id")?;

        run_stages(self.pipeline.as_ref(), &ctx, &VIDEO_STAGES).await?;

        ctx.report_result(into_map(json!({
            "course_id": course_id,
            "lesson_id": lesson_id,
            "video_url": format!("/storage/videos/{course_id}/{lesson_id}.mp4"),
            "duration": DEFAULT_MEDIA_DURATION_SECS,
        })))
        .await
        .context("failed to store video result")?;
        Ok(())
    }
}

/// Text-to-speech for a block of text.
pub struct AudioGenerationHandler {
    pipeline: Arc<dyn ContentPipeline>,
}

impl AudioGenerationHandler {
    pub fn new(pipeline: Arc<dyn ContentPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for AudioGenerationHandler {
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()> {
        let text = required_str(ctx.payload(), "text")?;
        let voice = optional_str(ctx.payload(), "voice", "default");

        run_stages(self.pipeline.as_ref(), &ctx, &AUDIO_STAGES).await?;

        // Rough estimate: ten characters per second of speech.
        let duration = text.chars().count() / 10;
        ctx.report_result(into_map(json!({
            "audio_url": format!("/storage/audio/{}.mp3", ctx.id()),
            "duration": duration,
            "voice": voice,
        })))
        .await
        .context("failed to store audio result")?;
        Ok(())
    }
}

/// Time-coded subtitles for an audio track.
pub struct SubtitleGenerationHandler {
    pipeline: Arc<dyn ContentPipeline>,
}

impl SubtitleGenerationHandler {
    pub fn new(pipeline: Arc<dyn ContentPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for SubtitleGenerationHandler {
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()> {
        let audio_url = required_str(ctx.payload(), "audio_url")?;
        let language = optional_str(ctx.payload(), "language", "en");

        run_stages(self.pipeline.as_ref(), &ctx, &SUBTITLE_STAGES).await?;

        ctx.report_result(into_map(json!({
            "subtitle_url": format!("/storage/subtitles/{}_{language}.srt", ctx.id()),
            "language": language,
            "audio_url": audio_url,
        })))
        .await
        .context("failed to store subtitle result")?;
        Ok(())
    }
}

/// Register a handler for each built-in job kind.
pub fn register_default_handlers(
    registry: &HandlerRegistry,
    pipeline: Arc<dyn ContentPipeline>,
) -> Result<(), EngineError> {
    registry.register(
        JobKind::CourseGeneration,
        Arc::new(CourseGenerationHandler::new(Arc::clone(&pipeline))),
    )?;
    registry.register(
        JobKind::VideoProcessing,
        Arc::new(VideoProcessingHandler::new(Arc::clone(&pipeline))),
    )?;
    registry.register(
        JobKind::AudioGeneration,
        Arc::new(AudioGenerationHandler::new(Arc::clone(&pipeline))),
    )?;
    registry.register(
        JobKind::SubtitleGeneration,
        Arc::new(SubtitleGenerationHandler::new(pipeline)),
    )?;
    Ok(())
}
