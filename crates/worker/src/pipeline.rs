//! Stand-in content pipeline.
//!
//! Course generation parses the markdown outline and writes a manifest into
//! the output directory. Media stages only sleep for the configured delay.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use coursegen_core::CourseId;
use coursegen_infra::jobs::{ContentPipeline, CourseRequest, GeneratedCourse, JobId, JobKind, ProcessingOptions};

/// Name of the manifest written next to the generated course.
pub const MANIFEST_FILE: &str = "course.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseOutline {
    pub title: Option<String>,
    pub lessons: Vec<String>,
}

/// Read a markdown outline: `# ` gives the title, each `## ` starts a lesson.
pub fn parse_outline(markdown: &str) -> CourseOutline {
    let mut title = None;
    let mut lessons = Vec::new();
    for line in markdown.lines().map(str::trim) {
        if let Some(heading) = line.strip_prefix("## ") {
            lessons.push(heading.trim().to_string());
        } else if let Some(heading) = line.strip_prefix("# ") {
            title.get_or_insert_with(|| heading.trim().to_string());
        }
    }
    CourseOutline { title, lessons }
}

#[derive(Serialize)]
struct Manifest<'a> {
    course_id: &'a CourseId,
    job_id: JobId,
    title: Option<&'a str>,
    lessons: &'a [String],
    options: &'a ProcessingOptions,
}

pub struct SimulatedPipeline {
    stage_delay: Duration,
}

impl SimulatedPipeline {
    pub fn new(stage_delay: Duration) -> Self {
        Self { stage_delay }
    }
}

#[async_trait]
impl ContentPipeline for SimulatedPipeline {
    async fn generate_course(&self, request: CourseRequest) -> anyhow::Result<GeneratedCourse> {
        let markdown = tokio::fs::read_to_string(&request.input_path)
            .await
            .with_context(|| format!("failed to read {}", request.input_path))?;

        let outline = parse_outline(&markdown);
        if outline.lessons.is_empty() {
            bail!("no lessons found in {}", request.input_path);
        }

        let course_id = CourseId::new(Uuid::now_v7().to_string())?;
        let output_dir = Path::new(&request.output_path);
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("failed to create {}", request.output_path))?;

        let manifest = serde_json::to_vec_pretty(&Manifest {
            course_id: &course_id,
            job_id: request.job_id,
            title: outline.title.as_deref(),
            lessons: &outline.lessons,
            options: &request.options,
        })?;
        tokio::fs::write(output_dir.join(MANIFEST_FILE), manifest)
            .await
            .context("failed to write course manifest")?;

        info!(job_id = %request.job_id, %course_id, lessons = outline.lessons.len(), "course generated");
        Ok(GeneratedCourse {
            course_id,
            lesson_count: outline.lessons.len(),
        })
    }

    async fn run_stage(&self, job_id: JobId, kind: &JobKind, stage: &str) -> anyhow::Result<()> {
        debug!(%job_id, %kind, stage, "simulating stage");
        tokio::time::sleep(self.stage_delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use serde_json::{json, Value};

    use coursegen_core::UserId;
    use coursegen_infra::jobs::{register_default_handlers, InMemoryJobStore, JobEngine, JobStatus, Priority};
    use coursegen_infra::EngineConfig;

    const OUTLINE: &str = "# Rust basics\n\nIntro text.\n\n## Ownership\n...\n## Borrowing\n...\n## Lifetimes\n";

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("coursegen-{}", Uuid::now_v7()))
    }

    fn request(input: &Path, output: &Path) -> CourseRequest {
        CourseRequest {
            job_id: JobId::new(),
            input_path: input.display().to_string(),
            output_path: output.display().to_string(),
            options: ProcessingOptions::default(),
        }
    }

    #[test]
    fn outline_reads_title_and_lessons() {
        let outline = parse_outline(OUTLINE);
        assert_eq!(outline.title.as_deref(), Some("Rust basics"));
        assert_eq!(outline.lessons, vec!["Ownership", "Borrowing", "Lifetimes"]);
    }

    #[test]
    fn outline_without_headings_is_empty() {
        let outline = parse_outline("just prose\n### too deep\n");
        assert_eq!(outline.title, None);
        assert!(outline.lessons.is_empty());
    }

    #[tokio::test]
    async fn generate_course_writes_manifest() {
        let dir = scratch_dir();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let input = dir.join("course.md");
        tokio::fs::write(&input, OUTLINE).await.unwrap();
        let output = dir.join("out");

        let pipeline = SimulatedPipeline::new(Duration::ZERO);
        let course = pipeline.generate_course(request(&input, &output)).await.unwrap();
        assert_eq!(course.lesson_count, 3);

        let manifest: Value =
            serde_json::from_slice(&tokio::fs::read(output.join(MANIFEST_FILE)).await.unwrap()).unwrap();
        assert_eq!(manifest["course_id"], json!(course.course_id.as_str()));
        assert_eq!(manifest["title"], json!("Rust basics"));
        assert_eq!(manifest["lessons"].as_array().map(Vec::len), Some(3));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_input_is_an_error() {
        let dir = scratch_dir();
        let pipeline = SimulatedPipeline::new(Duration::ZERO);
        let err = pipeline
            .generate_course(request(&dir.join("missing.md"), &dir))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to read"));
    }

    #[tokio::test]
    async fn course_job_completes_through_the_engine() {
        let dir = scratch_dir();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let input = dir.join("course.md");
        tokio::fs::write(&input, OUTLINE).await.unwrap();

        let engine = JobEngine::new(
            InMemoryJobStore::arc(),
            EngineConfig::default().with_workers(1).with_recovery_interval(None),
        )
        .unwrap();
        register_default_handlers(engine.registry(), std::sync::Arc::new(SimulatedPipeline::new(Duration::ZERO)))
            .unwrap();
        engine.start().await.unwrap();

        let payload = json!({
            "input_path": input.display().to_string(),
            "output_path": dir.join("out").display().to_string(),
        });
        let Value::Object(payload) = payload else { unreachable!() };
        let job = engine
            .enqueue(JobKind::CourseGeneration, UserId::new("user-1").unwrap(), payload, Priority::Normal)
            .await
            .unwrap();

        let mut finished = None;
        for _ in 0..200 {
            let current = engine.get_job(job.id).await.unwrap();
            if current.status.is_terminal() {
                finished = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let finished = finished.expect("job did not finish");
        assert_eq!(finished.status, JobStatus::Completed, "error: {:?}", finished.error);
        assert_eq!(finished.progress, 100);
        assert!(finished.course_id.is_some());
        assert_eq!(finished.result.unwrap()["lesson_count"], json!(3));

        engine.stop().await.unwrap();
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
