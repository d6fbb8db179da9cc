//! The `ask` command: a one-shot terminal front end over an in-process
//! pipeline.
//!
//! Prompts are submitted (several at once as a batch), the command waits for
//! Stage 1 to go idle and then gives Stage 2 a bounded time to catch up before
//! printing every answer.

use crate::server::pipeline::Pipeline;
use core::time::Duration;
use nemo_core::{ResponseView, Result, StatusView};
use std::fmt::Write as _;
use tokio::time::Instant;

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const RULE_WIDTH: usize = 80;

/// Submits `prompts`, waits for them and returns their views in submission
/// order.
///
/// An `image` is attached to every prompt. Without one, several prompts go
/// in as a single batch, so an invalid prompt rejects all of them.
///
/// # Errors
///
/// Returns the submission error if the pipeline refuses a prompt.
pub async fn ask(
    pipeline: &Pipeline,
    prompts: &[String],
    image: Option<String>,
    settle: Duration,
) -> Result<Vec<ResponseView>> {
    let ids = match image {
        Some(image) => prompts
            .iter()
            .map(|prompt| pipeline.submit(prompt, Some(image.clone()), None))
            .collect::<Result<Vec<_>>>()?,
        None if prompts.len() == 1 => vec![pipeline.submit(&prompts[0], None, None)?],
        None => pipeline.submit_batch(prompts)?,
    };
    for id in &ids {
        tracing::info!(%id, "Queued prompt");
    }

    pipeline.wait_idle().await;

    let deadline = Instant::now() + settle;
    loop {
        let (views, pending) = collect(pipeline, &ids);
        if pending == 0 || Instant::now() >= deadline {
            if pending > 0 {
                tracing::warn!("{pending} responses were not processed in time");
            }
            return Ok(views);
        }
        tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
    }
}

/// Current views for `ids` and how many of them Stage 2 has not reached yet.
fn collect(pipeline: &Pipeline, ids: &[String]) -> (Vec<ResponseView>, usize) {
    let mut pending = 0;
    let views = ids
        .iter()
        .filter_map(|id| match pipeline.status(id) {
            StatusView::Completed {
                data,
                processing_status,
            } => {
                pending += usize::from(processing_status.is_some());
                Some(data)
            }
            StatusView::Processing { .. } => {
                pending += 1;
                None
            }
        })
        .collect();
    (views, pending)
}

/// Renders one answer as a framed block for the terminal.
pub fn render(view: &ResponseView) -> String {
    let heavy = "=".repeat(RULE_WIDTH);
    let light = "-".repeat(RULE_WIDTH);
    let mut out = String::new();

    let _ = writeln!(out, "{heavy}");
    let _ = writeln!(out, "ID: {}", view.basic.id);
    if let Some(processor) = &view.processor {
        let _ = writeln!(out, "Processed by: {processor}");
    }
    let _ = writeln!(
        out,
        "Worker: {} | {:.2}s",
        view.basic.worker_name, view.basic.performance.time
    );
    let _ = writeln!(out, "{light}");
    let _ = writeln!(out, "{}", view.basic.response);
    let _ = writeln!(out, "{heavy}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        config::PipelineConfig,
        generator::{ContentGenerator, PreparedImage},
        isolation::TaskSpawner,
    };
    use async_trait::async_trait;
    use nemo_core::Error;
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl ContentGenerator for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, prompt: &str, image: Option<&PreparedImage>) -> Result<String> {
            Ok(match image {
                Some(_) => format!("{prompt} (with image)"),
                None => format!("echo {prompt}"),
            })
        }
    }

    fn pipeline() -> Pipeline {
        let config = PipelineConfig {
            num_threads: 2,
            num_processes: 2,
            poll_interval: Duration::from_millis(20),
            transform_delay: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(1),
            ..PipelineConfig::default()
        };
        Pipeline::start(
            &config,
            Arc::new(Echo),
            Arc::new(TaskSpawner::new(config.transform_delay)),
        )
    }

    #[tokio::test]
    async fn batch_is_answered_in_order_and_processed() {
        let pipeline = pipeline();
        let prompts = vec!["one".to_string(), "two".to_string(), "three".to_string()];

        let views = ask(&pipeline, &prompts, None, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(views.len(), 3);
        for (view, prompt) in views.iter().zip(&prompts) {
            assert_eq!(view.basic.prompt, *prompt);
            assert_eq!(
                view.basic.response,
                format!("Question: {prompt}\n\necho {prompt}")
            );
            assert_eq!(view.processed, Some(true));
        }
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_batch_queues_nothing() {
        let pipeline = pipeline();
        let prompts = vec!["fine".to_string(), "  ".to_string()];

        let err = ask(&pipeline, &prompts, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
        assert_eq!(pipeline.queue_size(), 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn bad_image_is_reported_in_the_answer() {
        let pipeline = pipeline();
        let prompts = vec!["look".to_string()];

        let views = ask(
            &pipeline,
            &prompts,
            Some("not-an-image".to_string()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(views.len(), 1);
        assert!(views[0].basic.error);
        assert!(views[0].basic.has_image);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn render_frames_the_answer() {
        let pipeline = pipeline();
        let views = ask(&pipeline, &["hi".to_string()], None, Duration::from_secs(5))
            .await
            .unwrap();
        pipeline.shutdown().await;

        let text = render(&views[0]);
        assert!(text.starts_with(&"=".repeat(RULE_WIDTH)));
        assert!(text.contains(&format!("ID: {}", views[0].basic.id)));
        assert!(text.contains("Processed by: Process "));
        assert!(text.contains("Question: hi\n\necho hi"));
    }
}
