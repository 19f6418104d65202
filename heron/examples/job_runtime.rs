//! Job runtime example with the in-memory store.
//!
//! Registers a few command handlers, enqueues jobs with retries, a
//! dependency, a timeout and a cancellation, then prints where each ended.
//!
//! Run with: `RUST_LOG=heron=debug cargo run --example job_runtime`

use std::time::Duration;

use async_trait::async_trait;
use heron::telemetry::init_tracing;
use heron::*;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
struct Resize {
    image: String,
    width: u32,
}

/// Typed handler reporting progress as it works.
struct ResizeImage;

#[async_trait]
impl CommandHandler for ResizeImage {
    async fn execute(&self, ctx: JobContext, _payload: Value) -> anyhow::Result<Option<Value>> {
        let request: Resize = ctx.payload()?;
        for step in 1..=4 {
            ctx.check_cancelled()?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.report(
                Some(step as f64 / 4.0),
                Some("resizing"),
                Some(&format!("pass {step} of 4 on {}", request.image)),
            )
            .await?;
        }
        Ok(Some(json!({ "image": request.image, "width": request.width })))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,heron=info")?;

    let config = JobsConfig {
        tick_interval_ms: 50,
        retry: RetryConfig {
            base_delay_ms: 100,
            ..RetryConfig::default()
        },
        pools: PoolConfig::default().with_pool("media", 2),
        ..JobsConfig::default()
    };

    let runtime = BackgroundJobsBuilder::new(config)
        .register("ResizeImage", ResizeImage)
        .register_fn("Publish", |ctx, _payload| async move {
            let parent = ctx.parent().map(|p| p.response_body.clone());
            ctx.log(&format!("publishing {parent:?}")).await?;
            Ok(parent.flatten())
        })
        .register_fn("Unreliable", |ctx, _payload| async move {
            if ctx.job().attempts < 3 {
                anyhow::bail!("upstream unavailable (attempt {})", ctx.job().attempts);
            }
            Ok(Some(json!("recovered")))
        })
        .register_fn("Stuck", |_ctx, _payload| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        })
        .build()?;
    runtime.start().await?;

    let resize = runtime
        .enqueue_command(
            "ResizeImage",
            &json!({"image": "cat.png", "width": 640}),
            JobOptions::new().with_worker("media"),
        )
        .await?;
    let publish = runtime
        .enqueue_command("Publish", &json!({}), JobOptions::new().with_depends_on(resize.id))
        .await?;
    let unreliable = runtime
        .enqueue_command("Unreliable", &json!({}), JobOptions::new().with_retry_limit(3))
        .await?;
    let stuck = runtime
        .enqueue_command(
            "Stuck",
            &json!({}),
            JobOptions::new().with_timeout_secs(1).with_retry_limit(0),
        )
        .await?;
    let doomed = runtime
        .enqueue_command(
            "ResizeImage",
            &json!({"image": "dog.png", "width": 320}),
            JobOptions::new()
                .with_worker("media")
                .with_run_after(chrono::Utc::now() + chrono::Duration::seconds(60)),
        )
        .await?;
    runtime.cancel(CancelFilter::ids([doomed.id])).await?;

    tokio::time::sleep(Duration::from_secs(3)).await;

    for (label, id) in [
        ("resize", resize.id),
        ("publish", publish.id),
        ("unreliable", unreliable.id),
        ("stuck", stuck.id),
        ("doomed", doomed.id),
    ] {
        let info = runtime.get_job(id).await?;
        match info.summary {
            Some(summary) => println!(
                "{label:>10}: {} after {} attempt(s){}",
                summary.state,
                summary.attempts,
                summary
                    .error_code
                    .map(|code| format!(" ({code})"))
                    .unwrap_or_default()
            ),
            None => println!("{label:>10}: missing"),
        }
    }

    let progress = runtime.progress(resize.id, None).await?;
    println!("resize log:\n{}", progress.logs);

    let info = runtime.info(None).await?;
    println!(
        "month {}: {} completed, {} failed",
        info.month, info.completed_in_month, info.failed_in_month
    );

    runtime.shutdown().await?;
    Ok(())
}
