//! Recurring tasks example.
//!
//! Registers an interval task and a cron task, lets the materializer run for
//! a few seconds, then lists the jobs they produced.
//!
//! Run with: `cargo run --example recurring_tasks`

use std::time::Duration;

use heron::telemetry::init_tracing;
use heron::*;
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info")?;

    let config = JobsConfig {
        tick_interval_ms: 100,
        materializer_interval_ms: 250,
        ..JobsConfig::default()
    };
    let runtime = BackgroundJobsBuilder::new(config)
        .register_fn("Heartbeat", |ctx, payload| async move {
            ctx.log(&format!("beat from {}", payload["source"])).await?;
            Ok(None)
        })
        .build()?;

    runtime
        .register_task(ScheduledTask::interval(
            "heartbeat",
            Duration::from_secs(1),
            "Heartbeat",
            json!({"source": "interval"}),
        ))
        .await?;
    // every second, six-field form with seconds
    runtime
        .register_task(
            ScheduledTask::cron("every-second", "* * * * * *", "Heartbeat", json!({"source": "cron"}))
                .with_options(JobOptions::new().with_tag("cron")),
        )
        .await?;

    runtime.start().await?;
    tokio::time::sleep(Duration::from_millis(3500)).await;
    runtime.shutdown().await?;

    for task in runtime.scheduled_tasks().await? {
        println!(
            "{:>14}: last run {:?}, last job {:?}",
            task.name, task.last_run, task.last_job_id
        );
    }

    let summaries = runtime.query_summaries(&JobQuery::all()).await?;
    println!("{} jobs produced", summaries.len());
    for summary in summaries {
        println!(
            "  job {} by {} -> {}",
            summary.id,
            summary.created_by.unwrap_or_default(),
            summary.state
        );
    }
    Ok(())
}
