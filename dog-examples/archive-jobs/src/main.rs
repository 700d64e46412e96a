mod archiver;
mod poll;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use dog_jobs::prelude::*;
use crate::{archiver::DemoArchiver, poll::poll_until_terminal};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    dog_jobs::init_tracing(std::env::var("LOG_JSON").is_ok());

    let config = JobsConfig::from_env("DOG_JOBS")?;
    let root = std::env::var("ARCHIVE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("archive-jobs"));
    let base_url = std::env::var("ARCHIVE_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8080/archives".to_string());
    let secret = std::env::var("ARCHIVE_SECRET").unwrap_or_else(|_| "change-me".to_string());
    tokio::fs::create_dir_all(&root).await?;

    let queue = Arc::new(MemoryWorkQueue::from_config(&config));
    let coordinator = Arc::new(JobCoordinator::new(
        Arc::new(MemoryJobStore::new()),
        queue.clone(),
        config.clone(),
    ));
    let signer = Arc::new(LocalArtifactSigner::new(&root, base_url, secret));
    let publisher = Arc::new(ResultPublisher::new(signer, config.url_ttl));
    let processor = Arc::new(DemoArchiver {
        root: root.clone(),
        unit_delay: Duration::from_millis(200),
    });

    let shutdown = CancellationToken::new();
    let sweeper = RetentionSweeper::new(coordinator.clone())
        .with_publisher(publisher.clone())
        .spawn(shutdown.clone());
    let pool = WorkerPool::start(coordinator.clone(), queue, processor, publisher, &config);

    let files = ["report.pdf", "photo-001.jpg", "photo-002.jpg", "notes.md"];
    let job_id = coordinator
        .create(
            OwnerId::from("demo-user"),
            files.iter().map(|file| UnitId::from(*file)).collect(),
            JobPriority::Normal,
        )
        .await?;
    println!("[archive-jobs] created job {}", job_id);

    let job = poll_until_terminal(&coordinator, &job_id).await?;
    match (&job.status, &job.result, &job.error) {
        (JobStatus::Completed, Some(result), _) => {
            println!("[archive-jobs] ready: {} ({} bytes)", result.access_url, result.size_bytes);
            println!("[archive-jobs] link expires at {}", result.expires_at);
        }
        (status, _, Some(error)) => println!("[archive-jobs] job ended {}: {}", status, error),
        (status, _, None) => println!("[archive-jobs] job ended {}", status),
    }

    pool.shutdown().await;
    shutdown.cancel();
    sweeper.await?;
    Ok(())
}
