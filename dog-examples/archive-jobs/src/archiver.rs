use std::path::PathBuf;
use std::time::Duration;
use async_trait::async_trait;
use dog_jobs::prelude::*;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Simulated archiver: every unit becomes a staged part, `finish` concatenates them
pub struct DemoArchiver {
    pub root: PathBuf,
    pub unit_delay: Duration,
}

impl DemoArchiver {
    fn staging_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(format!("{}.parts", job_id))
    }
}

fn unavailable(err: std::io::Error) -> UnitError {
    UnitError::unavailable(err.to_string())
}

#[async_trait]
impl UnitProcessor for DemoArchiver {
    async fn process_unit(&self, ctx: UnitContext) -> Result<(), UnitError> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(UnitError::processing("cancelled mid-unit")),
            _ = tokio::time::sleep(self.unit_delay) => {}
        }

        let dir = self.staging_dir(&ctx.job_id);
        tokio::fs::create_dir_all(&dir).await.map_err(unavailable)?;

        // Rewriting the same part on a retry keeps the unit idempotent
        let part = format!("{:04}-{}", ctx.index, ctx.unit_id);
        let body = format!("contents of {} (attempt {})\n", ctx.unit_id, ctx.attempt);
        tokio::fs::write(dir.join(part), body).await.map_err(unavailable)?;

        info!("Archived unit {} of job {}", ctx.unit_id, ctx.job_id);
        Ok(())
    }

    async fn finish(&self, job: &Job, _cancel: CancellationToken) -> Result<String, UnitError> {
        let dir = self.staging_dir(&job.id);
        let mut parts = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(unavailable)?;
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            parts.push(entry.path());
        }
        parts.sort();

        let name = format!("{}.txt", job.id);
        let mut archive = tokio::fs::File::create(self.root.join(&name)).await.map_err(unavailable)?;
        for part in &parts {
            let bytes = tokio::fs::read(part).await.map_err(unavailable)?;
            archive.write_all(&bytes).await.map_err(unavailable)?;
        }
        archive.flush().await.map_err(unavailable)?;
        tokio::fs::remove_dir_all(&dir).await.map_err(unavailable)?;

        Ok(name)
    }
}
