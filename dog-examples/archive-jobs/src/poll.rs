use std::time::Duration;
use dog_jobs::prelude::*;

/// Poll the way an HTTP client would, printing each change
pub async fn poll_until_terminal<S: JobStore, Q: WorkQueue>(
    coordinator: &JobCoordinator<S, Q>,
    job_id: &JobId,
) -> JobsResult<Job> {
    let mut last = None;
    loop {
        let job = coordinator.get_status(job_id).await?;
        let seen = (job.status, job.progress.completed);
        if last != Some(seen) {
            println!(
                "[archive-jobs] {} {}/{} (attempt {})",
                job.status, job.progress.completed, job.progress.total, job.attempt
            );
            last = Some(seen);
        }
        if job.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
