//! Turning a finished artifact into a time-limited access credential.
//!
//! The publisher owns the expiry: it computes `expires_at` once, hands it to
//! the [`ArtifactSigner`], and records the same instant on the [`JobResult`],
//! so the status record and the credential can never disagree.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, SubsecRound, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::{JobId, JobResult, JobsError, JobsResult, config::to_chrono};

/// What the signer is asked to sign
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignRequest {
    pub job_id: JobId,

    /// Storage location of the artifact, as returned by the unit processor
    pub location: String,

    /// The credential must stop working at this instant
    pub expires_at: DateTime<Utc>,
}

/// A signed, directly downloadable artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedArtifact {
    pub url: String,
    pub size_bytes: u64,
}

/// External presign capability of the artifact storage
#[async_trait]
pub trait ArtifactSigner: Send + Sync {
    async fn presign(&self, request: &PresignRequest) -> JobsResult<PresignedArtifact>;
}

/// A credential handed out for one artifact of a job
struct Issued {
    location: String,
    result: JobResult,
}

/// Issues one credential per job and remembers it while it is valid
pub struct ResultPublisher {
    signer: Arc<dyn ArtifactSigner>,
    url_ttl: Duration,
    issued: DashMap<JobId, Issued>,
    url_owners: DashMap<String, JobId>,
}

impl ResultPublisher {
    pub fn new(signer: Arc<dyn ArtifactSigner>, url_ttl: Duration) -> Self {
        Self {
            signer,
            url_ttl,
            issued: DashMap::new(),
            url_owners: DashMap::new(),
        }
    }

    pub fn url_ttl(&self) -> Duration {
        self.url_ttl
    }

    /// Sign the artifact at `location` for `job_id`
    ///
    /// Publishing the same location again while the job's credential is
    /// valid returns it unchanged, so a retried completion records an
    /// identical result. A new location replaces the job's credential.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn publish(&self, job_id: &JobId, location: &str) -> JobsResult<JobResult> {
        let now = Utc::now();
        if let Some(existing) = self.issued.get(job_id) {
            if existing.location == location && !existing.result.is_expired(now) {
                debug!("Reusing live credential for job {}", job_id);
                return Ok(existing.result.clone());
            }
        }

        let expires_at = (now + to_chrono(self.url_ttl)).trunc_subsecs(0);
        let request = PresignRequest {
            job_id: job_id.clone(),
            location: location.to_string(),
            expires_at,
        };
        let artifact = self.signer.presign(&request).await?;

        if artifact.url.is_empty() {
            return Err(JobsError::Internal(format!("signer returned an empty URL for job {}", job_id)));
        }

        match self.url_owners.entry(artifact.url.clone()) {
            Entry::Occupied(owner) if owner.get() != job_id => {
                return Err(JobsError::conflict(format!(
                    "signed URL for job {} was already issued to job {}",
                    job_id,
                    owner.get()
                )));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(job_id.clone());
            }
        }

        let result = JobResult {
            access_url: artifact.url,
            size_bytes: artifact.size_bytes,
            expires_at,
        };
        let issued = Issued {
            location: location.to_string(),
            result: result.clone(),
        };
        if let Some(previous) = self.issued.insert(job_id.clone(), issued) {
            if previous.result.access_url != result.access_url {
                self.url_owners.remove(&previous.result.access_url);
            }
        }

        info!("Published {} bytes for job {} until {}", result.size_bytes, job_id, expires_at);
        Ok(result)
    }

    /// Forget credentials that have expired at `now`
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let before = self.issued.len();
        self.issued.retain(|_, issued| {
            let keep = !issued.result.is_expired(now);
            if !keep {
                self.url_owners.remove(&issued.result.access_url);
            }
            keep
        });
        before - self.issued.len()
    }

    /// Number of credentials currently remembered
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }
}

/// Signs artifacts stored on the local filesystem
///
/// URLs take the form
/// `{base_url}/{location}?job={job_id}&expires={unix_secs}&token={token}`
/// where the token is the unpadded base64url SHA-256 of the secret, job id,
/// location and expiry.
pub struct LocalArtifactSigner {
    root: PathBuf,
    base_url: String,
    secret: Vec<u8>,
}

impl LocalArtifactSigner {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }

    /// Check that `url` was issued by this signer and has not expired at `now`
    pub fn verify(&self, url: &str, now: DateTime<Utc>) -> bool {
        let Some(rest) = url.strip_prefix(&self.base_url).and_then(|rest| rest.strip_prefix('/')) else {
            return false;
        };
        let Some((location, query)) = rest.split_once('?') else {
            return false;
        };

        let mut job = None;
        let mut expires = None;
        let mut token = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("job", value)) => job = Some(value),
                Some(("expires", value)) => expires = value.parse::<i64>().ok(),
                Some(("token", value)) => token = Some(value),
                _ => {}
            }
        }

        match (job, expires, token) {
            (Some(job), Some(expires), Some(token)) => {
                now.timestamp() < expires && self.token(job, location, expires) == token
            }
            _ => false,
        }
    }

    fn token(&self, job_id: &str, location: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(b"\n");
        hasher.update(job_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(location.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires.to_string().as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    fn resolve(&self, location: &str) -> JobsResult<PathBuf> {
        let relative = Path::new(location);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));

        if location.is_empty() || escapes || location.contains(['?', '&', '#']) {
            return Err(JobsError::invalid(format!("artifact location {:?} is not a plain relative path", location)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactSigner for LocalArtifactSigner {
    async fn presign(&self, request: &PresignRequest) -> JobsResult<PresignedArtifact> {
        let path = self.resolve(&request.location)?;
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(JobsError::invalid(format!("artifact {} is not a file", path.display())));
        }

        let expires = request.expires_at.timestamp();
        let token = self.token(request.job_id.as_str(), &request.location, expires);
        let url = format!(
            "{}/{}?job={}&expires={}&token={}",
            self.base_url, request.location, request.job_id, expires, token
        );

        Ok(PresignedArtifact {
            url,
            size_bytes: metadata.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn artifact_dir(name: &str, size: u64) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dog-jobs-publisher-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let file = tokio::fs::File::create(dir.join(name)).await.unwrap();
        file.set_len(size).await.unwrap();
        dir
    }

    /// Always hands out the same URL
    struct FixedSigner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ArtifactSigner for FixedSigner {
        async fn presign(&self, _request: &PresignRequest) -> JobsResult<PresignedArtifact> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PresignedArtifact {
                url: "https://cdn.local/shared.zip".to_string(),
                size_bytes: 10,
            })
        }
    }

    #[tokio::test]
    async fn local_signer_reports_size_and_verifies() {
        let dir = artifact_dir("archive.zip", 52_428_800).await;
        let signer = Arc::new(LocalArtifactSigner::new(&dir, "https://files.local/", "s3cret"));
        let publisher = ResultPublisher::new(signer.clone(), Duration::from_secs(3600));

        let before = Utc::now();
        let job_id = JobId::new();
        let result = publisher.publish(&job_id, "archive.zip").await.unwrap();

        assert_eq!(result.size_bytes, 52_428_800);
        assert!(result.access_url.starts_with("https://files.local/archive.zip?"));
        assert!(result.expires_at > before + chrono::Duration::seconds(3598));
        assert!(result.expires_at <= before + chrono::Duration::seconds(3600));

        assert!(signer.verify(&result.access_url, Utc::now()));
        assert!(!signer.verify(&result.access_url, result.expires_at));
        assert!(!signer.verify(&result.access_url.replace("archive.zip", "other.zip"), Utc::now()));

        let forged = LocalArtifactSigner::new(&dir, "https://files.local", "guess");
        assert!(!forged.verify(&result.access_url, Utc::now()));

        tokio::fs::remove_dir_all(dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found_and_escapes_are_rejected() {
        let dir = artifact_dir("present.zip", 1).await;
        let publisher = ResultPublisher::new(
            Arc::new(LocalArtifactSigner::new(&dir, "https://files.local", "s3cret")),
            Duration::from_secs(60),
        );

        let err = publisher.publish(&JobId::new(), "absent.zip").await.unwrap_err();
        assert!(matches!(err, JobsError::NotFound(_)));

        let err = publisher.publish(&JobId::new(), "../etc/passwd").await.unwrap_err();
        assert!(matches!(err, JobsError::InvalidArgument(_)));

        tokio::fs::remove_dir_all(dir).await.unwrap();
    }

    #[tokio::test]
    async fn republishing_reuses_the_live_credential() {
        let signer = Arc::new(FixedSigner { calls: AtomicUsize::new(0) });
        let publisher = ResultPublisher::new(signer.clone(), Duration::from_secs(60));
        let job_id = JobId::new();

        let first = publisher.publish(&job_id, "a.zip").await.unwrap();
        let second = publisher.publish(&job_id, "a.zip").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_new_location_gets_a_new_credential() {
        let dir = artifact_dir("first.zip", 4).await;
        let file = tokio::fs::File::create(dir.join("second.zip")).await.unwrap();
        file.set_len(8).await.unwrap();
        let publisher = ResultPublisher::new(
            Arc::new(LocalArtifactSigner::new(&dir, "https://files.local", "s3cret")),
            Duration::from_secs(60),
        );
        let job_id = JobId::new();

        let first = publisher.publish(&job_id, "first.zip").await.unwrap();
        let second = publisher.publish(&job_id, "second.zip").await.unwrap();
        assert!(second.access_url.starts_with("https://files.local/second.zip?"));
        assert_eq!(second.size_bytes, 8);
        assert_ne!(first.access_url, second.access_url);
        assert_eq!(publisher.issued_count(), 1);
        assert_eq!(publisher.publish(&job_id, "second.zip").await.unwrap(), second);

        tokio::fs::remove_dir_all(dir).await.unwrap();
    }

    #[tokio::test]
    async fn a_url_is_never_shared_between_jobs() {
        let publisher = ResultPublisher::new(
            Arc::new(FixedSigner { calls: AtomicUsize::new(0) }),
            Duration::from_secs(60),
        );

        publisher.publish(&JobId::new(), "a.zip").await.unwrap();
        let err = publisher.publish(&JobId::new(), "a.zip").await.unwrap_err();
        assert!(matches!(err, JobsError::Conflict(_)));
    }

    #[tokio::test]
    async fn prune_drops_expired_credentials() {
        let publisher = ResultPublisher::new(
            Arc::new(FixedSigner { calls: AtomicUsize::new(0) }),
            Duration::from_secs(60),
        );
        publisher.publish(&JobId::new(), "a.zip").await.unwrap();

        assert_eq!(publisher.prune(Utc::now()), 0);
        assert_eq!(publisher.prune(Utc::now() + chrono::Duration::seconds(61)), 1);
        assert_eq!(publisher.issued_count(), 0);

        // The URL is free again once its owner's credential is gone
        publisher.publish(&JobId::new(), "a.zip").await.unwrap();
    }
}
