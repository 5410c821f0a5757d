use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mini_moka::sync::Cache;
use prism_config::LifecycleConfig;
use prism_core::RequestContext;

use super::batch::{self, BatchCreate, BatchJob, BatchResultItem, BatchSource, BatchStatus};
use super::files::{FileContent, FileObject, FilePurpose, FileStatus, FileUpload};
use super::{ListQuery, Page};
use crate::capability::{BatchMode, CapabilityRegistry, Scenario};
use crate::error::LlmError;
use crate::provider::Provider;
use crate::retry::RetryPolicy;

/// Batch and file operations across providers
///
/// Jobs and files are owned by the provider that backs them; the manager
/// keeps only a mirror of the last observed state, keyed by provider and
/// id, to validate transitions and to answer terminal-state checks without
/// an upstream call.
///
/// The mirror is bounded in size and age. Transition checks only hold
/// while an entry is mirrored; an evicted job is taken as the provider
/// reports it on the next observation.
pub struct LifecycleManager {
    registry: Arc<CapabilityRegistry>,
    providers: HashMap<String, Arc<dyn Provider>>,
    retry: RetryPolicy,
    batches: Cache<String, BatchJob>,
    files: Cache<String, FileObject>,
}

fn cache_key(provider: &str, id: &str) -> String {
    format!("{provider}:{id}")
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        providers: HashMap<String, Arc<dyn Provider>>,
        retry: RetryPolicy,
        config: &LifecycleConfig,
    ) -> Self {
        let ttl = Duration::from_secs(config.mirror_ttl_secs);

        Self {
            registry,
            providers,
            retry,
            batches: Cache::builder()
                .max_capacity(config.mirror_capacity)
                .time_to_live(ttl)
                .build(),
            files: Cache::builder()
                .max_capacity(config.mirror_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Submission path `provider` requires, for callers deciding how to build a batch
    pub fn batch_mode(&self, provider: &str) -> Option<BatchMode> {
        self.registry.batch_mode(provider)
    }

    fn provider(&self, name: &str) -> Result<&Arc<dyn Provider>, LlmError> {
        self.providers.get(name).ok_or_else(|| LlmError::UnknownProvider {
            provider: name.to_owned(),
        })
    }

    fn require(&self, provider: &str, scenario: Scenario) -> Result<(), LlmError> {
        if self.registry.supports_scenario(provider, scenario) {
            Ok(())
        } else {
            Err(LlmError::unsupported(provider, scenario.as_str()))
        }
    }

    // -- Batches --

    /// Create a batch on `provider`, bridging inline and file-backed sources
    ///
    /// Inline requests sent to a file-backed provider are uploaded as a
    /// JSONL file first. A file sent to an inline provider is downloaded and
    /// expanded, which needs the `file_download` capability.
    pub async fn create_batch(
        &self,
        provider_name: &str,
        mut create: BatchCreate,
        context: &RequestContext,
    ) -> Result<BatchJob, LlmError> {
        let provider = self.provider(provider_name)?;
        let Some(mode) = self.batch_mode(provider_name) else {
            return Err(LlmError::unsupported(provider_name, Scenario::Batch.as_str()));
        };

        create.source = match (mode, create.source) {
            (BatchMode::FileBacked, BatchSource::Inline(items)) => {
                self.require(provider_name, Scenario::Files)?;
                if items.is_empty() {
                    return Err(LlmError::InvalidRequest("batch has no requests".to_owned()));
                }

                let upload = FileUpload::jsonl(
                    format!("batch_{}.jsonl", uuid::Uuid::new_v4().simple()),
                    FilePurpose::Batch,
                    batch::to_jsonl(&items)?,
                );
                let file = self.upload_file(provider_name, upload, context).await?;
                tracing::debug!(provider = %provider_name, file_id = %file.id, count = items.len(), "materialized inline batch");

                BatchSource::File(file.id)
            }
            (BatchMode::FileBacked, BatchSource::File(id)) => {
                if self.registry.supports_scenario(provider_name, Scenario::Files) {
                    let file = self.retrieve_file(provider_name, &id, context).await?;
                    if file.purpose != FilePurpose::Batch {
                        return Err(LlmError::InvalidRequest(format!(
                            "file '{id}' has purpose '{}', expected 'batch'",
                            file.purpose
                        )));
                    }
                }

                BatchSource::File(id)
            }
            (BatchMode::Inline, BatchSource::File(id)) => {
                let content = self.file_content(provider_name, &id, context).await?;
                let items = batch::from_jsonl(&content.data)?;
                tracing::debug!(provider = %provider_name, file_id = %id, count = items.len(), "expanded batch file inline");

                BatchSource::Inline(items)
            }
            (BatchMode::Inline, BatchSource::Inline(items)) => {
                if items.is_empty() {
                    return Err(LlmError::InvalidRequest("batch has no requests".to_owned()));
                }

                BatchSource::Inline(items)
            }
        };

        let job = provider.create_batch(&create, context).await?;
        tracing::info!(provider = %provider_name, batch_id = %job.id, status = %job.status, "batch created");

        Ok(self.observe(provider_name, job))
    }

    pub async fn retrieve_batch(
        &self,
        provider_name: &str,
        id: &str,
        context: &RequestContext,
    ) -> Result<BatchJob, LlmError> {
        let provider = self.provider(provider_name)?;
        self.require(provider_name, Scenario::Batch)?;

        let job = self
            .retry
            .run("retrieve_batch", || provider.retrieve_batch(id, context))
            .await?;

        Ok(self.observe(provider_name, job))
    }

    pub async fn list_batches(
        &self,
        provider_name: &str,
        query: &ListQuery,
        context: &RequestContext,
    ) -> Result<Page<BatchJob>, LlmError> {
        let provider = self.provider(provider_name)?;
        self.require(provider_name, Scenario::Batch)?;

        let page = self
            .retry
            .run("list_batches", || provider.list_batches(query, context))
            .await?;

        Ok(page.map(|job| self.observe(provider_name, job)))
    }

    /// Request cancellation of a non-terminal job
    ///
    /// # Errors
    ///
    /// `AlreadyTerminal` when the job has already finished; this is checked
    /// against the freshest state before the cancel call is sent.
    pub async fn cancel_batch(
        &self,
        provider_name: &str,
        id: &str,
        context: &RequestContext,
    ) -> Result<BatchJob, LlmError> {
        let provider = self.provider(provider_name)?;
        self.require(provider_name, Scenario::Batch)?;

        let current = match self.cached_batch(provider_name, id) {
            Some(job) if job.status.is_terminal() => job,
            _ => self.retrieve_batch(provider_name, id, context).await?,
        };

        if current.status.is_terminal() {
            return Err(LlmError::AlreadyTerminal {
                resource: "batch",
                id: id.to_owned(),
                state: current.status.to_string(),
            });
        }

        let job = provider.cancel_batch(id, context).await?;
        tracing::info!(provider = %provider_name, batch_id = %id, status = %job.status, "batch cancellation requested");

        Ok(self.observe(provider_name, job))
    }

    /// Per-request outcomes of a finished job
    pub async fn batch_results(
        &self,
        provider_name: &str,
        id: &str,
        context: &RequestContext,
    ) -> Result<Vec<BatchResultItem>, LlmError> {
        let provider = self.provider(provider_name)?;
        let job = self.retrieve_batch(provider_name, id, context).await?;

        if !job.status.is_terminal() {
            return Err(LlmError::InvalidRequest(format!(
                "batch '{id}' is still {}; results are available once it ends",
                job.status
            )));
        }

        self.retry
            .run("batch_results", || provider.batch_results(&job, context))
            .await
    }

    /// Last observed state of a job, without an upstream call
    pub fn cached_batch(&self, provider: &str, id: &str) -> Option<BatchJob> {
        self.batches.get(&cache_key(provider, id))
    }

    /// Record an upstream observation, rejecting backwards transitions
    ///
    /// A terminal job never changes again; a regression from a lagging
    /// upstream replica keeps the previously observed status. Fields only
    /// known at creation time (endpoint, input file, metadata) survive
    /// observations from providers that do not echo them.
    fn observe(&self, provider: &str, mut job: BatchJob) -> BatchJob {
        job.provider = provider.to_owned();

        let key = cache_key(provider, &job.id);
        let Some(entry) = self.batches.get(&key) else {
            self.batches.insert(key, job.clone());
            return job;
        };

        let previous = entry.status;
        job.endpoint = entry.endpoint;
        if job.input_file_id.is_none() {
            job.input_file_id.clone_from(&entry.input_file_id);
        }
        if job.metadata.is_none() {
            job.metadata.clone_from(&entry.metadata);
        }

        if !previous.can_transition_to(job.status) {
            tracing::warn!(
                provider,
                batch_id = %job.id,
                from = %previous,
                to = %job.status,
                "ignoring backwards batch status transition"
            );
            job.status = previous;
        } else if previous != job.status {
            tracing::debug!(provider, batch_id = %job.id, from = %previous, to = %job.status, "batch status changed");
        }

        self.batches.insert(key, job.clone());
        job
    }

    // -- Files --

    pub async fn upload_file(
        &self,
        provider_name: &str,
        upload: FileUpload,
        context: &RequestContext,
    ) -> Result<FileObject, LlmError> {
        let provider = self.provider(provider_name)?;
        self.require(provider_name, Scenario::Files)?;

        let file = provider.upload_file(&upload, context).await?;
        tracing::info!(provider = %provider_name, file_id = %file.id, bytes = file.bytes, "file uploaded");

        self.files.insert(cache_key(provider_name, &file.id), file.clone());
        Ok(file)
    }

    pub async fn list_files(
        &self,
        provider_name: &str,
        query: &ListQuery,
        context: &RequestContext,
    ) -> Result<Page<FileObject>, LlmError> {
        let provider = self.provider(provider_name)?;
        self.require(provider_name, Scenario::Files)?;

        let page = self
            .retry
            .run("list_files", || provider.list_files(query, context))
            .await?;

        for file in &page.data {
            self.files.insert(cache_key(provider_name, &file.id), file.clone());
        }

        Ok(page)
    }

    pub async fn retrieve_file(
        &self,
        provider_name: &str,
        id: &str,
        context: &RequestContext,
    ) -> Result<FileObject, LlmError> {
        let provider = self.provider(provider_name)?;
        self.require(provider_name, Scenario::Files)?;
        self.ensure_not_deleted(provider_name, id)?;

        let file = self
            .retry
            .run("retrieve_file", || provider.retrieve_file(id, context))
            .await?;

        self.files.insert(cache_key(provider_name, id), file.clone());
        Ok(file)
    }

    /// Download file bytes
    ///
    /// Whether a provider allows downloads is a capability, so an
    /// unsupported download fails before any upstream call.
    pub async fn file_content(
        &self,
        provider_name: &str,
        id: &str,
        context: &RequestContext,
    ) -> Result<FileContent, LlmError> {
        let provider = self.provider(provider_name)?;
        self.require(provider_name, Scenario::FileDownload)?;
        self.ensure_not_deleted(provider_name, id)?;

        self.retry
            .run("file_content", || provider.file_content(id, context))
            .await
    }

    pub async fn delete_file(
        &self,
        provider_name: &str,
        id: &str,
        context: &RequestContext,
    ) -> Result<FileObject, LlmError> {
        let provider = self.provider(provider_name)?;
        self.require(provider_name, Scenario::Files)?;
        self.ensure_not_deleted(provider_name, id)?;

        let mut file = provider.delete_file(id, context).await?;
        file.status = FileStatus::Deleted;
        tracing::info!(provider = %provider_name, file_id = %id, "file deleted");

        self.files.insert(cache_key(provider_name, id), file.clone());
        Ok(file)
    }

    fn ensure_not_deleted(&self, provider: &str, id: &str) -> Result<(), LlmError> {
        match self.files.get(&cache_key(provider, id)) {
            Some(file) if file.status == FileStatus::Deleted => Err(LlmError::AlreadyTerminal {
                resource: "file",
                id: id.to_owned(),
                state: FileStatus::Deleted.as_str().to_owned(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use prism_config::LlmConfig;
    use serde_json::json;

    use super::*;
    use crate::capability::ProviderKind;
    use crate::lifecycle::{BatchEndpoint, BatchRequestItem};
    use crate::stream::EventStream;
    use crate::types::{CompletionRequest, CompletionResponse};

    /// Scripted batch/file backend
    #[derive(Default)]
    struct Scripted {
        statuses: Mutex<Vec<BatchStatus>>,
        created: Mutex<Vec<BatchCreate>>,
        uploads: Mutex<Vec<FileUpload>>,
        cancels: AtomicUsize,
        downloads: AtomicUsize,
        transient_failures: AtomicUsize,
    }

    impl Scripted {
        fn with_statuses(statuses: &[BatchStatus]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().rev().copied().collect()),
                ..Self::default()
            }
        }

        fn job(id: &str, status: BatchStatus) -> BatchJob {
            BatchJob {
                status,
                ..BatchJob::created(id, BatchEndpoint::ChatCompletions)
            }
        }

        fn next_status(&self) -> BatchStatus {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                statuses.pop().unwrap()
            } else {
                statuses.last().copied().unwrap_or(BatchStatus::InProgress)
            }
        }

        fn file(id: &str) -> FileObject {
            FileObject {
                id: id.to_owned(),
                filename: "input.jsonl".to_owned(),
                purpose: FilePurpose::Batch,
                bytes: 42,
                created_at: 0,
                status: FileStatus::Processed,
                content_type: None,
            }
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        async fn complete(&self, _: &CompletionRequest, _: &RequestContext) -> Result<CompletionResponse, LlmError> {
            unreachable!("not used")
        }

        async fn complete_stream(&self, _: &CompletionRequest, _: &RequestContext) -> Result<EventStream, LlmError> {
            unreachable!("not used")
        }

        async fn upload_file(&self, upload: &FileUpload, _: &RequestContext) -> Result<FileObject, LlmError> {
            self.uploads.lock().unwrap().push(upload.clone());
            Ok(Self::file("file-uploaded"))
        }

        async fn retrieve_file(&self, id: &str, _: &RequestContext) -> Result<FileObject, LlmError> {
            Ok(Self::file(id))
        }

        async fn file_content(&self, _: &str, _: &RequestContext) -> Result<FileContent, LlmError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(FileContent {
                content_type: "application/jsonl".to_owned(),
                data: br#"{"custom_id":"a","url":"/v1/chat/completions","body":{}}"#.to_vec(),
            })
        }

        async fn delete_file(&self, id: &str, _: &RequestContext) -> Result<FileObject, LlmError> {
            Ok(Self::file(id))
        }

        async fn create_batch(&self, create: &BatchCreate, _: &RequestContext) -> Result<BatchJob, LlmError> {
            self.created.lock().unwrap().push(create.clone());
            Ok(Self::job("batch_1", BatchStatus::Validating))
        }

        async fn retrieve_batch(&self, id: &str, _: &RequestContext) -> Result<BatchJob, LlmError> {
            if self.transient_failures.load(Ordering::SeqCst) > 0 {
                self.transient_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(LlmError::upstream("scripted", Some(503), "overloaded"));
            }
            Ok(Self::job(id, self.next_status()))
        }

        async fn cancel_batch(&self, id: &str, _: &RequestContext) -> Result<BatchJob, LlmError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(Self::job(id, BatchStatus::Cancelling))
        }
    }

    fn manager(capabilities: &str, provider: Arc<Scripted>) -> LifecycleManager {
        let config: LlmConfig = toml::from_str(&format!(
            r#"
            [providers.scripted]
            type = "openai"
            capabilities = {{ {capabilities} }}
            "#
        ))
        .unwrap();
        let registry = Arc::new(CapabilityRegistry::from_config(&config));
        let providers = HashMap::from([("scripted".to_owned(), provider as Arc<dyn Provider>)]);

        LifecycleManager::new(registry, providers, RetryPolicy::none(), &LifecycleConfig::default())
    }

    fn inline(count: usize) -> BatchCreate {
        let items = (0..count)
            .map(|i| BatchRequestItem {
                custom_id: format!("req-{i}"),
                method: "POST".to_owned(),
                url: "/v1/chat/completions".to_owned(),
                body: json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]}),
            })
            .collect();

        BatchCreate {
            endpoint: BatchEndpoint::ChatCompletions,
            source: BatchSource::Inline(items),
            completion_window: "24h".to_owned(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn inline_requests_are_uploaded_for_file_backed_providers() {
        let provider = Arc::new(Scripted::default());
        let manager = manager("", provider.clone());

        let job = manager
            .create_batch("scripted", inline(2), &RequestContext::empty())
            .await
            .unwrap();

        assert_eq!(job.provider, "scripted");
        assert_eq!(job.status, BatchStatus::Validating);

        let uploads = provider.uploads.lock().unwrap();
        assert_eq!(uploads[0].purpose, FilePurpose::Batch);
        assert_eq!(batch::from_jsonl(&uploads[0].data).unwrap().len(), 2);

        let created = provider.created.lock().unwrap();
        assert!(matches!(&created[0].source, BatchSource::File(id) if id == "file-uploaded"));
    }

    #[tokio::test]
    async fn batch_mode_is_discoverable_and_unsupported_batches_fail_fast() {
        let manager = manager("batch = false", Arc::new(Scripted::default()));
        assert!(manager.batch_mode("scripted").is_none());

        let err = manager
            .create_batch("scripted", inline(1), &RequestContext::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::UnsupportedCapability { capability, .. } if capability == "batch"));

        let err = manager
            .retrieve_batch("missing", "batch_1", &RequestContext::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::UnknownProvider { .. }));
    }

    #[tokio::test]
    async fn cancel_on_terminal_job_is_already_terminal() {
        let provider = Arc::new(Scripted::with_statuses(&[BatchStatus::Completed]));
        let manager = manager("", provider.clone());
        let ctx = RequestContext::empty();

        let err = manager.cancel_batch("scripted", "batch_1", &ctx).await.unwrap_err();
        assert!(matches!(&err, LlmError::AlreadyTerminal { state, .. } if state == "completed"));

        // The cached terminal state answers without another upstream call
        let err = manager.cancel_batch("scripted", "batch_1", &ctx).await.unwrap_err();
        assert!(matches!(err, LlmError::AlreadyTerminal { .. }));
        assert_eq!(provider.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_on_running_job_moves_to_cancelling() {
        let provider = Arc::new(Scripted::with_statuses(&[BatchStatus::InProgress]));
        let manager = manager("", provider.clone());

        let job = manager
            .cancel_batch("scripted", "batch_1", &RequestContext::empty())
            .await
            .unwrap();

        assert_eq!(job.status, BatchStatus::Cancelling);
        assert_eq!(provider.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backwards_transitions_keep_the_observed_status() {
        let provider = Arc::new(Scripted::with_statuses(&[
            BatchStatus::InProgress,
            BatchStatus::Completed,
            BatchStatus::InProgress,
        ]));
        let manager = manager("", provider);
        let ctx = RequestContext::empty();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            statuses.push(manager.retrieve_batch("scripted", "batch_1", &ctx).await.unwrap().status);
        }

        assert_eq!(
            statuses,
            [BatchStatus::InProgress, BatchStatus::Completed, BatchStatus::Completed]
        );
    }

    #[tokio::test]
    async fn mirrored_jobs_expire_after_their_ttl() {
        let provider = Arc::new(Scripted::with_statuses(&[BatchStatus::Completed, BatchStatus::InProgress]));
        let config: LlmConfig = toml::from_str(
            r#"
            [lifecycle]
            mirror_capacity = 16
            mirror_ttl_secs = 1

            [providers.scripted]
            type = "openai"
            "#,
        )
        .unwrap();
        let registry = Arc::new(CapabilityRegistry::from_config(&config));
        let providers = HashMap::from([("scripted".to_owned(), provider as Arc<dyn Provider>)]);
        let manager = LifecycleManager::new(registry, providers, RetryPolicy::none(), &config.lifecycle);
        let ctx = RequestContext::empty();

        // Within the window a lagging replica cannot move the job backwards
        for _ in 0..2 {
            let job = manager.retrieve_batch("scripted", "batch_1", &ctx).await.unwrap();
            assert_eq!(job.status, BatchStatus::Completed);
        }
        assert!(manager.cached_batch("scripted", "batch_1").is_some());

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert!(manager.cached_batch("scripted", "batch_1").is_none());

        // Once forgotten the provider's report is taken as is
        let job = manager.retrieve_batch("scripted", "batch_1", &ctx).await.unwrap();
        assert_eq!(job.status, BatchStatus::InProgress);
    }

    #[tokio::test]
    async fn retrieve_retries_transient_failures() {
        let provider = Arc::new(Scripted::with_statuses(&[BatchStatus::InProgress]));
        provider.transient_failures.store(2, Ordering::SeqCst);

        let config: LlmConfig = toml::from_str(
            r#"
            [retry]
            max_retries = 2
            base_delay_ms = 1
            max_delay_ms = 2

            [providers.scripted]
            type = "openai"
            "#,
        )
        .unwrap();
        let registry = Arc::new(CapabilityRegistry::from_config(&config));
        let providers = HashMap::from([("scripted".to_owned(), provider as Arc<dyn Provider>)]);
        let manager = LifecycleManager::new(
            registry,
            providers,
            RetryPolicy::from_config(&config.retry),
            &config.lifecycle,
        );

        let job = manager
            .retrieve_batch("scripted", "batch_1", &RequestContext::empty())
            .await
            .unwrap();
        assert_eq!(job.status, BatchStatus::InProgress);
    }

    #[tokio::test]
    async fn download_is_a_capability_check() {
        let provider = Arc::new(Scripted::default());
        let manager = manager("file_download = false", provider.clone());

        let err = manager
            .file_content("scripted", "file-1", &RequestContext::empty())
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::UnsupportedCapability { capability, .. } if capability == "file_download"));
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deleted_files_are_terminal() {
        let manager = manager("", Arc::new(Scripted::default()));
        let ctx = RequestContext::empty();

        let deleted = manager.delete_file("scripted", "file-1", &ctx).await.unwrap();
        assert_eq!(deleted.status, FileStatus::Deleted);

        let err = manager.retrieve_file("scripted", "file-1", &ctx).await.unwrap_err();
        assert!(matches!(err, LlmError::AlreadyTerminal { resource: "file", .. }));
        assert!(manager.delete_file("scripted", "file-1", &ctx).await.is_err());
    }
}
