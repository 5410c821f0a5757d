//! AWS Bedrock provider using the Converse API
//!
//! Chat goes through `bedrock-runtime`; model listing and batch inference
//! (model invocation jobs) go through the `bedrock` control plane.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::Region;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_bedrock::types::{
    ModelInvocationJobInputDataConfig, ModelInvocationJobOutputDataConfig, ModelInvocationJobS3InputDataConfig,
    ModelInvocationJobS3OutputDataConfig, ModelInvocationJobStatus,
};
use aws_sdk_bedrockruntime::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_smithy_types::DateTime;
use futures_util::stream;
use prism_config::{BedrockConfig, LlmProviderConfig};
use prism_core::RequestContext;
use secrecy::ExposeSecret;

use super::Provider;
use crate::capability::{ProviderKind, Scenario};
use crate::convert::bedrock::{BedrockStreamDecoder, ConverseChunk, ConverseInput, message_parts, stop_reason};
use crate::error::LlmError;
use crate::lifecycle::{BatchCreate, BatchEndpoint, BatchJob, BatchSource, BatchStatus, ListQuery, Page};
use crate::stream::EventStream;
use crate::types::{CompletionRequest, CompletionResponse, ModelInfo, Usage};

/// Metadata key naming the model an invocation job runs against
const BATCH_MODEL_KEY: &str = "model";

/// Metadata key overriding the generated invocation job name
const BATCH_NAME_KEY: &str = "job_name";

/// AWS Bedrock provider
pub struct BedrockProvider {
    name: String,
    runtime: aws_sdk_bedrockruntime::Client,
    control: aws_sdk_bedrock::Client,
    /// Bound on a whole `converse` call; the runtime client itself only
    /// bounds connects and stream silence
    request_timeout: Duration,
    batch_role_arn: Option<String>,
    batch_output_uri: Option<String>,
}

impl BedrockProvider {
    /// Create from provider configuration
    ///
    /// Static keys are used when both are configured; otherwise the default
    /// AWS credential chain applies.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature matches the other backends.
    pub async fn new(name: String, config: &LlmProviderConfig, bedrock: &BedrockConfig) -> Result<Self, LlmError> {
        let connect = Duration::from_secs(config.timeouts.connect);
        let request_timeout = Duration::from_secs(config.timeouts.request);

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(bedrock.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(connect)
                    .read_timeout(Duration::from_secs(config.timeouts.stream_idle))
                    .build(),
            );

        if let (Some(access_key), Some(secret_key)) = (&bedrock.access_key_id, &bedrock.secret_access_key) {
            let credentials = aws_credential_types::Credentials::new(
                access_key.expose_secret(),
                secret_key.expose_secret(),
                None,
                None,
                "prism-config",
            );
            loader = loader.credentials_provider(credentials);
        }

        let sdk_config = loader.load().await;
        tracing::debug!(provider = %name, region = %bedrock.region, "bedrock clients configured");

        let control_config = sdk_config
            .to_builder()
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(connect)
                    .operation_timeout(request_timeout)
                    .build(),
            )
            .build();

        Ok(Self {
            name,
            runtime: aws_sdk_bedrockruntime::Client::new(&sdk_config),
            control: aws_sdk_bedrock::Client::new(&control_config),
            request_timeout,
            batch_role_arn: bedrock.batch_role_arn.clone(),
            batch_output_uri: bedrock.batch_output_uri.clone(),
        })
    }

    fn sdk_error<E, R>(&self, operation: &str, error: &SdkError<E, R>) -> LlmError
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        tracing::error!(provider = %self.name, operation, error = %DisplayErrorContext(error), "bedrock call failed");

        if matches!(error, SdkError::TimeoutError(_)) {
            return LlmError::UpstreamTimeout {
                provider: self.name.clone(),
            };
        }

        let status = error.code().and_then(status_for_code);
        let message = error
            .message()
            .map_or_else(|| DisplayErrorContext(error).to_string(), ToOwned::to_owned);

        LlmError::upstream(&self.name, status, message)
    }

    async fn describe_job(&self, id: &str) -> Result<BatchJob, LlmError> {
        let output = self
            .control
            .get_model_invocation_job()
            .job_identifier(id)
            .send()
            .await
            .map_err(|e| self.sdk_error("get_model_invocation_job", &e))?;

        let mut job = BatchJob {
            status: job_status(output.status()),
            completed_at: output.end_time().map(DateTime::secs),
            expires_at: output.job_expiration_time().map(DateTime::secs),
            input_file_id: output
                .input_data_config()
                .and_then(|config| config.as_s3_input_data_config().ok())
                .map(|s3| s3.s3_uri().to_owned()),
            output_file_id: output
                .output_data_config()
                .and_then(|config| config.as_s3_output_data_config().ok())
                .map(|s3| s3.s3_uri().to_owned()),
            ..BatchJob::created(job_id(output.job_arn()), BatchEndpoint::ChatCompletions)
        };
        job.created_at = output.submit_time().secs();

        if let Some(message) = output.message() {
            tracing::debug!(provider = %self.name, batch_id = %job.id, message, "invocation job message");
        }

        Ok(job)
    }
}

/// HTTP status implied by an AWS error code
fn status_for_code(code: &str) -> Option<u16> {
    Some(match code {
        "ValidationException" => 400,
        "AccessDeniedException" | "UnrecognizedClientException" => 403,
        "ResourceNotFoundException" => 404,
        "ConflictException" => 409,
        "ServiceQuotaExceededException" | "ThrottlingException" => 429,
        "ModelNotReadyException" | "ServiceUnavailableException" => 503,
        "ModelTimeoutException" => 504,
        "InternalServerException" | "ModelErrorException" => 500,
        _ => return None,
    })
}

/// Short job id from a job ARN
///
/// Invocation job APIs accept either form; the short one is path-safe.
fn job_id(arn: &str) -> String {
    arn.rsplit('/').next().unwrap_or(arn).to_owned()
}

fn job_status(status: Option<&ModelInvocationJobStatus>) -> BatchStatus {
    let Some(status) = status else {
        return BatchStatus::Validating;
    };

    BatchStatus::from_bedrock(status.as_str()).unwrap_or_else(|| {
        tracing::warn!(status = %status.as_str(), "unknown invocation job status");
        BatchStatus::InProgress
    })
}

/// Model and job name for an invocation job
///
/// Jobs read their records from an S3 object, so the model cannot be taken
/// from the requests and must be named in the batch metadata.
fn job_params(create: &BatchCreate) -> Result<(String, String, String), LlmError> {
    let BatchSource::File(input_uri) = &create.source else {
        return Err(LlmError::InvalidRequest(
            "Bedrock batches read their input from an S3 URI".to_owned(),
        ));
    };

    if !input_uri.starts_with("s3://") {
        return Err(LlmError::InvalidRequest(format!(
            "Bedrock batch input must be an S3 URI, got '{input_uri}'"
        )));
    }

    let metadata = create.metadata.as_ref();
    let model = metadata
        .and_then(|m| m.get(BATCH_MODEL_KEY))
        .and_then(|v| v.as_str())
        .ok_or_else(|| LlmError::InvalidRequest(format!("Bedrock batches need a '{BATCH_MODEL_KEY}' metadata entry")))?;
    let model = model.split_once('/').map_or(model, |(_, rest)| rest).to_owned();

    let job_name = metadata
        .and_then(|m| m.get(BATCH_NAME_KEY))
        .and_then(|v| v.as_str())
        .map_or_else(|| format!("prism-batch-{}", uuid::Uuid::new_v4().simple()), ToOwned::to_owned);

    Ok((input_uri.clone(), model, job_name))
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Bedrock
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        _context: &RequestContext,
    ) -> Result<CompletionResponse, LlmError> {
        let input = ConverseInput::try_from(request)?;
        let started = Instant::now();

        let call = self
            .runtime
            .converse()
            .model_id(&request.model)
            .set_system(Some(input.system))
            .set_messages(Some(input.messages))
            .inference_config(input.inference_config)
            .set_tool_config(input.tool_config)
            .set_additional_model_request_fields(input.additional_fields)
            .send();

        let output = tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| {
                tracing::error!(provider = %self.name, model = %request.model, "converse timed out");
                LlmError::UpstreamTimeout {
                    provider: self.name.clone(),
                }
            })?
            .map_err(|e| self.sdk_error("converse", &e))?;

        tracing::debug!(
            provider = %self.name,
            model = %request.model,
            elapsed_ms = started.elapsed().as_millis(),
            "converse completed"
        );

        let content = output
            .output()
            .and_then(|out| out.as_message().ok())
            .map(message_parts)
            .unwrap_or_default();

        Ok(CompletionResponse {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: request.model.clone(),
            content,
            stop_reason: Some(stop_reason(output.stop_reason())),
            usage: output.usage().map(Usage::from).unwrap_or_default(),
        })
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        _context: &RequestContext,
    ) -> Result<EventStream, LlmError> {
        let input = ConverseInput::try_from(request)?;

        let output = self
            .runtime
            .converse_stream()
            .model_id(&request.model)
            .set_system(Some(input.system))
            .set_messages(Some(input.messages))
            .inference_config(input.inference_config)
            .set_tool_config(input.tool_config)
            .set_additional_model_request_fields(input.additional_fields)
            .send()
            .await
            .map_err(|e| self.sdk_error("converse_stream", &e))?;

        let provider = self.name.clone();
        let chunks = stream::unfold(Some(output.stream), move |receiver| {
            let provider = provider.clone();
            async move {
                let mut receiver = receiver?;
                match receiver.recv().await {
                    Ok(Some(event)) => Some((Ok(ConverseChunk::from(event)), Some(receiver))),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!(provider = %provider, error = %DisplayErrorContext(&e), "converse stream failed");
                        let message = e
                            .message()
                            .map_or_else(|| DisplayErrorContext(&e).to_string(), ToOwned::to_owned);
                        Some((Err(LlmError::upstream(&provider, None, message)), None))
                    }
                }
            }
        });

        Ok(crate::stream::normalize(
            &self.name,
            &request.model,
            chunks,
            BedrockStreamDecoder::new(request.model.clone()),
        ))
    }

    async fn list_models(&self, _context: &RequestContext) -> Result<Vec<ModelInfo>, LlmError> {
        let output = self
            .control
            .list_foundation_models()
            .send()
            .await
            .map_err(|e| self.sdk_error("list_foundation_models", &e))?;

        Ok(output
            .model_summaries()
            .iter()
            .map(|summary| ModelInfo {
                display_name: summary.model_name().map(ToOwned::to_owned),
                owned_by: summary.provider_name().map(ToOwned::to_owned),
                ..ModelInfo::new(summary.model_id())
            })
            .collect())
    }

    async fn create_batch(&self, create: &BatchCreate, _context: &RequestContext) -> Result<BatchJob, LlmError> {
        let (Some(role_arn), Some(output_uri)) = (&self.batch_role_arn, &self.batch_output_uri) else {
            return Err(LlmError::unsupported(&self.name, Scenario::Batch.as_str()));
        };
        let (input_uri, model, job_name) = job_params(create)?;

        let input = ModelInvocationJobS3InputDataConfig::builder()
            .s3_uri(&input_uri)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;
        let output = ModelInvocationJobS3OutputDataConfig::builder()
            .s3_uri(output_uri)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let created = self
            .control
            .create_model_invocation_job()
            .job_name(&job_name)
            .role_arn(role_arn)
            .model_id(&model)
            .input_data_config(ModelInvocationJobInputDataConfig::S3InputDataConfig(input))
            .output_data_config(ModelInvocationJobOutputDataConfig::S3OutputDataConfig(output))
            .send()
            .await
            .map_err(|e| self.sdk_error("create_model_invocation_job", &e))?;

        tracing::info!(provider = %self.name, job_name = %job_name, model = %model, "invocation job submitted");

        Ok(BatchJob {
            input_file_id: Some(input_uri),
            output_file_id: Some(output_uri.clone()),
            metadata: create.metadata.clone(),
            ..BatchJob::created(job_id(created.job_arn()), create.endpoint)
        })
    }

    async fn list_batches(&self, query: &ListQuery, _context: &RequestContext) -> Result<Page<BatchJob>, LlmError> {
        let limit = i32::try_from(query.limit_or(20)).unwrap_or(i32::MAX);
        let output = self
            .control
            .list_model_invocation_jobs()
            .max_results(limit)
            .set_next_token(query.after.clone())
            .send()
            .await
            .map_err(|e| self.sdk_error("list_model_invocation_jobs", &e))?;

        let data = output
            .invocation_job_summaries()
            .iter()
            .map(|summary| {
                let mut job = BatchJob {
                    status: job_status(summary.status()),
                    completed_at: summary.end_time().map(DateTime::secs),
                    expires_at: summary.job_expiration_time().map(DateTime::secs),
                    ..BatchJob::created(job_id(summary.job_arn()), BatchEndpoint::ChatCompletions)
                };
                job.created_at = summary.submit_time().secs();
                job
            })
            .collect();

        let next = output.next_token().map(ToOwned::to_owned);
        Ok(Page {
            data,
            has_more: next.is_some(),
            last_id: next,
        })
    }

    async fn retrieve_batch(&self, id: &str, _context: &RequestContext) -> Result<BatchJob, LlmError> {
        self.describe_job(id).await
    }

    async fn cancel_batch(&self, id: &str, _context: &RequestContext) -> Result<BatchJob, LlmError> {
        self.control
            .stop_model_invocation_job()
            .job_identifier(id)
            .send()
            .await
            .map_err(|e| self.sdk_error("stop_model_invocation_job", &e))?;

        let mut job = self.describe_job(id).await?;
        if !job.status.is_terminal() {
            job.status = BatchStatus::Cancelling;
        }

        Ok(job)
    }

    // Results are written to S3 as `<input>.jsonl.out`; reading them back
    // needs object storage access, which this backend does not have.
    async fn batch_results(
        &self,
        _job: &BatchJob,
        _context: &RequestContext,
    ) -> Result<Vec<crate::lifecycle::BatchResultItem>, LlmError> {
        Err(LlmError::unsupported(&self.name, Scenario::FileDownload.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn create(source: BatchSource, metadata: serde_json::Value) -> BatchCreate {
        BatchCreate {
            endpoint: BatchEndpoint::ChatCompletions,
            source,
            completion_window: "24h".to_owned(),
            metadata: metadata.as_object().cloned(),
        }
    }

    #[test]
    fn job_params_need_s3_input_and_model() {
        let ok = create(
            BatchSource::File("s3://bucket/in.jsonl".to_owned()),
            json!({"model": "bedrock/anthropic.claude-3-haiku-20240307-v1:0", "job_name": "nightly"}),
        );
        let (input, model, name) = job_params(&ok).unwrap();
        assert_eq!(input, "s3://bucket/in.jsonl");
        assert_eq!(model, "anthropic.claude-3-haiku-20240307-v1:0");
        assert_eq!(name, "nightly");

        let no_model = create(BatchSource::File("s3://bucket/in.jsonl".to_owned()), json!({}));
        assert!(matches!(job_params(&no_model), Err(LlmError::InvalidRequest(_))));

        let not_s3 = create(BatchSource::File("file-abc".to_owned()), json!({"model": "m"}));
        assert!(matches!(job_params(&not_s3), Err(LlmError::InvalidRequest(_))));

        let inline = create(BatchSource::Inline(Vec::new()), json!({"model": "m"}));
        assert!(matches!(job_params(&inline), Err(LlmError::InvalidRequest(_))));
    }

    #[test]
    fn generated_job_names_are_unique() {
        let source = || BatchSource::File("s3://bucket/in.jsonl".to_owned());
        let (_, _, a) = job_params(&create(source(), json!({"model": "m"}))).unwrap();
        let (_, _, b) = job_params(&create(source(), json!({"model": "m"}))).unwrap();
        assert!(a.starts_with("prism-batch-"));
        assert_ne!(a, b);
    }

    #[test]
    fn job_ids_and_statuses() {
        assert_eq!(
            job_id("arn:aws:bedrock:us-east-1:123456789012:model-invocation-job/abc123def456"),
            "abc123def456"
        );
        assert_eq!(job_id("abc123def456"), "abc123def456");

        assert_eq!(job_status(Some(&ModelInvocationJobStatus::Completed)), BatchStatus::Completed);
        assert_eq!(job_status(Some(&ModelInvocationJobStatus::Stopping)), BatchStatus::Cancelling);
        assert_eq!(job_status(None), BatchStatus::Validating);
    }

    #[test]
    fn aws_error_codes_map_to_statuses() {
        assert_eq!(status_for_code("ThrottlingException"), Some(429));
        assert_eq!(status_for_code("ValidationException"), Some(400));
        assert_eq!(status_for_code("SomethingNew"), None);
    }
}
