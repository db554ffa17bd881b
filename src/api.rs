// src/api.rs

//! REST client for the exam server. Used for attempt start, the answer
//! fallback when the channel is down, and the final submit.

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use url::Url;

use crate::{
    error::AppError,
    models::{
        answer::SavedAnswer,
        checkpoint::{Checkpoint, CheckpointAck},
        exam::{AttemptSnapshot, ExamSnapshot, StartAttemptRequest},
        submission::{AttemptResult, SubmissionEnvelope},
    },
};

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base: Url,
    token: String,
}

impl ApiClient {
    pub fn new(api_base_url: &str, token: impl Into<String>) -> Result<Self, AppError> {
        Ok(Self {
            client: Client::new(),
            base: Url::parse(api_base_url)?,
            token: token.into(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn url(&self, path: &str) -> Result<Url, AppError> {
        Ok(self.base.join(&format!("api/v1/{}", path))?)
    }

    pub async fn get_exam(&self, exam_id: i64) -> Result<ExamSnapshot, AppError> {
        let response = self
            .client
            .get(self.url(&format!("exams/{}", exam_id))?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        parse(response).await
    }

    /// Starts (or resumes) the caller's attempt. The response carries the
    /// per-attempt encryption salt.
    pub async fn start_attempt(
        &self,
        exam_id: i64,
        workstation_id: Option<String>,
    ) -> Result<AttemptSnapshot, AppError> {
        let response = self
            .client
            .post(self.url(&format!("exams/{}/attempts", exam_id))?)
            .bearer_auth(&self.token)
            .json(&StartAttemptRequest { workstation_id })
            .send()
            .await?;
        parse(response).await
    }

    pub async fn get_attempt(&self, attempt_id: i64) -> Result<AttemptSnapshot, AppError> {
        let response = self
            .client
            .get(self.url(&format!("attempts/{}", attempt_id))?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        parse(response).await
    }

    pub async fn save_answer(&self, checkpoint: &Checkpoint) -> Result<CheckpointAck, AppError> {
        let response = self
            .client
            .post(self.url(&format!("attempts/{}/answers", checkpoint.attempt_id))?)
            .bearer_auth(&self.token)
            .json(&checkpoint.to_request())
            .send()
            .await?;
        parse(response).await
    }

    pub async fn get_answers(&self, attempt_id: i64) -> Result<Vec<SavedAnswer>, AppError> {
        let response = self
            .client
            .get(self.url(&format!("attempts/{}/answers", attempt_id))?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        parse(response).await
    }

    pub async fn submit(
        &self,
        attempt_id: i64,
        envelope: &SubmissionEnvelope,
    ) -> Result<AttemptResult, AppError> {
        let response = self
            .client
            .post(self.url(&format!("attempts/{}/submit", attempt_id))?)
            .bearer_auth(&self.token)
            .json(envelope)
            .send()
            .await?;
        parse(response).await
    }

    pub async fn get_result(&self, attempt_id: i64) -> Result<AttemptResult, AppError> {
        let response = self
            .client
            .get(self.url(&format!("attempts/{}/result", attempt_id))?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        parse(response).await
    }
}

/// Decodes a success body, or turns the server's `{"error": ...}` body into
/// `AppError::Api`.
async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, AppError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| AppError::Protocol(format!("unexpected response body: {}", e)));
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
        .unwrap_or(body);

    tracing::warn!("API call failed with {}: {}", status, message);
    Err(AppError::Api {
        status: status.as_u16(),
        message,
    })
}
