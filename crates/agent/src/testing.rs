//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use murmur_core::error::ProviderError;
use murmur_core::message::{Role, ToolCallRecord};
use murmur_core::provider::{Provider, ProviderRequest, ProviderResponse};
use serde_json::Value;

pub enum Step {
    Reply(ProviderResponse),
    /// Never answers.
    Hang,
    Fail(ProviderError),
    /// Answer with "re: " plus the newest user text, after a pause.
    EchoAfter(Duration),
}

/// Plays back a fixed script and records every request.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Step>>,
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(responses: impl IntoIterator<Item = ProviderResponse>) -> Self {
        Self::new(responses.into_iter().map(Step::Reply))
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> ProviderRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_default();
        self.requests.lock().unwrap().push(request);

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(response)) => Ok(response),
            Some(Step::Hang) => std::future::pending().await,
            Some(Step::Fail(e)) => Err(e),
            Some(Step::EchoAfter(pause)) => {
                tokio::time::sleep(pause).await;
                Ok(ProviderResponse::text(format!("re: {last_user}")))
            }
            None => Ok(ProviderResponse::text("done")),
        }
    }
}

/// The error a provider returns for an image URL it cannot fetch.
pub fn image_rejected() -> ProviderError {
    ProviderError::ApiError {
        status_code: 400,
        message: r#"{"error":{"code":"invalid_image_url","message":"Error while downloading"}}"#.into(),
    }
}

pub fn call(id: &str, name: &str, arguments: Value) -> ToolCallRecord {
    ToolCallRecord {
        id: id.into(),
        name: name.into(),
        arguments,
    }
}
