use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};

use super::{GenerateRequest, ModelHandle, ProviderResponse, VisionProvider};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub image_mime: Option<String>,
    pub temperature: f64,
    pub max_tokens: u64,
}

/// Replays queued replies in order and records every request it receives.
pub(crate) struct ScriptedProvider {
    name: String,
    replies: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            replies: Mutex::new(replies.iter().map(|reply| Ok(reply.to_string())).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Queues a transport failure after the replies already queued.
    pub fn fail_next(&self, message: &str) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Err(message.to_string()));
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn handle(self: &Arc<Self>, model: &str) -> ModelHandle {
        ModelHandle::new(self.clone(), model)
    }
}

impl VisionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, request: &GenerateRequest<'_>) -> Result<ProviderResponse> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("scripted provider lock poisoned"))?
            .push(RecordedRequest {
                model: request.model.to_string(),
                system_prompt: request.system_prompt.to_string(),
                user_prompt: request.user_prompt.to_string(),
                image_mime: request.image.map(|image| image.mime_type.clone()),
                temperature: request.temperature,
                max_tokens: request.max_tokens,
            });
        let next = self
            .replies
            .lock()
            .map_err(|_| anyhow!("scripted provider lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(content)) => Ok(ProviderResponse {
                content,
                prompt_tokens: Some(1),
                completion_tokens: Some(1),
                latency_ms: 5,
            }),
            Some(Err(message)) => bail!("{message}"),
            None => bail!("scripted provider '{}' has no replies left", self.name),
        }
    }
}
