//! Generation engine: one bounded, cancellable provider call plus file-block
//! extraction from the accumulated text.

pub mod parser;
pub mod provider;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::ProviderError;
use crate::store::{GeneratedFile, ProviderKey};

pub use parser::{ParseOutcome, ParseStrategy, parse_file_blocks};
pub use provider::{CompletionRequest, HttpProvider, Provider};

pub const GENERATION_SYSTEM_PROMPT: &str = "You are an expert software engineer generating a project from a request. \
Write every file as a fenced code block whose info string is `language:path`, for example ```tsx:src/App.tsx. \
Always output complete file contents, never partial snippets. Keep prose before the code brief.";

/// Existing files embedded as context are capped at this many bytes.
const MAX_CONTEXT_BYTES: usize = 200 * 1024;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub context: Vec<GeneratedFile>,
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    pub files: Vec<GeneratedFile>,
    pub warnings: Vec<String>,
    pub chunks: usize,
}

#[derive(Clone)]
pub struct GenerationEngine {
    provider: Arc<dyn Provider>,
    max_tokens: u32,
}

impl GenerationEngine {
    pub fn new(provider: Arc<dyn Provider>, max_tokens: u32) -> Self {
        Self {
            provider,
            max_tokens,
        }
    }

    /// Stream a generation, forwarding each delta to `on_chunk`, then parse
    /// the file blocks. Zero extracted files is reported as a warning.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        key: &ProviderKey,
        budget: Duration,
        cancel: &CancellationToken,
        on_chunk: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> Result<GenerationOutput, ProviderError> {
        let completion = CompletionRequest {
            model: request.model.clone(),
            system: GENERATION_SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(&request.prompt, &request.context),
            max_tokens: self.max_tokens,
        };
        let chunks = AtomicUsize::new(0);
        let counting = |delta: &str| {
            chunks.fetch_add(1, Ordering::Relaxed);
            on_chunk(delta);
        };
        let text = self.call(&completion, key, budget, cancel, &counting).await?;

        let ParseOutcome {
            files,
            warnings,
            strategy,
        } = parse_file_blocks(&text);
        for warning in &warnings {
            warn!(%warning, "File block parsing");
        }
        info!(
            files = files.len(),
            ?strategy,
            bytes = text.len(),
            "Generation finished"
        );
        Ok(GenerationOutput {
            text,
            files,
            warnings,
            chunks: chunks.load(Ordering::Relaxed),
        })
    }

    /// Single non-forwarding completion, used by the repair loop.
    pub async fn complete_once(
        &self,
        system: &str,
        prompt: String,
        model: &str,
        key: &ProviderKey,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let completion = CompletionRequest {
            model: model.to_string(),
            system: system.to_string(),
            prompt,
            max_tokens: self.max_tokens,
        };
        self.call(&completion, key, budget, cancel, &|_| {}).await
    }

    /// Races the provider call against cancellation and the wall-clock
    /// budget. Dropping the call future aborts the HTTP request.
    async fn call(
        &self,
        request: &CompletionRequest,
        key: &ProviderKey,
        budget: Duration,
        cancel: &CancellationToken,
        on_chunk: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> Result<String, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = tokio::time::timeout(budget, self.provider.complete(request, key, on_chunk)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProviderError::Timeout { secs: budget.as_secs() }),
                }
            }
        }
    }
}

pub fn build_prompt(prompt: &str, context: &[GeneratedFile]) -> String {
    if context.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::from("Existing project files:\n\n");
    let mut used = 0usize;
    let mut omitted = 0usize;
    for file in context {
        if used + file.content.len() > MAX_CONTEXT_BYTES {
            omitted += 1;
            continue;
        }
        used += file.content.len();
        out.push_str(&format!(
            "```{}:{}\n{}\n```\n\n",
            file.language,
            file.path,
            file.content.trim_end()
        ));
    }
    if omitted > 0 {
        out.push_str(&format!("({} more files omitted)\n\n", omitted));
    }
    out.push_str("Request:\n");
    out.push_str(prompt);
    out
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider shared by pipeline tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    pub struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<String, ProviderError>>>,
        pub requests: Mutex<Vec<CompletionRequest>>,
        delay: Duration,
    }

    impl ScriptedProvider {
        pub fn new(responses: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn complete(
            &self,
            request: &CompletionRequest,
            _key: &ProviderKey,
            on_chunk: &(dyn for<'s> Fn(&'s str) + Send + Sync),
        ) -> Result<String, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Malformed("script exhausted".into())));
            let text = next?;
            for line in text.split_inclusive('\n') {
                on_chunk(line);
            }
            Ok(text)
        }
    }

    pub fn test_key() -> ProviderKey {
        ProviderKey {
            id: 1,
            provider: crate::store::ProviderKind::Anthropic,
            secret: "sk-test".into(),
            position: 0,
            rate_limited_until: None,
            failure_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::testing::{ScriptedProvider, test_key};
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "Create a button component".into(),
            model: "claude-sonnet".into(),
            context: vec![],
        }
    }

    #[tokio::test]
    async fn test_generate_streams_and_parses() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(
            "Here you go.\n```tsx:src/Button.tsx\nexport const Button = () => <button />;\n```\n".into(),
        )]));
        let engine = GenerationEngine::new(provider.clone(), 4096);
        let seen = Mutex::new(String::new());
        let output = engine
            .generate(
                &request(),
                &test_key(),
                Duration::from_secs(5),
                &CancellationToken::new(),
                &|delta| seen.lock().unwrap().push_str(delta),
            )
            .await
            .unwrap();
        assert_eq!(output.files.len(), 1);
        assert_eq!(output.chunks, 4);
        assert_eq!(*seen.lock().unwrap(), output.text);
        let sent = &provider.requests.lock().unwrap()[0];
        assert_eq!(sent.system, GENERATION_SYSTEM_PROMPT);
        assert_eq!(sent.prompt, "Create a button component");
    }

    #[tokio::test]
    async fn test_zero_files_is_not_an_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok("No code today.".into())]));
        let engine = GenerationEngine::new(provider, 4096);
        let output = engine
            .generate(
                &request(),
                &test_key(),
                Duration::from_secs(5),
                &CancellationToken::new(),
                &|_| {},
            )
            .await
            .unwrap();
        assert!(output.files.is_empty());
        assert_eq!(output.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_budget_exceeded_is_timeout() {
        let provider = Arc::new(
            ScriptedProvider::new(vec![Ok("late".into())]).with_delay(Duration::from_secs(2)),
        );
        let engine = GenerationEngine::new(provider, 4096);
        let err = engine
            .generate(
                &request(),
                &test_key(),
                Duration::from_millis(20),
                &CancellationToken::new(),
                &|_| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_call() {
        let provider = Arc::new(
            ScriptedProvider::new(vec![Ok("late".into())]).with_delay(Duration::from_secs(5)),
        );
        let engine = GenerationEngine::new(provider, 4096);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = engine
            .generate(&request(), &test_key(), Duration::from_secs(10), &cancel, &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Http {
            status: 400,
            body: "bad".into(),
        })]));
        let engine = GenerationEngine::new(provider, 4096);
        let err = engine
            .generate(
                &request(),
                &test_key(),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &|_| {},
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn test_prompt_embeds_context_files() {
        let context = vec![GeneratedFile::new("src/App.tsx", "export default 1;\n", "tsx")];
        let prompt = build_prompt("Add a footer", &context);
        assert!(prompt.contains("```tsx:src/App.tsx\nexport default 1;\n```"));
        assert!(prompt.ends_with("Request:\nAdd a footer"));
    }
}
