//! Scripted Completion Provider
//!
//! For testing and offline demos. Replays a fixed (or request-derived)
//! sequence of provider events, optionally with delays and failed opens.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::error::{ChatError, Result};
use crate::provider::{
    CompletionProvider, CompletionRequest, FinishReason, ModelInfo, ProviderEvent, ProviderStream,
};

/// One step of a script
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Yield an event
    Event(ProviderEvent),

    /// Sleep before the next step
    Delay(Duration),

    /// Yield a malformed-chunk error
    Malformed(String),

    /// Yield a stream failure
    Fail(String),

    /// Never produce anything again
    Hang,
}

type Responder = Box<dyn Fn(&CompletionRequest) -> Vec<ScriptStep> + Send + Sync>;

/// Provider that plays back scripts instead of calling a model
pub struct ScriptedProvider {
    responder: Responder,
    failing_opens: AtomicU32,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    /// Replay the same steps for every request
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::from_fn(move |_| steps.clone())
    }

    /// Untyped tokens followed by a `stop` finish
    pub fn tokens(parts: &[&str]) -> Self {
        let mut steps: Vec<ScriptStep> = parts
            .iter()
            .map(|p| ScriptStep::Event(ProviderEvent::Token(p.to_string())))
            .collect();
        steps.push(ScriptStep::Event(ProviderEvent::Finished {
            reason: FinishReason::Stop,
            usage: None,
        }));
        Self::new(steps)
    }

    /// Derive the script from each request
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Vec<ScriptStep> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            failing_opens: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `count` opens with `ProviderUnavailable`
    pub fn failing_opens(self, count: u32) -> Self {
        self.failing_opens.store(count, Ordering::SeqCst);
        self
    }

    /// Number of `stream` calls so far, failed ones included
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests that opened a stream successfully
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ProviderStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failing_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(ChatError::ProviderUnavailable("scripted outage".into()));
        }

        let steps = (self.responder)(&request);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let stream = futures::stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    ScriptStep::Delay(delay) => tokio::time::sleep(delay).await,
                    ScriptStep::Hang => futures::future::pending::<()>().await,
                    ScriptStep::Event(event) => return Some((Ok(event), steps)),
                    ScriptStep::Malformed(msg) => return Some((Err(ChatError::MalformedEvent(msg)), steps)),
                    ScriptStep::Fail(msg) => return Some((Err(ChatError::StreamInterrupted(msg)), steps)),
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            id: "scripted".into(),
            name: "Scripted replay".into(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderOptions;
    use futures::StreamExt;

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![crate::Message::user("hi")],
            functions: Vec::new(),
            options: ProviderOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_replays_tokens() {
        let provider = ScriptedProvider::tokens(&["a", "b"]);
        let events: Vec<_> = provider.stream(request()).await.unwrap().collect().await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].as_ref().unwrap(), &ProviderEvent::Token("a".into()));
        assert!(matches!(events[2], Ok(ProviderEvent::Finished { .. })));
    }

    #[tokio::test]
    async fn test_failing_opens() {
        let provider = ScriptedProvider::tokens(&["a"]).failing_opens(1);

        assert!(provider.stream(request()).await.is_err());
        assert!(provider.stream(request()).await.is_ok());
        assert_eq!(provider.call_count(), 2);
        assert_eq!(provider.requests().len(), 1);
    }
}
