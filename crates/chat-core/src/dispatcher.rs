//! Streaming Completion Dispatcher
//!
//! Runs one completion per invocation on its own task and republishes the
//! demultiplexed output through callbacks and an event channel.
//!
//! ```rust,ignore
//! let dispatcher = Dispatcher::with_defaults(provider);
//! let invocation = dispatcher.invoke(history, &functions, ProviderOptions::default())?;
//!
//! invocation
//!     .on_text(|text, done| render(text, done))
//!     .on_function_call("placeTrade", |call| show_ticket(call));
//!
//! let outcome = invocation.wait().await;
//! ```

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::demux::{Classification, ClassificationPolicy, Demultiplexer, DispatchEvent};
use crate::error::{ChatError, DispatchError, Result};
use crate::function::{FunctionCallPayload, FunctionRegistry};
use crate::message::Message;
use crate::provider::{CompletionProvider, CompletionRequest, FinishReason, ProviderEvent, ProviderOptions, ProviderStream};
use crate::subscription::Subscribers;

/// Dispatcher configuration
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// How untyped tokens are classified
    pub classification: ClassificationPolicy,

    /// Longest gap between chunks before the stream counts as interrupted
    pub idle_timeout: Option<Duration>,

    /// Extra attempts at opening the stream on retryable errors
    pub max_retries: u32,

    /// Delay before the first retry; doubles on each further attempt
    pub retry_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            classification: ClassificationPolicy::default(),
            idle_timeout: Some(Duration::from_secs(60)),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl DispatcherConfig {
    /// Read `CHAT_CLASSIFICATION`, `CHAT_IDLE_TIMEOUT_SECS` (0 disables),
    /// `CHAT_MAX_RETRIES` and `CHAT_RETRY_BACKOFF_MS`, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(policy) = std::env::var("CHAT_CLASSIFICATION") {
            config.classification = policy.parse()?;
        }
        if let Some(secs) = env_number("CHAT_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(retries) = env_number("CHAT_MAX_RETRIES")? {
            config.max_retries = u32::try_from(retries)
                .map_err(|_| ChatError::Config("CHAT_MAX_RETRIES is too large".into()))?;
        }
        if let Some(ms) = env_number("CHAT_RETRY_BACKOFF_MS")? {
            config.retry_backoff = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn env_number(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ChatError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

/// Summary of a finished invocation
#[derive(Clone, Debug)]
pub struct InvocationOutcome {
    pub id: Uuid,

    /// Terminal classification (`Undetermined` only if cancelled or aborted early)
    pub classification: Classification,

    /// Everything received as content
    pub text: String,

    pub function_call: Option<FunctionCallPayload>,

    /// Errors in delivery order
    pub errors: Vec<DispatchError>,

    pub finish_reason: Option<FinishReason>,

    pub cancelled: bool,
}

impl InvocationOutcome {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            classification: Classification::Undetermined,
            text: String::new(),
            function_call: None,
            errors: Vec::new(),
            finish_reason: None,
            cancelled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }

    /// The first error, if any occurred
    pub fn into_result(self) -> std::result::Result<Self, DispatchError> {
        match self.errors.first() {
            Some(err) => Err(err.clone()),
            None => Ok(self),
        }
    }
}

/// Handle to a running invocation.
///
/// Every event is also queued for `next_event`. Callers that only use
/// callbacks should finish with `wait` (or drop the handle), which releases
/// that queue.
pub struct Invocation {
    id: Uuid,
    subscribers: Arc<Subscribers>,
    events: mpsc::UnboundedReceiver<DispatchEvent>,
    cancel: CancellationToken,
    task: JoinHandle<InvocationOutcome>,
}

impl Invocation {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Register the text handler. Text published before this call is not replayed.
    pub fn on_text<F>(&self, handler: F) -> &Self
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.subscribers.set_text(Arc::new(handler));
        self
    }

    /// Register a handler for calls to `name`
    pub fn on_function_call<F>(&self, name: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(FunctionCallPayload) + Send + Sync + 'static,
    {
        self.subscribers.set_function(name.into(), Arc::new(handler));
        self
    }

    pub fn on_error<F>(&self, handler: F) -> &Self
    where
        F: Fn(&DispatchError) + Send + Sync + 'static,
    {
        self.subscribers.set_error(Arc::new(handler));
        self
    }

    /// Next buffered event. Unlike callbacks, the channel holds every event
    /// since the invocation started.
    pub async fn next_event(&mut self) -> Option<DispatchEvent> {
        self.events.recv().await
    }

    /// Stop consuming tokens and delivering events
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Consume the handle as an event stream; the task keeps running
    pub fn into_stream(self) -> UnboundedReceiverStream<DispatchEvent> {
        UnboundedReceiverStream::new(self.events)
    }

    /// Wait for the stream to drain and return the outcome. Queued events
    /// are discarded and no further events are queued.
    pub async fn wait(self) -> InvocationOutcome {
        drop(self.events);
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(invocation = %self.id, error = %err, "dispatcher task failed");
                let mut outcome = InvocationOutcome::new(self.id);
                outcome
                    .errors
                    .push(DispatchError::StreamInterrupted(format!("dispatcher task failed: {}", err)));
                outcome
            }
        }
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.id)
            .field("subscribers", &self.subscribers)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Entry point: one `invoke` per user turn
pub struct Dispatcher {
    provider: Arc<dyn CompletionProvider>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: DispatcherConfig) -> Self {
        Self { provider, config }
    }

    /// Create with default configuration
    pub fn with_defaults(provider: Arc<dyn CompletionProvider>) -> Self {
        Self::new(provider, DispatcherConfig::default())
    }

    pub fn provider(&self) -> &Arc<dyn CompletionProvider> {
        &self.provider
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Start an invocation and return immediately.
    ///
    /// Fails before any provider call if a declared function cannot be
    /// converted, or when called outside a tokio runtime.
    pub fn invoke(
        &self,
        history: Vec<Message>,
        functions: &FunctionRegistry,
        options: ProviderOptions,
    ) -> Result<Invocation> {
        self.invoke_with(history, functions, options, Subscribers::new())
    }

    /// Like `invoke`, with handlers bound before the first chunk can arrive
    pub fn invoke_with(
        &self,
        history: Vec<Message>,
        functions: &FunctionRegistry,
        mut options: ProviderOptions,
        subscribers: Subscribers,
    ) -> Result<Invocation> {
        let declarations = functions.declarations()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ChatError::Config("invoke must be called within a tokio runtime".into()))?;

        options.stream = true;
        let request = CompletionRequest {
            messages: history,
            functions: declarations,
            options,
        };

        let id = Uuid::new_v4();
        let subscribers = Arc::new(subscribers);
        let (tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tracing::info!(
            invocation = %id,
            provider = self.provider.name(),
            model = %request.options.model,
            functions = request.functions.len(),
            "invocation started"
        );

        let run = Run {
            id,
            provider: self.provider.clone(),
            config: self.config.clone(),
            demux: Demultiplexer::new(functions.clone(), self.config.classification),
            sink: EventSink {
                subscribers: subscribers.clone(),
                tx,
                outcome: InvocationOutcome::new(id),
            },
            cancel: cancel.clone(),
        };
        let task = runtime.spawn(run.execute(request));

        Ok(Invocation {
            id,
            subscribers,
            events,
            cancel,
            task,
        })
    }
}

/// Fans events out to callbacks, the channel, and the outcome record
struct EventSink {
    subscribers: Arc<Subscribers>,
    tx: mpsc::UnboundedSender<DispatchEvent>,
    outcome: InvocationOutcome,
}

impl EventSink {
    fn emit(&mut self, events: Vec<DispatchEvent>) {
        for event in events {
            match &event {
                DispatchEvent::FunctionCall(payload) => self.outcome.function_call = Some(payload.clone()),
                DispatchEvent::Error(err) => self.outcome.errors.push(err.clone()),
                DispatchEvent::Text { .. } => {}
            }
            self.subscribers.deliver(&event);
            // The receiver may be gone; callbacks still get everything
            let _ = self.tx.send(event);
        }
    }
}

enum Step {
    Event(ProviderEvent),
    Failed(ChatError),
    TimedOut(Duration),
    End,
}

struct Run {
    id: Uuid,
    provider: Arc<dyn CompletionProvider>,
    config: DispatcherConfig,
    demux: Demultiplexer,
    sink: EventSink,
    cancel: CancellationToken,
}

impl Run {
    async fn execute(mut self, request: CompletionRequest) -> InvocationOutcome {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            opened = self.open_with_retry(&request) => Some(opened),
        };

        match opened {
            None => self.sink.outcome.cancelled = true,
            Some(Err(err)) => {
                tracing::error!(invocation = %self.id, error = %err, "could not open completion stream");
                let events = self.demux.abort(DispatchError::ProviderUnavailable(err.to_string()));
                self.sink.emit(events);
            }
            Some(Ok(stream)) => self.consume(stream).await,
        }

        let mut outcome = self.sink.outcome;
        outcome.classification = self.demux.state();
        outcome.text = self.demux.text().to_string();
        outcome.finish_reason = self.demux.finish_reason().cloned();

        tracing::info!(
            invocation = %self.id,
            classification = ?outcome.classification,
            errors = outcome.errors.len(),
            cancelled = outcome.cancelled,
            "invocation finished"
        );
        outcome
    }

    async fn consume(&mut self, mut stream: ProviderStream) {
        let idle_timeout = self.config.idle_timeout;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!(invocation = %self.id, "invocation cancelled");
                    self.sink.outcome.cancelled = true;
                    break;
                }
                step = next_step(&mut stream, idle_timeout) => step,
            };

            match step {
                Step::Event(event) => {
                    let events = self.demux.push(event);
                    self.sink.emit(events);
                }
                Step::Failed(ChatError::MalformedEvent(reason)) => {
                    tracing::warn!(invocation = %self.id, %reason, "malformed provider chunk dropped");
                }
                Step::Failed(err) => {
                    tracing::warn!(invocation = %self.id, error = %err, "completion stream interrupted");
                    let events = self.demux.interrupt(err.into());
                    self.sink.emit(events);
                    break;
                }
                Step::TimedOut(limit) => {
                    tracing::warn!(invocation = %self.id, ?limit, "completion stream went idle");
                    let events = self.demux.interrupt(DispatchError::TimedOut(limit));
                    self.sink.emit(events);
                    break;
                }
                Step::End => {
                    let events = self.demux.finish();
                    self.sink.emit(events);
                    break;
                }
            }
        }
        // Dropping the stream releases the underlying connection
    }

    async fn open_with_retry(&self, request: &CompletionRequest) -> Result<ProviderStream> {
        let mut attempt: u32 = 0;
        loop {
            match self.provider.stream(request.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self
                        .config
                        .retry_backoff
                        .saturating_mul(1u32 << (attempt - 1).min(16));
                    tracing::warn!(invocation = %self.id, attempt, ?delay, error = %err, "opening stream failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn next_step(stream: &mut ProviderStream, idle_timeout: Option<Duration>) -> Step {
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Step::TimedOut(limit),
        },
        None => stream.next().await,
    };

    match next {
        Some(Ok(event)) => Step::Event(event),
        Some(Err(err)) => Step::Failed(err),
        None => Step::End,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{FunctionDefinition, ParameterSchema};
    use crate::mock::{ScriptStep, ScriptedProvider};
    use serde_json::json;
    use std::sync::Mutex;

    type TextLog = Arc<Mutex<Vec<(String, bool)>>>;
    type CallLog = Arc<Mutex<Vec<FunctionCallPayload>>>;

    fn place_trade_registry() -> FunctionRegistry {
        FunctionRegistry::new()
            .with(
                FunctionDefinition::new("placeTrade", "Buy or sell shares of a stock")
                    .param(ParameterSchema::required("ticker", "string", "Stock ticker"))
                    .param(ParameterSchema::required("quantity", "number", "Number of shares")),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_wait_releases_event_queue() {
        let id = Uuid::new_v4();
        let (tx, events) = mpsc::unbounded_channel::<DispatchEvent>();
        // Finishes only once nobody can read the queue any more
        let task = tokio::spawn(async move {
            tx.closed().await;
            InvocationOutcome::new(id)
        });
        let invocation = Invocation {
            id,
            subscribers: Arc::new(Subscribers::new()),
            events,
            cancel: CancellationToken::new(),
            task,
        };

        let outcome = tokio::time::timeout(Duration::from_secs(1), invocation.wait())
            .await
            .expect("wait kept the event queue alive");
        assert_eq!(outcome.id, id);
    }

    #[tokio::test]
    async fn test_callback_only_invocation_after_wait() {
        let dispatcher = Dispatcher::new(
            Arc::new(ScriptedProvider::new(
                std::iter::once(ScriptStep::Delay(Duration::from_millis(20)))
                    .chain((0..2000).map(|_| ScriptStep::Event(ProviderEvent::Token("tick ".into()))))
                    .collect(),
            )),
            quick_config(),
        );
        let (subscribers, texts, _) = recording_subscribers();
        let invocation = dispatcher
            .invoke_with(vec![Message::user("count")], &FunctionRegistry::new(), ProviderOptions::default(), subscribers)
            .unwrap();

        let outcome = invocation.wait().await;
        assert_eq!(outcome.text.len(), 2000 * 5);
        let texts = texts.lock().unwrap();
        assert_eq!(texts.len(), 2001);
        assert_eq!(texts.last().unwrap(), &(outcome.text.clone(), true));
    }

    fn quick_config() -> DispatcherConfig {
        DispatcherConfig {
            idle_timeout: Some(Duration::from_secs(5)),
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn recording_subscribers() -> (Subscribers, TextLog, CallLog) {
        let texts: TextLog = Arc::default();
        let calls: CallLog = Arc::default();
        let (t, c) = (texts.clone(), calls.clone());
        let subscribers = Subscribers::new()
            .text(move |text, is_final| t.lock().unwrap().push((text.to_string(), is_final)))
            .function("placeTrade", move |payload| c.lock().unwrap().push(payload));
        (subscribers, texts, calls)
    }

    fn event(e: ProviderEvent) -> ScriptStep {
        ScriptStep::Event(e)
    }

    fn token(t: &str) -> ScriptStep {
        ScriptStep::Event(ProviderEvent::Token(t.into()))
    }

    #[tokio::test]
    async fn test_trending_stocks_streams_text() {
        let provider = Arc::new(ScriptedProvider::tokens(&["Trending", " stocks:", " AAPL,", " NVDA"]));
        let dispatcher = Dispatcher::new(provider.clone(), quick_config());
        let (subscribers, texts, calls) = recording_subscribers();

        let invocation = dispatcher
            .invoke_with(
                vec![Message::user("Get trending stocks")],
                &place_trade_registry(),
                ProviderOptions::default(),
                subscribers,
            )
            .unwrap();
        let outcome = invocation.wait().await;

        let texts = texts.lock().unwrap();
        assert_eq!(texts.len(), 5);
        for pair in texts.windows(2) {
            assert!(pair[1].0.len() > pair[0].0.len() || pair[1].1);
            assert!(pair[1].0.starts_with(&pair[0].0));
        }
        assert_eq!(texts.iter().filter(|(_, done)| *done).count(), 1);
        assert_eq!(texts.last().unwrap(), &("Trending stocks: AAPL, NVDA".to_string(), true));
        assert!(calls.lock().unwrap().is_empty());

        assert!(outcome.is_success());
        assert_eq!(outcome.classification, Classification::Text);
        assert_eq!(outcome.finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_place_trade_calls_function_handler_once() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            event(ProviderEvent::FunctionCallDelta {
                name: Some("placeTrade".into()),
                arguments: "{\"ticker\":\"MSFT\",".into(),
            }),
            event(ProviderEvent::FunctionCallDelta {
                name: None,
                arguments: "\"quantity\":10}".into(),
            }),
            event(ProviderEvent::Finished {
                reason: FinishReason::FunctionCall,
                usage: None,
            }),
        ]));
        let dispatcher = Dispatcher::new(provider, quick_config());
        let (subscribers, texts, calls) = recording_subscribers();

        let outcome = dispatcher
            .invoke_with(
                vec![Message::user("Buy 10 shares of MSFT")],
                &place_trade_registry(),
                ProviderOptions::default(),
                subscribers,
            )
            .unwrap()
            .wait()
            .await;

        assert!(texts.lock().unwrap().is_empty());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].arguments,
            json!({"ticker": "MSFT", "quantity": 10}).as_object().unwrap().clone()
        );
        assert_eq!(outcome.classification, Classification::FunctionCall);
        assert_eq!(outcome.function_call.as_ref(), Some(&calls[0]));
    }

    #[tokio::test]
    async fn test_same_script_gives_same_final_text() {
        let provider = Arc::new(ScriptedProvider::tokens(&["Your ", "balance ", "is ", "fine."]));
        let dispatcher = Dispatcher::new(provider, quick_config());
        let registry = place_trade_registry();

        let mut finals = Vec::new();
        for _ in 0..2 {
            let outcome = dispatcher
                .invoke(vec![Message::user("Balance?")], &registry, ProviderOptions::default())
                .unwrap()
                .wait()
                .await;
            finals.push(outcome.text);
        }
        assert_eq!(finals[0], finals[1]);
        assert_eq!(finals[0], "Your balance is fine.");
    }

    #[tokio::test]
    async fn test_concurrent_invocations_do_not_mix() {
        let provider = Arc::new(ScriptedProvider::from_fn(|request| {
            let prompt = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            let mut steps = Vec::new();
            for word in prompt.split(' ') {
                steps.push(ScriptStep::Delay(Duration::from_millis(5)));
                steps.push(ScriptStep::Event(ProviderEvent::Token(format!("{} ", word))));
            }
            steps
        }));
        let dispatcher = Dispatcher::new(provider, quick_config());
        let registry = place_trade_registry();

        let (first_subs, first_texts, _) = recording_subscribers();
        let (second_subs, second_texts, _) = recording_subscribers();
        let first = dispatcher
            .invoke_with(vec![Message::user("alpha beta gamma")], &registry, ProviderOptions::default(), first_subs)
            .unwrap();
        let second = dispatcher
            .invoke_with(vec![Message::user("one two three")], &registry, ProviderOptions::default(), second_subs)
            .unwrap();

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a.text, "alpha beta gamma ");
        assert_eq!(b.text, "one two three ");
        assert!(first_texts.lock().unwrap().iter().all(|(t, _)| "alpha beta gamma ".starts_with(t.as_str())));
        assert!(second_texts.lock().unwrap().iter().all(|(t, _)| "one two three ".starts_with(t.as_str())));
    }

    #[tokio::test]
    async fn test_schema_error_fails_before_provider_call() {
        let provider = Arc::new(ScriptedProvider::tokens(&["never"]));
        let dispatcher = Dispatcher::new(provider.clone(), quick_config());
        let mut registry = FunctionRegistry::new();
        registry
            .declare(FunctionDefinition::new("bad", "").param(ParameterSchema::required("x", "money", "")))
            .unwrap();

        let result = dispatcher.invoke(vec![Message::user("hi")], &registry, ProviderOptions::default());
        assert!(matches!(result, Err(ChatError::SchemaConversion { .. })));

        tokio::task::yield_now().await;
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_flag_is_forced() {
        let provider = Arc::new(ScriptedProvider::tokens(&["ok"]));
        let dispatcher = Dispatcher::new(provider.clone(), quick_config());

        dispatcher
            .invoke(vec![Message::user("hi")], &place_trade_registry(), ProviderOptions::with_model("gpt-4"))
            .unwrap()
            .wait()
            .await;

        let requests = provider.requests();
        assert!(requests[0].options.stream);
        assert_eq!(requests[0].options.model, "gpt-4");
        assert_eq!(requests[0].functions[0].name, "placeTrade");
    }

    #[tokio::test]
    async fn test_late_text_handler_misses_earlier_chunks() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            token("Hello"),
            ScriptStep::Delay(Duration::from_millis(50)),
            token(" world"),
        ]));
        let dispatcher = Dispatcher::new(provider, quick_config());
        let mut invocation = dispatcher
            .invoke(vec![Message::user("hi")], &place_trade_registry(), ProviderOptions::default())
            .unwrap();

        // The first chunk has been delivered once it shows up on the channel
        let first = invocation.next_event().await.unwrap();
        assert_eq!(
            first,
            DispatchEvent::Text {
                content: "Hello".into(),
                is_final: false
            }
        );

        let texts: TextLog = Arc::default();
        let sink = texts.clone();
        invocation.on_text(move |text, done| sink.lock().unwrap().push((text.to_string(), done)));
        invocation.wait().await;

        assert_eq!(
            *texts.lock().unwrap(),
            vec![("Hello world".to_string(), false), ("Hello world".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_unregistered_function_reaches_error_handler() {
        let provider = Arc::new(ScriptedProvider::new(vec![event(ProviderEvent::FunctionCall {
            name: "withdrawAll".into(),
            arguments: json!({}),
        })]));
        let dispatcher = Dispatcher::new(provider, quick_config());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let subscribers = Subscribers::new().error(move |err| sink.lock().unwrap().push(err.clone()));

        let outcome = dispatcher
            .invoke_with(vec![Message::user("hi")], &place_trade_registry(), ProviderOptions::default(), subscribers)
            .unwrap()
            .wait()
            .await;

        assert_eq!(
            *errors.lock().unwrap(),
            vec![DispatchError::UnregisteredFunction("withdrawAll".into())]
        );
        assert!(outcome.function_call.is_none());
        assert!(outcome.into_result().is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let provider = Arc::new(ScriptedProvider::new(vec![token("Partial"), ScriptStep::Hang]));
        let dispatcher = Dispatcher::new(provider, quick_config());
        let (subscribers, texts, _) = recording_subscribers();
        let mut invocation = dispatcher
            .invoke_with(vec![Message::user("hi")], &place_trade_registry(), ProviderOptions::default(), subscribers)
            .unwrap();

        invocation.next_event().await.unwrap();
        invocation.cancel();
        let outcome = invocation.wait().await;

        assert!(outcome.cancelled);
        assert_eq!(*texts.lock().unwrap(), vec![("Partial".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_idle_timeout_finalises_partial_text() {
        let provider = Arc::new(ScriptedProvider::new(vec![token("Hello"), ScriptStep::Hang]));
        let config = DispatcherConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..quick_config()
        };
        let dispatcher = Dispatcher::new(provider, config);

        let events: Vec<DispatchEvent> = dispatcher
            .invoke(vec![Message::user("hi")], &place_trade_registry(), ProviderOptions::default())
            .unwrap()
            .into_stream()
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                DispatchEvent::Text {
                    content: "Hello".into(),
                    is_final: false
                },
                DispatchEvent::Error(DispatchError::TimedOut(Duration::from_millis(50))),
                DispatchEvent::Text {
                    content: "Hello".into(),
                    is_final: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_retries_unavailable_provider() {
        let provider = Arc::new(ScriptedProvider::tokens(&["back"]).failing_opens(2));
        let dispatcher = Dispatcher::new(provider.clone(), quick_config());

        let outcome = dispatcher
            .invoke(vec![Message::user("hi")], &place_trade_registry(), ProviderOptions::default())
            .unwrap()
            .wait()
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.text, "back");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let provider = Arc::new(ScriptedProvider::tokens(&["never"]).failing_opens(10));
        let config = DispatcherConfig {
            max_retries: 1,
            ..quick_config()
        };
        let dispatcher = Dispatcher::new(provider.clone(), config);
        let (subscribers, texts, _) = recording_subscribers();

        let outcome = dispatcher
            .invoke_with(vec![Message::user("hi")], &place_trade_registry(), ProviderOptions::default(), subscribers)
            .unwrap()
            .wait()
            .await;

        assert_eq!(provider.call_count(), 2);
        assert!(matches!(outcome.errors[..], [DispatchError::ProviderUnavailable(_)]));
        assert!(texts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_dropped() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            token("Hi"),
            ScriptStep::Malformed("data: {oops".into()),
            token(" there"),
        ]));
        let dispatcher = Dispatcher::new(provider, quick_config());

        let outcome = dispatcher
            .invoke(vec![Message::user("hi")], &place_trade_registry(), ProviderOptions::default())
            .unwrap()
            .wait()
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.text, "Hi there");
    }

    #[tokio::test]
    async fn test_stream_failure_surfaces_error_then_final_text() {
        let provider = Arc::new(ScriptedProvider::new(vec![token("Half a"), ScriptStep::Fail("reset".into())]));
        let dispatcher = Dispatcher::new(provider, quick_config());
        let (subscribers, texts, _) = recording_subscribers();

        let outcome = dispatcher
            .invoke_with(vec![Message::user("hi")], &place_trade_registry(), ProviderOptions::default(), subscribers)
            .unwrap()
            .wait()
            .await;

        assert_eq!(outcome.errors, vec![DispatchError::StreamInterrupted("reset".into())]);
        assert_eq!(texts.lock().unwrap().last().unwrap(), &("Half a".to_string(), true));
    }

    #[test]
    fn test_invoke_outside_runtime_is_an_error() {
        let provider = Arc::new(ScriptedProvider::tokens(&["x"]));
        let dispatcher = Dispatcher::with_defaults(provider);
        let result = dispatcher.invoke(vec![Message::user("hi")], &FunctionRegistry::new(), ProviderOptions::default());
        assert!(matches!(result, Err(ChatError::Config(_))));
    }
}
