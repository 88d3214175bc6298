//! Stream Demultiplexer
//!
//! Synchronous state machine that turns provider events into dispatch events.
//! One instance serves exactly one invocation.
//!
//! ```text
//!                 ┌──── non-brace content ────▶ Text
//!  Undetermined ──┤
//!                 └──── structured call ──────▶ FunctionCall
//! ```
//!
//! Both transitions are irreversible. Content whose first character is `{`
//! keeps the invocation undetermined (nothing is published) until either a
//! structured call arrives or the stream ends. This leading-brace rule is a
//! heuristic: prose that legitimately starts with `{` is misread unless the
//! provider tags it as [`ProviderEvent::Text`].

use serde::Deserialize;
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::error::{ChatError, DispatchError};
use crate::function::{FunctionCallPayload, FunctionRegistry};
use crate::provider::{FinishReason, ProviderEvent};

/// How untyped tokens are classified before the invocation is committed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClassificationPolicy {
    /// Commit on the first chunk: text starting with `{` is suppressed,
    /// anything else (including leading whitespace) is published at once.
    Eager,

    /// Hold back whitespace-only content and decide on the first
    /// non-whitespace character.
    #[default]
    Lookahead,
}

impl FromStr for ClassificationPolicy {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(ClassificationPolicy::Eager),
            "lookahead" => Ok(ClassificationPolicy::Lookahead),
            other => Err(ChatError::Config(format!("unknown classification policy '{}'", other))),
        }
    }
}

/// Classification state of one invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Undetermined,
    Text,
    FunctionCall,
}

/// Output of an invocation, in delivery order
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchEvent {
    /// The full accumulated text so far
    Text { content: String, is_final: bool },

    /// The single function call of this invocation
    FunctionCall(FunctionCallPayload),

    Error(DispatchError),
}

#[derive(Debug, Default)]
struct PendingCall {
    name: String,
    arguments: String,
}

/// Raw JSON call embedded in content, e.g. from providers without native
/// function calling.
#[derive(Deserialize)]
struct InlineCall {
    #[serde(alias = "tool")]
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InlineShape {
    Wrapped { function_call: InlineCall },
    Bare(InlineCall),
}

/// Per-invocation demultiplexer
#[derive(Debug)]
pub struct Demultiplexer {
    functions: FunctionRegistry,
    policy: ClassificationPolicy,
    state: Classification,
    text: String,
    pending_call: Option<PendingCall>,
    call_resolved: bool,
    finish_reason: Option<FinishReason>,
    finished: bool,
}

impl Demultiplexer {
    pub fn new(functions: FunctionRegistry, policy: ClassificationPolicy) -> Self {
        Self {
            functions,
            policy,
            state: Classification::Undetermined,
            text: String::new(),
            pending_call: None,
            call_resolved: false,
            finish_reason: None,
            finished: false,
        }
    }

    pub fn state(&self) -> Classification {
        self.state
    }

    /// Everything received as content so far
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.finish_reason.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one provider event, in arrival order
    pub fn push(&mut self, event: ProviderEvent) -> Vec<DispatchEvent> {
        if self.finished {
            tracing::trace!("event after end of invocation ignored");
            return Vec::new();
        }

        match event {
            ProviderEvent::Token(chunk) => self.push_content(&chunk, false),
            ProviderEvent::Text(chunk) => self.push_content(&chunk, true),
            ProviderEvent::FunctionCallDelta { name, arguments } => self.push_call_delta(name, arguments),
            ProviderEvent::FunctionCall { name, arguments } => self.push_call(name, arguments),
            ProviderEvent::Finished { reason, .. } => {
                self.finish_reason = Some(reason);
                Vec::new()
            }
        }
    }

    /// Close the invocation after the stream ended normally
    pub fn finish(&mut self) -> Vec<DispatchEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        match self.state {
            Classification::Text => vec![self.final_text()],
            Classification::FunctionCall => match self.pending_call.take() {
                Some(pending) if !self.call_resolved => self.resolve_pending(pending),
                _ => Vec::new(),
            },
            Classification::Undetermined if self.brace_suppressed() => {
                match parse_inline_call(&self.text) {
                    Some((name, arguments)) => self.resolve_call(name, arguments),
                    None => {
                        tracing::warn!(
                            len = self.text.len(),
                            "brace-led content never became a function call, delivering as text"
                        );
                        self.transition(Classification::Text);
                        vec![self.final_text()]
                    }
                }
            }
            Classification::Undetermined => {
                self.transition(Classification::Text);
                vec![self.final_text()]
            }
        }
    }

    /// Close the invocation after the stream broke off.
    ///
    /// The error comes first; text already published is then finalised.
    pub fn interrupt(&mut self, error: DispatchError) -> Vec<DispatchEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = vec![DispatchEvent::Error(error)];
        match self.state {
            Classification::Text => events.push(self.final_text()),
            Classification::Undetermined if !self.brace_suppressed() => {
                self.transition(Classification::Text);
                events.push(self.final_text());
            }
            _ => {}
        }
        events
    }

    /// Close the invocation before any chunk was consumed, e.g. when the
    /// stream could not be opened. Only the error is delivered.
    pub fn abort(&mut self, error: DispatchError) -> Vec<DispatchEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![DispatchEvent::Error(error)]
    }

    fn push_content(&mut self, chunk: &str, tagged_text: bool) -> Vec<DispatchEvent> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.text.push_str(chunk);

        match self.state {
            Classification::FunctionCall => {
                tracing::trace!(len = chunk.len(), "content after function call not published");
                Vec::new()
            }
            Classification::Text => vec![self.partial_text()],
            Classification::Undetermined => {
                if tagged_text || self.reads_as_prose() {
                    self.transition(Classification::Text);
                    vec![self.partial_text()]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn push_call_delta(&mut self, name: Option<String>, arguments: String) -> Vec<DispatchEvent> {
        if self.state == Classification::Text {
            tracing::warn!("function call fragment after text was published, dropped");
            return Vec::new();
        }
        if self.call_resolved {
            tracing::warn!("function call fragment after the call resolved, dropped");
            return Vec::new();
        }

        self.transition(Classification::FunctionCall);
        let pending = self.pending_call.get_or_insert_with(PendingCall::default);
        if let Some(name) = name {
            pending.name.push_str(&name);
        }
        pending.arguments.push_str(&arguments);
        Vec::new()
    }

    fn push_call(&mut self, name: String, arguments: Value) -> Vec<DispatchEvent> {
        if self.state == Classification::Text {
            tracing::warn!(function = %name, "function call after text was published, dropped");
            return Vec::new();
        }
        if self.call_resolved {
            tracing::warn!(function = %name, "second function call in one invocation, dropped");
            return Vec::new();
        }

        self.pending_call = None;
        self.resolve_call(name, arguments)
    }

    fn resolve_pending(&mut self, pending: PendingCall) -> Vec<DispatchEvent> {
        if pending.name.is_empty() {
            self.call_resolved = true;
            return vec![DispatchEvent::Error(DispatchError::MalformedEvent(
                "function call without a name".into(),
            ))];
        }

        let arguments = if pending.arguments.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            Value::String(pending.arguments)
        };
        self.resolve_call(pending.name, arguments)
    }

    fn resolve_call(&mut self, name: String, arguments: Value) -> Vec<DispatchEvent> {
        self.transition(Classification::FunctionCall);
        self.call_resolved = true;

        let arguments = match arguments_object(&name, arguments) {
            Ok(arguments) => arguments,
            Err(err) => {
                tracing::warn!(function = %name, error = %err, "undecodable function call arguments");
                return vec![DispatchEvent::Error(err)];
            }
        };

        let Some(definition) = self.functions.get(&name) else {
            tracing::warn!(function = %name, "model called an unregistered function");
            return vec![DispatchEvent::Error(DispatchError::UnregisteredFunction(name))];
        };

        if let Err(reason) = definition.validate_arguments(&arguments) {
            tracing::warn!(function = %name, %reason, "function call arguments rejected");
            return vec![DispatchEvent::Error(DispatchError::InvalidArguments { name, reason })];
        }

        tracing::debug!(function = %name, "function call resolved");
        vec![DispatchEvent::FunctionCall(FunctionCallPayload::new(name, arguments))]
    }

    fn reads_as_prose(&self) -> bool {
        match self.policy {
            ClassificationPolicy::Eager => !self.text.starts_with('{'),
            ClassificationPolicy::Lookahead => {
                self.text.trim_start().chars().next().is_some_and(|c| c != '{')
            }
        }
    }

    fn brace_suppressed(&self) -> bool {
        match self.policy {
            ClassificationPolicy::Eager => self.text.starts_with('{'),
            ClassificationPolicy::Lookahead => self.text.trim_start().starts_with('{'),
        }
    }

    fn transition(&mut self, to: Classification) {
        if self.state == Classification::Undetermined && to != Classification::Undetermined {
            tracing::debug!(?to, "invocation classified");
            self.state = to;
        }
    }

    fn partial_text(&self) -> DispatchEvent {
        DispatchEvent::Text {
            content: self.text.clone(),
            is_final: false,
        }
    }

    fn final_text(&self) -> DispatchEvent {
        DispatchEvent::Text {
            content: self.text.clone(),
            is_final: true,
        }
    }
}

fn arguments_object(name: &str, arguments: Value) -> Result<Map<String, Value>, DispatchError> {
    match arguments {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(DispatchError::MalformedEvent(format!(
                "arguments for '{}' are not an object: {}",
                name, other
            ))),
            Err(e) => Err(DispatchError::MalformedEvent(format!(
                "arguments for '{}' are not valid JSON: {}",
                name, e
            ))),
        },
        other => Err(DispatchError::MalformedEvent(format!(
            "arguments for '{}' are not an object: {}",
            name, other
        ))),
    }
}

fn parse_inline_call(text: &str) -> Option<(String, Value)> {
    match serde_json::from_str::<InlineShape>(text.trim()).ok()? {
        InlineShape::Wrapped { function_call } => Some((function_call.name, function_call.arguments)),
        InlineShape::Bare(call) => Some((call.name, call.arguments)),
    }
}
