//! Function Registry
//!
//! Functions the model may call instead of answering in prose. Each
//! definition is declared once, converted to a provider-neutral JSON schema
//! for every request, and used to check the arguments of incoming calls.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::error::{ChatError, Result};

/// JSON Schema types a parameter may declare
pub const SUPPORTED_TYPES: &[&str] = &["string", "number", "integer", "boolean", "object", "array"];

/// Longest function name providers accept
const MAX_NAME_LEN: usize = 64;

/// Parameter definition for a function schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// JSON Schema type (string, number, integer, boolean, object, array)
    #[serde(rename = "type")]
    pub param_type: String,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Default value if not provided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Enum of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ParameterSchema {
    pub fn required(
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            required: true,
            default: None,
            enum_values: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    fn to_property(&self, function: &str) -> Result<Value> {
        if !SUPPORTED_TYPES.contains(&self.param_type.as_str()) {
            return Err(schema_error(
                function,
                format!("parameter '{}' has unsupported type '{}'", self.name, self.param_type),
            ));
        }

        let mut property = Map::new();
        property.insert("type".into(), json!(self.param_type));
        if !self.description.is_empty() {
            property.insert("description".into(), json!(self.description));
        }

        if let Some(values) = &self.enum_values {
            if values.is_empty() {
                return Err(schema_error(
                    function,
                    format!("parameter '{}' declares an empty enum", self.name),
                ));
            }
            if let Some(bad) = values.iter().find(|v| !value_matches(&self.param_type, v)) {
                return Err(schema_error(
                    function,
                    format!("enum value {} of '{}' is not a {}", bad, self.name, self.param_type),
                ));
            }
            property.insert("enum".into(), Value::Array(values.clone()));
        }

        if let Some(default) = &self.default {
            if !value_matches(&self.param_type, default) {
                return Err(schema_error(
                    function,
                    format!("default {} of '{}' is not a {}", default, self.name, self.param_type),
                ));
            }
            property.insert("default".into(), default.clone());
        }

        Ok(Value::Object(property))
    }
}

/// A function the model may invoke
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Unique, case-sensitive identifier
    pub name: String,

    /// Human-readable description (shown to the model)
    pub description: String,

    /// Parameter definitions
    #[serde(default)]
    pub parameters: Vec<ParameterSchema>,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Add a parameter
    pub fn param(mut self, parameter: ParameterSchema) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Convert to the provider-neutral declaration.
    ///
    /// Fails with `ChatError::SchemaConversion` when the definition cannot be
    /// expressed as a JSON schema object.
    pub fn to_declaration(&self) -> Result<FunctionDeclaration> {
        validate_name(&self.name)?;

        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            if param.name.is_empty() {
                return Err(schema_error(&self.name, "parameter with an empty name"));
            }
            if properties.contains_key(&param.name) {
                return Err(schema_error(
                    &self.name,
                    format!("parameter '{}' declared twice", param.name),
                ));
            }
            properties.insert(param.name.clone(), param.to_property(&self.name)?);
            if param.required {
                required.push(json!(param.name));
            }
        }

        Ok(FunctionDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        })
    }

    /// Check call arguments against the declared parameters
    pub fn validate_arguments(&self, arguments: &Map<String, Value>) -> std::result::Result<(), String> {
        for param in &self.parameters {
            match arguments.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(format!("missing required parameter '{}'", param.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    if !value_matches(&param.param_type, value) {
                        return Err(format!(
                            "parameter '{}' expected {}, got {}",
                            param.name, param.param_type, value
                        ));
                    }
                    if let Some(allowed) = &param.enum_values {
                        if !allowed.contains(value) {
                            return Err(format!("parameter '{}' does not allow {}", param.name, value));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Function description in the shape completion providers expect
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema object describing the arguments
    pub parameters: Value,
}

/// Ordered set of declared functions with unique names
#[derive(Clone, Debug, Default)]
pub struct FunctionRegistry {
    functions: Vec<Arc<FunctionDefinition>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a new function
    pub fn declare(&mut self, definition: FunctionDefinition) -> Result<()> {
        if self.contains(&definition.name) {
            return Err(ChatError::DuplicateFunction(definition.name));
        }
        self.functions.push(Arc::new(definition));
        Ok(())
    }

    /// Builder-style `declare`
    pub fn with(mut self, definition: FunctionDefinition) -> Result<Self> {
        self.declare(definition)?;
        Ok(self)
    }

    /// Get a definition by exact name
    pub fn get(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.iter().find(|f| f.name == name).map(|f| f.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Declared names, in declaration order
    pub fn names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Convert every definition; the first failure aborts
    pub fn declarations(&self) -> Result<Vec<FunctionDeclaration>> {
        self.functions.iter().map(|f| f.to_declaration()).collect()
    }
}

/// A resolved function call produced by one invocation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallPayload {
    /// Declared function name
    pub name: String,

    /// Arguments keyed by parameter name
    pub arguments: Map<String, Value>,
}

impl FunctionCallPayload {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Deserialize the arguments into a typed struct
    pub fn parse_arguments<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.arguments.clone()))?)
    }
}

/// System prompt section for providers without native function calling.
///
/// The model is asked to answer with a bare JSON object, which the
/// dispatcher recognises by its leading brace.
pub fn describe_functions(declarations: &[FunctionDeclaration]) -> String {
    let mut prompt = String::from("## Available Functions\n\n");
    prompt.push_str("To call a function, respond with ONLY a JSON object and no other text:\n\n");
    prompt.push_str("{\"name\": \"function_name\", \"arguments\": {\"arg\": \"value\"}}\n\n");

    for declaration in declarations {
        prompt.push_str(&format!("### {}\n", declaration.name));
        prompt.push_str(&format!("{}\n", declaration.description));
        prompt.push_str(&format!("Parameters schema: {}\n\n", declaration.parameters));
    }

    prompt
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(schema_error(name, format!("name must be 1-{} characters", MAX_NAME_LEN)));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(schema_error(name, "name may only contain [A-Za-z0-9_-]"));
    }
    Ok(())
}

fn value_matches(param_type: &str, value: &Value) -> bool {
    match param_type {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => false,
    }
}

fn schema_error(function: &str, reason: impl Into<String>) -> ChatError {
    ChatError::SchemaConversion {
        function: function.to_string(),
        reason: reason.into(),
    }
}
