// Frame parameter resolution: schema defaults, carried-over state, researcher JSON, generated properties.
// Schema problems are reported, not raised. Researcher code failures are raised.
// See DESIGN.md: Frame Parameter Resolver

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::code::{GenerateProperties, SessionView};
use crate::error::{PlayerError, ValidationIssue};
use crate::types::{FrameType, JsonMap};

/// Keys that never carry over between renders of the same visit.
pub const ALWAYS_RESET: [&str; 3] = ["generateProperties", "generatedProperties", "selectNextFrame"];

/// Declared JSON type of a frame parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => true,
        }
    }
}

/// One declared frame parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        FieldSpec {
            name: name.to_string(),
            field_type,
            default: None,
            required: false,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Parameters and data fields declared by one frame kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSchema {
    pub kind: String,
    #[serde(default)]
    pub frame_type: FrameType,
    #[serde(default)]
    pub properties: Vec<FieldSpec>,
    /// Names of the values the frame saves, beyond the common payload fields.
    #[serde(default)]
    pub data: Vec<String>,
}

impl FrameSchema {
    pub fn new(kind: &str) -> Self {
        FrameSchema {
            kind: kind.to_string(),
            frame_type: FrameType::Default,
            properties: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.properties.push(spec);
        self
    }

    pub fn frame_type(mut self, frame_type: FrameType) -> Self {
        self.frame_type = frame_type;
        self
    }

    /// Fresh default for every declared key. Each call returns independent values.
    pub fn defaults(&self) -> JsonMap {
        self.properties
            .iter()
            .map(|spec| (spec.name.clone(), spec.default.clone().unwrap_or(Value::Null)))
            .collect()
    }

    /// Type and presence checks over a merged config.
    pub fn validate(&self, config: &JsonMap) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for spec in &self.properties {
            match config.get(&spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        issues.push(ValidationIssue::new(
                            &self.kind,
                            &spec.name,
                            "required field is missing",
                        ));
                    }
                }
                Some(value) if !spec.field_type.matches(value) => {
                    issues.push(ValidationIssue::new(
                        &self.kind,
                        &spec.name,
                        format!("expected {:?}, found {}", spec.field_type, json_type_name(value)),
                    ));
                }
                Some(_) => {}
            }
        }
        issues
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The configuration a frame renders with.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resolution {
    pub config: JsonMap,
    pub generated_properties: Option<JsonMap>,
    pub issues: Vec<ValidationIssue>,
}

/// Merge, lowest priority first: schema defaults (or carried-over values on a re-render),
/// researcher JSON, generated properties.
pub fn resolve(
    schema: &FrameSchema,
    frame_config: &JsonMap,
    is_clean_visit: bool,
    previous_values: Option<&JsonMap>,
    generator: Option<(&dyn GenerateProperties, &SessionView)>,
) -> Result<Resolution, PlayerError> {
    let mut config = schema.defaults();

    if !is_clean_visit {
        if let Some(previous) = previous_values {
            for (key, value) in previous {
                if !ALWAYS_RESET.contains(&key.as_str()) {
                    config.insert(key.clone(), value.clone());
                }
            }
        }
    }

    for (key, value) in frame_config {
        config.insert(key.clone(), value.clone());
    }

    let generated_properties = match generator {
        Some((generate, view)) => {
            let generated = run_generator(&schema.kind, generate, view)?;
            for (key, value) in &generated {
                config.insert(key.clone(), value.clone());
            }
            Some(generated)
        }
        None => None,
    };

    let issues = schema.validate(&config);
    for issue in &issues {
        tracing::warn!(kind = %issue.kind, field = %issue.field, "{}", issue.message);
    }

    Ok(Resolution {
        config,
        generated_properties,
        issues,
    })
}

fn run_generator(
    kind: &str,
    generate: &dyn GenerateProperties,
    view: &SessionView,
) -> Result<JsonMap, PlayerError> {
    match generate.call(view) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => {
            tracing::error!(kind, "generateProperties returned a non-object");
            Err(PlayerError::configuration(
                kind,
                format!(
                    "generateProperties must return an object, got {}",
                    json_type_name(&other)
                ),
            ))
        }
        Err(message) => {
            tracing::error!(kind, error = %message, "generateProperties threw");
            Err(PlayerError::configuration(
                kind,
                format!("generateProperties threw: {}", message),
            ))
        }
    }
}
