//! Function-calling schemas and argument validation.
//!
//! The honored subset of JSON Schema: the six primitive kinds plus `enum`,
//! `required`, nested `properties` for objects and `items` for arrays.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON value kinds accepted in tool parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl JsonType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::String => value.is_string(),
            JsonType::Number => value.is_number(),
            JsonType::Integer => value.is_i64() || value.is_u64(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::Boolean => "boolean",
            JsonType::Array => "array",
            JsonType::Object => "object",
        }
    }
}

/// Schema of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: JsonType,
    #[serde(default = "no_description")]
    pub description: String,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Element schema, array kind only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
    /// Nested property schemas, object kind only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, PropertySchema>>,
    /// Required nested properties, object kind only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

fn no_description() -> String {
    "No description".to_string()
}

impl PropertySchema {
    pub fn new(kind: JsonType, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            enum_values: None,
            default: None,
            items: None,
            properties: None,
            required: None,
        }
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// The `parameters` object of a function definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParametersSchema {
    #[serde(rename = "type", default = "object_type")]
    pub kind: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

fn object_type() -> String {
    "object".to_string()
}

impl Default for ParametersSchema {
    fn default() -> Self {
        Self {
            kind: object_type(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

/// A complete function definition as sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: ParametersSchema,
}

impl FunctionSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: ParametersSchema::default(),
        }
    }

    pub fn property(
        mut self,
        name: impl Into<String>,
        schema: PropertySchema,
        required: bool,
    ) -> Self {
        let name = name.into();
        if required {
            self.parameters.required.push(name.clone());
        }
        self.parameters.properties.insert(name, schema);
        self
    }

    /// Wire form: `{"type": "function", "function": {...}}`.
    pub fn wire_value(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": self,
        })
    }
}

/// Validate parsed arguments against the schema.
///
/// Returns the violation as text so the dispatcher can fold it into a
/// tool-result message instead of aborting the turn.
pub fn validate_args(schema: &ParametersSchema, args: &Value) -> Result<(), String> {
    let Some(map) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    for required in &schema.required {
        if !map.contains_key(required) {
            return Err(format!("missing required argument: {required}"));
        }
    }

    for (name, value) in map {
        if let Some(prop) = schema.properties.get(name) {
            validate_value(name, prop, value)?;
        }
    }

    Ok(())
}

fn validate_value(path: &str, schema: &PropertySchema, value: &Value) -> Result<(), String> {
    if !schema.kind.matches(value) {
        return Err(format!(
            "argument {path} must be of type {}",
            schema.kind.name()
        ));
    }

    if let Some(allowed) = &schema.enum_values
        && !allowed.contains(value)
    {
        return Err(format!("argument {path} is not one of the allowed values"));
    }

    match schema.kind {
        JsonType::Array => {
            if let (Some(items), Some(elements)) = (&schema.items, value.as_array()) {
                for (i, element) in elements.iter().enumerate() {
                    validate_value(&format!("{path}[{i}]"), items, element)?;
                }
            }
        }
        JsonType::Object => {
            let map = value.as_object().expect("kind checked above");
            if let Some(required) = &schema.required {
                for name in required {
                    if !map.contains_key(name) {
                        return Err(format!("missing required argument: {path}.{name}"));
                    }
                }
            }
            if let Some(props) = &schema.properties {
                for (name, nested) in map {
                    if let Some(prop) = props.get(name) {
                        validate_value(&format!("{path}.{name}"), prop, nested)?;
                    }
                }
            }
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_schema() -> ParametersSchema {
        FunctionSchema::new("echo", "Echo a string")
            .property(
                "x",
                PropertySchema::new(JsonType::String, "The string"),
                true,
            )
            .parameters
    }

    #[test]
    fn missing_required_argument_is_rejected() {
        let err = validate_args(&echo_schema(), &json!({})).unwrap_err();
        assert!(err.contains("missing required argument: x"));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let err = validate_args(&echo_schema(), &json!({"x": 3})).unwrap_err();
        assert!(err.contains("must be of type string"));
    }

    #[test]
    fn valid_arguments_pass() {
        validate_args(&echo_schema(), &json!({"x": "hello"})).unwrap();
    }

    #[test]
    fn enum_membership_is_checked() {
        let schema = FunctionSchema::new("pick", "Pick a color")
            .property(
                "color",
                PropertySchema::new(JsonType::String, "Color")
                    .with_enum(vec![json!("red"), json!("blue")]),
                true,
            )
            .parameters;
        validate_args(&schema, &json!({"color": "red"})).unwrap();
        assert!(validate_args(&schema, &json!({"color": "green"})).is_err());
    }

    #[test]
    fn nested_objects_and_arrays_are_validated() {
        let mut point = PropertySchema::new(JsonType::Object, "Point");
        let mut props = BTreeMap::new();
        props.insert("x".to_string(), PropertySchema::new(JsonType::Integer, "X"));
        props.insert("y".to_string(), PropertySchema::new(JsonType::Integer, "Y"));
        point.properties = Some(props);
        point.required = Some(vec!["x".to_string(), "y".to_string()]);

        let mut list = PropertySchema::new(JsonType::Array, "Points");
        list.items = Some(Box::new(point));

        let schema = FunctionSchema::new("plot", "Plot points")
            .property("points", list, true)
            .parameters;

        validate_args(&schema, &json!({"points": [{"x": 1, "y": 2}]})).unwrap();
        let err = validate_args(&schema, &json!({"points": [{"x": 1}]})).unwrap_err();
        assert!(err.contains("points[0].y"));
        let err = validate_args(&schema, &json!({"points": [{"x": 1, "y": "two"}]})).unwrap_err();
        assert!(err.contains("must be of type integer"));
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        assert!(validate_args(&echo_schema(), &json!("x")).is_err());
    }

    #[test]
    fn wire_value_wraps_function_schema() {
        let schema = FunctionSchema::new("echo", "Echo a string");
        let wire = schema.wire_value();
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "echo");
    }
}
