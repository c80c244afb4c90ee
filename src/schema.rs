//! Schema descriptors for structured generation.
//!
//! A [`SchemaDescriptor`] is a structural contract: field names, required vs
//! optional, a type tag and a few scalar constraints. The generation client
//! renders it into a plain-language format instruction, validates replies
//! against it, and turns each violation into a targeted correction.
//!
//! ```
//! use novel_pipeline::schema::{FieldSpec, SchemaDescriptor};
//!
//! let schema = SchemaDescriptor::new("ChapterSummary")
//!     .field(FieldSpec::string("summary").required().describe("What happens").max_length(500))
//!     .field(FieldSpec::integer("word_count").required().range(0.0, 20_000.0));
//!
//! let violations = schema.validate(&serde_json::json!({"summary": "A storm."}));
//! assert_eq!(violations.len(), 1);
//! assert_eq!(violations[0].path, "word_count");
//! ```

use crate::error::Result;
use crate::PipelineError;
use serde_json::{json, Map, Value};
use std::fmt;

/// The type tag of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    /// Homogeneous array of the inner kind.
    Array(Box<FieldKind>),
    /// Nested object with its own fields.
    Object(SchemaDescriptor),
}

impl FieldKind {
    /// Human-readable label used in prompts and correction messages.
    pub fn label(&self) -> String {
        match self {
            FieldKind::String => "string".into(),
            FieldKind::Integer => "integer".into(),
            FieldKind::Number => "number".into(),
            FieldKind::Boolean => "boolean".into(),
            FieldKind::Array(inner) => format!("array of {}", inner.plural_label()),
            FieldKind::Object(schema) => {
                let names: Vec<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();
                if names.is_empty() {
                    "object".into()
                } else {
                    format!("object with fields {}", names.join(", "))
                }
            }
        }
    }

    fn plural_label(&self) -> String {
        match self {
            FieldKind::String => "strings".into(),
            FieldKind::Integer => "integers".into(),
            FieldKind::Number => "numbers".into(),
            FieldKind::Boolean => "booleans".into(),
            FieldKind::Array(_) => "arrays".into(),
            FieldKind::Object(_) => "objects".into(),
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array(_) => value.is_array(),
            FieldKind::Object(_) => value.is_object(),
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            FieldKind::String => json!({"type": "string"}),
            FieldKind::Integer => json!({"type": "integer"}),
            FieldKind::Number => json!({"type": "number"}),
            FieldKind::Boolean => json!({"type": "boolean"}),
            FieldKind::Array(inner) => json!({"type": "array", "items": inner.json_schema()}),
            FieldKind::Object(schema) => schema.to_json_schema(),
        }
    }
}

/// Optional scalar constraints on a field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraints {
    /// Minimum string length in characters.
    pub min_length: Option<usize>,
    /// Maximum string length in characters.
    pub max_length: Option<usize>,
    /// Inclusive numeric lower bound.
    pub minimum: Option<f64>,
    /// Inclusive numeric upper bound.
    pub maximum: Option<f64>,
    /// Minimum number of array items.
    pub min_items: Option<usize>,
    /// Maximum number of array items.
    pub max_items: Option<usize>,
}

impl Constraints {
    fn is_empty(&self) -> bool {
        *self == Constraints::default()
    }

    /// Prose explanations, one per constraint.
    fn describe(&self) -> Vec<String> {
        let mut out = Vec::new();
        match (self.min_length, self.max_length) {
            (Some(min), Some(max)) => out.push(format!("between {} and {} characters", min, max)),
            (Some(min), None) => out.push(format!("at least {} characters", min)),
            (None, Some(max)) => out.push(format!("maximum {} characters", max)),
            (None, None) => {}
        }
        match (self.minimum, self.maximum) {
            (Some(min), Some(max)) => out.push(format!("between {} and {}", min, max)),
            (Some(min), None) => out.push(format!("at least {}", min)),
            (None, Some(max)) => out.push(format!("at most {}", max)),
            (None, None) => {}
        }
        match (self.min_items, self.max_items) {
            (Some(min), Some(max)) => out.push(format!("between {} and {} items", min, max)),
            (Some(min), None) => out.push(format!("at least {} items", min)),
            (None, Some(max)) => out.push(format!("at most {} items", max)),
            (None, None) => {}
        }
        out
    }
}

/// One field of a [`SchemaDescriptor`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub description: Option<String>,
    pub constraints: Constraints,
}

impl FieldSpec {
    /// Create an optional field of the given kind.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: None,
            constraints: Constraints::default(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn array(name: impl Into<String>, items: FieldKind) -> Self {
        Self::new(name, FieldKind::Array(Box::new(items)))
    }

    pub fn object(name: impl Into<String>, schema: SchemaDescriptor) -> Self {
        Self::new(name, FieldKind::Object(schema))
    }

    /// Mark the field as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Attach a description shown to the model.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn min_length(mut self, n: usize) -> Self {
        self.constraints.min_length = Some(n);
        self
    }

    pub fn max_length(mut self, n: usize) -> Self {
        self.constraints.max_length = Some(n);
        self
    }

    /// Inclusive numeric range.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.constraints.minimum = Some(min);
        self.constraints.maximum = Some(max);
        self
    }

    pub fn items(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.constraints.min_items = min;
        self.constraints.max_items = max;
        self
    }

    fn prompt_line(&self) -> String {
        let mut line = format!("- \"{}\" ({})", self.name, self.kind.label());
        if let Some(ref d) = self.description {
            line.push_str(": ");
            line.push_str(d);
        }
        line
    }
}

/// A single schema violation: where and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    /// Dotted field path, e.g. `characters[2].name`.
    pub path: String,
    /// Human-readable reason.
    pub reason: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.reason)
        } else {
            write!(f, "field '{}': {}", self.path, self.reason)
        }
    }
}

/// Structural description of the object a stage expects from the model.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaDescriptor {
    /// Name used in logs and errors (e.g. `"ChapterOutline"`).
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl SchemaDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field (builder style).
    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    pub fn optional_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| !f.required)
    }

    /// Render the natural-language format instruction appended to the prompt.
    ///
    /// At most `max_optional` optional fields are listed; the rest are
    /// summarized by count.
    pub fn format_instruction(&self, max_optional: usize) -> String {
        let mut out = String::from(
            "Respond with a single JSON object only. The field list below describes \
             the structure to fill in. Do not repeat or echo this description or any \
             schema back; write the actual content as values.\n",
        );

        let required: Vec<&FieldSpec> = self.required_fields().collect();
        if !required.is_empty() {
            out.push_str("\nRequired fields:\n");
            for f in &required {
                out.push_str(&f.prompt_line());
                out.push('\n');
            }
        }

        let optional: Vec<&FieldSpec> = self.optional_fields().collect();
        if !optional.is_empty() {
            out.push_str("\nOptional fields:\n");
            for f in optional.iter().take(max_optional) {
                out.push_str(&f.prompt_line());
                out.push('\n');
            }
            if optional.len() > max_optional {
                out.push_str(&format!(
                    "({} more optional fields omitted)\n",
                    optional.len() - max_optional
                ));
            }
        }

        let mut constraints = Vec::new();
        self.collect_constraints("", &mut constraints);
        if !constraints.is_empty() {
            out.push_str("\nConstraints:\n");
            for c in constraints {
                out.push_str("- ");
                out.push_str(&c);
                out.push('\n');
            }
        }

        out.trim_end().to_string()
    }

    fn collect_constraints(&self, prefix: &str, out: &mut Vec<String>) {
        for f in &self.fields {
            let path = join_path(prefix, &f.name);
            if !f.constraints.is_empty() {
                for prose in f.constraints.describe() {
                    out.push(format!("field '{}': {}", path, prose));
                }
            }
            if let FieldKind::Object(ref nested) = f.kind {
                nested.collect_constraints(&path, out);
            }
        }
    }

    /// Validate a JSON value against this descriptor.
    ///
    /// Returns every violation found (empty means valid). Fields not named in
    /// the descriptor are ignored.
    pub fn validate(&self, value: &Value) -> Vec<Violation> {
        let mut violations = Vec::new();
        match value.as_object() {
            Some(obj) => self.validate_object("", obj, &mut violations),
            None => violations.push(Violation::new(
                "",
                format!("expected a JSON object, got {}", value_type(value)),
            )),
        }
        violations
    }

    fn validate_object(&self, prefix: &str, obj: &Map<String, Value>, out: &mut Vec<Violation>) {
        for field in &self.fields {
            let path = join_path(prefix, &field.name);
            match obj.get(&field.name) {
                None if field.required => {
                    out.push(Violation::new(path, "field is required but was missing"));
                }
                Some(Value::Null) if field.required => {
                    out.push(Violation::new(path, "field is required but was null"));
                }
                None | Some(Value::Null) => {}
                Some(v) => validate_value(&field.kind, &field.constraints, &path, v, out),
            }
        }
    }

    /// Export as a JSON Schema object (for backends that accept one as a format hint).
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for f in &self.fields {
            let mut prop = f.kind.json_schema();
            if let Some(obj) = prop.as_object_mut() {
                if let Some(ref d) = f.description {
                    obj.insert("description".into(), json!(d));
                }
                let c = &f.constraints;
                if let Some(n) = c.min_length {
                    obj.insert("minLength".into(), json!(n));
                }
                if let Some(n) = c.max_length {
                    obj.insert("maxLength".into(), json!(n));
                }
                if let Some(n) = c.minimum {
                    obj.insert("minimum".into(), json!(n));
                }
                if let Some(n) = c.maximum {
                    obj.insert("maximum".into(), json!(n));
                }
                if let Some(n) = c.min_items {
                    obj.insert("minItems".into(), json!(n));
                }
                if let Some(n) = c.max_items {
                    obj.insert("maxItems".into(), json!(n));
                }
            }
            if f.required {
                required.push(json!(f.name));
            }
            properties.insert(f.name.clone(), prop);
        }
        json!({
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Build a descriptor from a subset of JSON Schema.
    ///
    /// Understands `type`, `properties`, `required`, `description`, `items`,
    /// `minLength`, `maxLength`, `minimum`, `maximum`, `minItems`, `maxItems`.
    pub fn from_json_schema(name: impl Into<String>, schema: &Value) -> Result<Self> {
        let name = name.into();
        let obj = schema.as_object().ok_or_else(|| {
            PipelineError::InvalidConfig(format!("schema '{}' must be a JSON object", name))
        })?;
        let properties = obj
            .get("properties")
            .and_then(|p| p.as_object())
            .ok_or_else(|| {
                PipelineError::InvalidConfig(format!("schema '{}' has no properties", name))
            })?;
        let required: Vec<&str> = obj
            .get("required")
            .and_then(|r| r.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        let mut descriptor = SchemaDescriptor::new(name.clone());
        for (field_name, prop) in properties {
            let kind = kind_from_json_schema(&format!("{}.{}", name, field_name), prop)?;
            let mut spec = FieldSpec::new(field_name.clone(), kind);
            spec.required = required.contains(&field_name.as_str());
            spec.description = prop
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string);
            let as_usize = |key: &str| prop.get(key).and_then(|v| v.as_u64()).map(|n| n as usize);
            spec.constraints = Constraints {
                min_length: as_usize("minLength"),
                max_length: as_usize("maxLength"),
                minimum: prop.get("minimum").and_then(|v| v.as_f64()),
                maximum: prop.get("maximum").and_then(|v| v.as_f64()),
                min_items: as_usize("minItems"),
                max_items: as_usize("maxItems"),
            };
            descriptor.fields.push(spec);
        }
        Ok(descriptor)
    }
}

fn kind_from_json_schema(context: &str, prop: &Value) -> Result<FieldKind> {
    let ty = prop.get("type").and_then(|t| t.as_str()).unwrap_or("string");
    Ok(match ty {
        "string" => FieldKind::String,
        "integer" => FieldKind::Integer,
        "number" => FieldKind::Number,
        "boolean" => FieldKind::Boolean,
        "array" => {
            let items = match prop.get("items") {
                Some(items) => kind_from_json_schema(context, items)?,
                None => FieldKind::String,
            };
            FieldKind::Array(Box::new(items))
        }
        "object" => {
            if prop.get("properties").is_some() {
                FieldKind::Object(SchemaDescriptor::from_json_schema(context, prop)?)
            } else {
                FieldKind::Object(SchemaDescriptor::new(context))
            }
        }
        other => {
            return Err(PipelineError::InvalidConfig(format!(
                "unsupported type '{}' at {}",
                other, context
            )))
        }
    })
}

fn validate_value(
    kind: &FieldKind,
    constraints: &Constraints,
    path: &str,
    value: &Value,
    out: &mut Vec<Violation>,
) {
    if !kind.matches(value) {
        out.push(Violation::new(
            path,
            format!("must be {}, got {}", with_article(&kind.label()), value_type(value)),
        ));
        return;
    }

    match (kind, value) {
        (FieldKind::String, Value::String(s)) => {
            let len = s.chars().count();
            if let Some(min) = constraints.min_length {
                if len < min {
                    out.push(Violation::new(
                        path,
                        format!("must be at least {} characters (got {})", min, len),
                    ));
                }
            }
            if let Some(max) = constraints.max_length {
                if len > max {
                    out.push(Violation::new(
                        path,
                        format!("must be at most {} characters (got {})", max, len),
                    ));
                }
            }
        }
        (FieldKind::Integer | FieldKind::Number, v) => {
            if let Some(n) = v.as_f64() {
                if let Some(min) = constraints.minimum {
                    if n < min {
                        out.push(Violation::new(path, format!("must be >= {} (got {})", min, n)));
                    }
                }
                if let Some(max) = constraints.maximum {
                    if n > max {
                        out.push(Violation::new(path, format!("must be <= {} (got {})", max, n)));
                    }
                }
            }
        }
        (FieldKind::Array(inner), Value::Array(items)) => {
            if let Some(min) = constraints.min_items {
                if items.len() < min {
                    out.push(Violation::new(
                        path,
                        format!("must contain at least {} items (got {})", min, items.len()),
                    ));
                }
            }
            if let Some(max) = constraints.max_items {
                if items.len() > max {
                    out.push(Violation::new(
                        path,
                        format!("must contain at most {} items (got {})", max, items.len()),
                    ));
                }
            }
            for (i, item) in items.iter().enumerate() {
                let item_path = format!("{}[{}]", path, i);
                validate_value(inner, &Constraints::default(), &item_path, item, out);
            }
        }
        (FieldKind::Object(nested), Value::Object(obj)) => {
            nested.validate_object(path, obj, out);
        }
        _ => {}
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn with_article(label: &str) -> String {
    match label.chars().next() {
        Some('a' | 'e' | 'i' | 'o' | 'u') => format!("an {}", label),
        _ => format!("a {}", label),
    }
}

/// Short type name of a JSON value for error messages.
pub(crate) fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Build the corrective user turn sent after a failed validation.
pub fn correction_message(schema: &SchemaDescriptor, violations: &[Violation]) -> String {
    let mut msg = format!(
        "Your previous JSON response did not match the required {} structure. \
         Fix the following problems and respond with the complete corrected JSON object only:\n",
        schema.name
    );
    for v in violations {
        msg.push_str("- ");
        msg.push_str(&v.to_string());
        msg.push('\n');
    }
    msg.trim_end().to_string()
}
