//! Structured-output schema engine.
//!
//! A system prompt in the "Structured Output" category may carry a
//! declarative field-tree. [`build_schema`] turns that tree into a runtime
//! validator, [`validate`] reports (but never rejects) discrepancies in a
//! generated object, and [`format_output`] renders the final JSON text.
//!
//! Lenient by design: validation results are logged by callers, unknown
//! field types degrade to string, and object/array nodes without children
//! accept any object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Category string that (together with a present field-tree) triggers
/// constrained generation.
pub const STRUCTURED_OUTPUT_CATEGORY: &str = "Structured Output";

// ── Field tree ────────────────────────────────────────────────────────────────

/// One node of the declarative field-tree, as authored in the prompt surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub children: Option<Vec<FieldSpec>>,
    #[serde(rename = "arrayItemType", default)]
    pub array_item_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    /// Unknown type strings default to string validation and are logged.
    pub fn parse(s: &str) -> FieldType {
        match s {
            "string" => FieldType::String,
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            "object" => FieldType::Object,
            "array" => FieldType::Array,
            other => {
                warn!(field_type = %other, "unknown field type; defaulting to string");
                FieldType::String
            }
        }
    }
}

// ── Validator ─────────────────────────────────────────────────────────────────

/// Runtime validator built from a field-tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    String,
    Number,
    Boolean,
    /// `object`/`array`-of-`object` without a nested field-tree.
    AnyObject,
    Object(Vec<SchemaField>),
    Array(Box<SchemaNode>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub required: bool,
    pub node: SchemaNode,
}

/// Build the validator for a field-tree. The tree describes an object's
/// top-level fields, so the result is always an `Object` node.
pub fn build_schema(fields: &[FieldSpec]) -> SchemaNode {
    SchemaNode::Object(fields.iter().map(build_field).collect())
}

fn build_field(spec: &FieldSpec) -> SchemaField {
    let node = match FieldType::parse(&spec.field_type) {
        FieldType::String => SchemaNode::String,
        FieldType::Number => SchemaNode::Number,
        FieldType::Boolean => SchemaNode::Boolean,
        FieldType::Object => match &spec.children {
            Some(children) if !children.is_empty() => {
                SchemaNode::Object(children.iter().map(build_field).collect())
            }
            _ => SchemaNode::AnyObject,
        },
        FieldType::Array => {
            let item = match spec.array_item_type.as_deref() {
                Some("object") => match &spec.children {
                    Some(children) if !children.is_empty() => {
                        SchemaNode::Object(children.iter().map(build_field).collect())
                    }
                    _ => SchemaNode::AnyObject,
                },
                Some(other) => match FieldType::parse(other) {
                    FieldType::String => SchemaNode::String,
                    FieldType::Number => SchemaNode::Number,
                    FieldType::Boolean => SchemaNode::Boolean,
                    FieldType::Object | FieldType::Array => SchemaNode::AnyObject,
                },
                None => SchemaNode::String,
            };
            SchemaNode::Array(Box::new(item))
        }
    };
    SchemaField { name: spec.name.clone(), required: spec.required, node }
}

impl SchemaNode {
    /// Loose type check — used by tests and diagnostics, never to reject.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            SchemaNode::String => value.is_string(),
            SchemaNode::Number => value.is_number(),
            SchemaNode::Boolean => value.is_boolean(),
            SchemaNode::AnyObject => value.is_object(),
            SchemaNode::Object(fields) => match value.as_object() {
                Some(map) => fields
                    .iter()
                    .filter(|f| f.required)
                    .all(|f| map.get(&f.name).is_some_and(|v| f.node.matches(v))),
                None => false,
            },
            SchemaNode::Array(item) => match value.as_array() {
                Some(items) => items.iter().all(|v| item.matches(v)),
                None => false,
            },
        }
    }
}

// ── Informational validation ──────────────────────────────────────────────────

/// Discrepancies between a generated object and the field-tree. Purely
/// informational — callers log, they do not reject.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub missing_required_fields: Vec<String>,
    pub unexpected_fields: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.missing_required_fields.is_empty() && self.unexpected_fields.is_empty()
    }
}

/// Compare `value` against the field-tree. Nested discrepancies are
/// reported with dotted paths (`parent.child`).
pub fn validate(value: &Value, fields: &[FieldSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_level(value, fields, "", &mut report);
    report
}

fn validate_level(value: &Value, fields: &[FieldSpec], prefix: &str, report: &mut ValidationReport) {
    let Some(map) = value.as_object() else {
        return;
    };

    for spec in fields {
        let path = join_path(prefix, &spec.name);
        match map.get(&spec.name) {
            None => {
                if spec.required {
                    report.missing_required_fields.push(path);
                }
            }
            Some(child) => {
                if let Some(children) = &spec.children {
                    if FieldType::parse(&spec.field_type) == FieldType::Object {
                        validate_level(child, children, &path, report);
                    }
                }
            }
        }
    }

    let declared: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    for key in map.keys() {
        if !declared.contains(&key.as_str()) {
            report.unexpected_fields.push(join_path(prefix, key));
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

// ── Output formatting ─────────────────────────────────────────────────────────

/// Compact single-line JSON for simple objects (≤3 top-level fields, none
/// nested), pretty-printed otherwise. Cosmetic heuristic: terse simple
/// answers, readable complex ones.
pub fn format_output(value: &Value) -> String {
    let simple = match value.as_object() {
        Some(map) => {
            map.len() <= 3 && map.values().all(|v| !v.is_object() && !v.is_array())
        }
        None => !value.is_array(),
    };
    if simple {
        serde_json::to_string(value).unwrap_or_default()
    } else {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }
}

// ── Provider-facing schema builders ───────────────────────────────────────────

/// Render the field-tree as a response schema in the OpenAPI subset the
/// cloud-multimodal backend accepts (`STRING`/`NUMBER`/… type tags).
pub fn response_schema(fields: &[FieldSpec]) -> Value {
    object_schema(fields)
}

fn object_schema(fields: &[FieldSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for spec in fields {
        properties.insert(spec.name.clone(), field_schema(spec));
        if spec.required {
            required.push(Value::String(spec.name.clone()));
        }
    }
    let mut out = Map::new();
    out.insert("type".into(), Value::String("OBJECT".into()));
    out.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        out.insert("required".into(), Value::Array(required));
    }
    Value::Object(out)
}

fn field_schema(spec: &FieldSpec) -> Value {
    let mut out = match FieldType::parse(&spec.field_type) {
        FieldType::String => serde_json::json!({ "type": "STRING" }),
        FieldType::Number => serde_json::json!({ "type": "NUMBER" }),
        FieldType::Boolean => serde_json::json!({ "type": "BOOLEAN" }),
        FieldType::Object => match &spec.children {
            Some(children) if !children.is_empty() => object_schema(children),
            _ => serde_json::json!({ "type": "OBJECT" }),
        },
        FieldType::Array => {
            let items = match spec.array_item_type.as_deref() {
                Some("object") => match &spec.children {
                    Some(children) if !children.is_empty() => object_schema(children),
                    _ => serde_json::json!({ "type": "OBJECT" }),
                },
                Some("number") => serde_json::json!({ "type": "NUMBER" }),
                Some("boolean") => serde_json::json!({ "type": "BOOLEAN" }),
                _ => serde_json::json!({ "type": "STRING" }),
            };
            serde_json::json!({ "type": "ARRAY", "items": items })
        }
    };
    if let (Some(desc), Some(map)) = (&spec.description, out.as_object_mut()) {
        map.insert("description".into(), Value::String(desc.clone()));
    }
    out
}

/// Plain-text instruction for backends without a schema slot: the provider
/// is told to answer with JSON matching the tree.
pub fn schema_instruction(fields: &[FieldSpec]) -> String {
    let shape = serde_json::to_string_pretty(&fields_outline(fields)).unwrap_or_default();
    format!(
        "Respond ONLY with a JSON object matching this structure (no prose, no code fences):\n{shape}"
    )
}

fn fields_outline(fields: &[FieldSpec]) -> Value {
    let mut map = Map::new();
    for spec in fields {
        let describe = |t: &str| {
            let mut s = String::from(t);
            if spec.required {
                s.push_str(", required");
            }
            if let Some(d) = &spec.description {
                s.push_str(": ");
                s.push_str(d);
            }
            Value::String(s)
        };
        let v = match FieldType::parse(&spec.field_type) {
            FieldType::Object => match &spec.children {
                Some(children) if !children.is_empty() => fields_outline(children),
                _ => describe("object"),
            },
            FieldType::Array => match (&spec.array_item_type, &spec.children) {
                (Some(t), Some(children)) if t == "object" && !children.is_empty() => {
                    Value::Array(vec![fields_outline(children)])
                }
                (Some(t), _) => Value::Array(vec![describe(t)]),
                (None, _) => Value::Array(vec![describe("string")]),
            },
            FieldType::String => describe("string"),
            FieldType::Number => describe("number"),
            FieldType::Boolean => describe("boolean"),
        };
        map.insert(spec.name.clone(), v);
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, ty: &str, required: bool) -> FieldSpec {
        FieldSpec {
            name: name.into(),
            field_type: ty.into(),
            required,
            description: None,
            children: None,
            array_item_type: None,
        }
    }

    #[test]
    fn exact_match_reports_clean() {
        let fields = vec![field("summary", "string", true), field("score", "number", false)];
        let report = validate(&json!({"summary": "ok", "score": 3}), &fields);
        assert!(report.is_clean());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let fields = vec![field("summary", "string", true)];
        let report = validate(&json!({}), &fields);
        assert_eq!(report.missing_required_fields, vec!["summary"]);
    }

    #[test]
    fn missing_optional_field_is_not_reported() {
        let fields = vec![field("note", "string", false)];
        assert!(validate(&json!({}), &fields).is_clean());
    }

    #[test]
    fn undeclared_field_is_unexpected() {
        let fields = vec![field("summary", "string", true)];
        let report = validate(&json!({"summary": "ok", "extra": "x"}), &fields);
        assert_eq!(report.unexpected_fields, vec!["extra"]);
        assert!(report.missing_required_fields.is_empty());
    }

    #[test]
    fn nested_paths_are_dotted() {
        let mut parent = field("meta", "object", true);
        parent.children = Some(vec![field("author", "string", true)]);
        let report = validate(&json!({"meta": {"editor": "y"}}), &[parent]);
        assert_eq!(report.missing_required_fields, vec!["meta.author"]);
        assert_eq!(report.unexpected_fields, vec!["meta.editor"]);
    }

    #[test]
    fn unknown_type_defaults_to_string() {
        let schema = build_schema(&[field("x", "timestamp", true)]);
        assert!(schema.matches(&json!({"x": "2024-01-01"})));
        assert!(!schema.matches(&json!({"x": 42})));
    }

    #[test]
    fn object_without_children_accepts_any_object() {
        let schema = build_schema(&[field("blob", "object", true)]);
        assert!(schema.matches(&json!({"blob": {"anything": [1, 2]}})));
        assert!(!schema.matches(&json!({"blob": "not an object"})));
    }

    #[test]
    fn array_of_objects_with_children() {
        let mut spec = field("items", "array", true);
        spec.array_item_type = Some("object".into());
        spec.children = Some(vec![field("id", "number", true)]);
        let schema = build_schema(&[spec]);
        assert!(schema.matches(&json!({"items": [{"id": 1}, {"id": 2}]})));
        assert!(!schema.matches(&json!({"items": [{"id": "one"}]})));
    }

    #[test]
    fn format_simple_object_is_compact() {
        let out = format_output(&json!({"a": 1, "b": "two", "c": true}));
        assert!(!out.contains('\n'));
    }

    #[test]
    fn format_nested_or_wide_object_is_pretty() {
        let nested = format_output(&json!({"a": {"b": 1}}));
        assert!(nested.contains('\n'));
        let wide = format_output(&json!({"a": 1, "b": 2, "c": 3, "d": 4}));
        assert!(wide.contains('\n'));
    }

    #[test]
    fn format_is_idempotent_on_parsed_result() {
        for value in [
            json!({"a": 1, "b": "x"}),
            json!({"a": {"nested": true}, "b": [1, 2, 3]}),
        ] {
            let first = format_output(&value);
            let reparsed: Value = serde_json::from_str(&first).unwrap();
            assert_eq!(format_output(&reparsed), first);
        }
    }

    #[test]
    fn response_schema_marks_required() {
        let fields = vec![field("summary", "string", true), field("note", "string", false)];
        let schema = response_schema(&fields);
        assert_eq!(schema["type"], "OBJECT");
        assert_eq!(schema["required"], json!(["summary"]));
        assert_eq!(schema["properties"]["summary"]["type"], "STRING");
    }

    #[test]
    fn instruction_mentions_fields() {
        let text = schema_instruction(&[field("summary", "string", true)]);
        assert!(text.contains("summary"));
        assert!(text.contains("JSON"));
    }
}
