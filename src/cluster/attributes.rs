//! Job attribute values
//!
//! JSON bodies carry edit attributes as arbitrary JSON; the scheduler
//! wants attribute expressions. The tagged variant below makes the
//! classification explicit and renders each case deterministically.

use serde_json::{Map, Value};

/// A typed job attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Text, rendered quoted
    String(String),
    /// Integer literal
    Int(i64),
    /// Floating point literal; integer-valued floats render as integers
    Float(f64),
    /// Boolean literal
    Bool(bool),
    /// JSON null, rendered as the scheduler's UNDEFINED
    Null,
    /// Arrays and objects, rendered as their JSON text in string form
    Json(Value),
}

impl AttrValue {
    /// Classify a JSON value
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(s) => Self::String(s),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::Bool(b) => Self::Bool(b),
            Value::Null => Self::Null,
            other => Self::Json(other),
        }
    }

    /// Render to an attribute expression the scheduler accepts
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::String(s) => quote(s),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => {
                #[allow(clippy::cast_possible_truncation)]
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e18 {
                    format!("{}", *f as i64)
                } else {
                    format!("{f}")
                }
            }
            Self::Bool(b) => b.to_string(),
            Self::Null => "UNDEFINED".to_string(),
            Self::Json(v) => quote(&v.to_string()),
        }
    }
}

fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Render a JSON attribute map into (name, expression) pairs, sorted by
/// name so repeated edits produce identical requests
#[must_use]
pub fn render_attributes(attributes: &Map<String, Value>) -> Vec<(String, String)> {
    let mut rendered: Vec<(String, String)> = attributes
        .iter()
        .map(|(name, value)| {
            (
                name.clone(),
                AttrValue::from_json(value.clone()).render(),
            )
        })
        .collect();
    rendered.sort_by(|a, b| a.0.cmp(&b.0));
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strings_render_quoted() {
        assert_eq!(AttrValue::from_json(json!("hello")).render(), "\"hello\"");
        assert_eq!(
            AttrValue::from_json(json!("say \"hi\"")).render(),
            "\"say \\\"hi\\\"\""
        );
        assert_eq!(
            AttrValue::from_json(json!("back\\slash")).render(),
            "\"back\\\\slash\""
        );
    }

    #[test]
    fn integers_render_bare() {
        assert_eq!(AttrValue::from_json(json!(42)).render(), "42");
        assert_eq!(AttrValue::from_json(json!(-7)).render(), "-7");
    }

    #[test]
    fn integer_valued_floats_render_as_integers() {
        assert_eq!(AttrValue::from_json(json!(3.0)).render(), "3");
        assert_eq!(AttrValue::from_json(json!(-2.0)).render(), "-2");
    }

    #[test]
    fn fractional_floats_keep_their_point() {
        assert_eq!(AttrValue::from_json(json!(2.5)).render(), "2.5");
    }

    #[test]
    fn booleans_and_null() {
        assert_eq!(AttrValue::from_json(json!(true)).render(), "true");
        assert_eq!(AttrValue::from_json(json!(false)).render(), "false");
        assert_eq!(AttrValue::from_json(json!(null)).render(), "UNDEFINED");
    }

    #[test]
    fn compound_json_renders_as_quoted_text() {
        assert_eq!(
            AttrValue::from_json(json!(["a", 1])).render(),
            "\"[\\\"a\\\",1]\""
        );
        assert_eq!(
            AttrValue::from_json(json!({"k": 1})).render(),
            "\"{\\\"k\\\":1}\""
        );
    }

    #[test]
    fn attribute_maps_render_sorted() {
        let map = json!({"RequestMemory": 2048, "JobPrio": 5, "Args": "x y"});
        let Value::Object(map) = map else { unreachable!() };
        let rendered = render_attributes(&map);
        assert_eq!(
            rendered,
            vec![
                ("Args".to_string(), "\"x y\"".to_string()),
                ("JobPrio".to_string(), "5".to_string()),
                ("RequestMemory".to_string(), "2048".to_string()),
            ]
        );
    }
}
