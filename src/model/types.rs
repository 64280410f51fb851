//! Wire types for the model endpoint.
//!
//! Responses are decoded exactly once, here at the boundary, into
//! [`ModelResponse`]. Downstream code never sees raw JSON lines.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{DispatchError, MalformedResult};
use crate::metrics::BatchStats;
use crate::pipeline::Batch;
use crate::source::RecordId;

/// Request body: `{"comments": [{"id": ..., "body": ...}, ...]}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchPayload {
    pub comments: Vec<CommentPayload>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommentPayload {
    pub id: RecordId,
    pub body: String,
}

impl BatchPayload {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            comments: batch
                .records
                .iter()
                .map(|r| CommentPayload {
                    id: r.id.clone(),
                    body: r.body.clone(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }
}

/// Per-record enrichment returned by the model. Every field other than `id`
/// is optional; null fields are treated as absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelResult {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ModelResult {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Decode one result object. Null fields are dropped.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut object) = value else {
            return Err("result is not a JSON object".to_string());
        };
        let id = object
            .remove("id")
            .ok_or_else(|| "result has no id".to_string())?;
        let id = RecordId::from_json(&id)
            .ok_or_else(|| format!("result id must be a string or integer, got {}", id))?;
        object.retain(|_, v| !v.is_null());
        Ok(Self { id, fields: object })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn sentiment(&self) -> Option<&str> {
        self.get("sentiment").and_then(Value::as_str)
    }

    pub fn sentiment_score(&self) -> Option<f64> {
        self.get("sentiment_score").and_then(Value::as_f64)
    }

    /// Parse list fields whose elements arrive as JSON-encoded strings
    /// (`["{\"label\":\"joy\"}"]` becomes `[{"label":"joy"}]`).
    ///
    /// A field is only touched when its first element is a string that looks
    /// like a JSON object or array. If any element then fails to parse, the
    /// field is left as received and a problem is reported for it.
    pub fn normalize(&mut self) -> Vec<MalformedResult> {
        let mut problems = Vec::new();

        for (field, value) in self.fields.iter_mut() {
            let Value::Array(items) = value else {
                continue;
            };
            let Some(Value::String(first)) = items.first() else {
                continue;
            };
            if !looks_like_json(first) {
                continue;
            }

            let parsed: Result<Vec<Value>, serde_json::Error> = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => serde_json::from_str(s),
                    other => Ok(other.clone()),
                })
                .collect();

            match parsed {
                Ok(decoded) => *items = decoded,
                Err(e) => problems.push(MalformedResult::new(
                    format!("id={} field={}", self.id, field),
                    e.to_string(),
                )),
            }
        }

        problems
    }
}

fn looks_like_json(s: &str) -> bool {
    let trimmed = s.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

/// Collect the numeric members of a JSON object as metrics. A nested
/// `stats` or `metrics` object is flattened into the same map.
pub fn numeric_metrics(object: &Map<String, Value>) -> BatchStats {
    let mut stats = BatchStats::new();
    for (key, value) in object {
        match value {
            Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    stats.insert(key.clone(), v);
                }
            }
            Value::Object(nested) if key == "stats" || key == "metrics" => {
                stats.extend(numeric_metrics(nested));
            }
            _ => {}
        }
    }
    stats
}

/// One decoded line of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    /// `{"type": "result", "id": ..., ...}`
    Result(ModelResult),
    /// `{"type": "stats", ...numeric metrics...}`
    Stats(BatchStats),
    /// A well-formed line with a tag this client does not handle.
    Unknown { tag: String },
    /// A line that is not valid JSON or lacks required members.
    Malformed(MalformedResult),
}

impl StreamLine {
    /// Decode a single line. Blank lines yield `None`.
    pub fn decode(line: &str, line_number: usize) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let context = || format!("stream line {}", line_number);

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                return Some(StreamLine::Malformed(MalformedResult::new(
                    context(),
                    e.to_string(),
                )))
            }
        };
        let Value::Object(mut object) = value else {
            return Some(StreamLine::Malformed(MalformedResult::new(
                context(),
                "line is not a JSON object",
            )));
        };

        let tag = match object.remove("type") {
            Some(Value::String(tag)) => tag,
            _ => {
                return Some(StreamLine::Malformed(MalformedResult::new(
                    context(),
                    "line has no string `type` tag",
                )))
            }
        };

        Some(match tag.as_str() {
            "result" => match ModelResult::from_value(Value::Object(object)) {
                Ok(result) => StreamLine::Result(result),
                Err(reason) => StreamLine::Malformed(MalformedResult::new(context(), reason)),
            },
            "stats" => StreamLine::Stats(numeric_metrics(&object)),
            _ => StreamLine::Unknown { tag },
        })
    }
}

/// A fully decoded model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelResponse {
    /// Single JSON document: `{"results": [...], ...metrics...}`.
    Unary {
        results: Vec<ModelResult>,
        metrics: BatchStats,
        rejected: Vec<MalformedResult>,
    },
    /// Newline-delimited tagged lines, in arrival order.
    Stream(Vec<StreamLine>),
}

impl ModelResponse {
    /// Decode a unary body. A bare top-level array is accepted as the
    /// result list with no metrics.
    pub fn decode_unary(body: &[u8]) -> Result<Self, DispatchError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| DispatchError::InvalidResponse(format!("response is not JSON: {}", e)))?;

        let (entries, metrics) = match value {
            Value::Array(entries) => (entries, BatchStats::new()),
            Value::Object(mut object) => {
                let entries = match object.remove("results") {
                    Some(Value::Array(entries)) => entries,
                    Some(_) => {
                        return Err(DispatchError::InvalidResponse(
                            "`results` is not an array".to_string(),
                        ))
                    }
                    None => {
                        return Err(DispatchError::InvalidResponse(
                            "response has no `results` member".to_string(),
                        ))
                    }
                };
                (entries, numeric_metrics(&object))
            }
            _ => {
                return Err(DispatchError::InvalidResponse(
                    "response is neither an object nor an array".to_string(),
                ))
            }
        };

        let mut results = Vec::with_capacity(entries.len());
        let mut rejected = Vec::new();
        for (index, entry) in entries.into_iter().enumerate() {
            match ModelResult::from_value(entry) {
                Ok(result) => results.push(result),
                Err(reason) => {
                    rejected.push(MalformedResult::new(format!("results[{}]", index), reason))
                }
            }
        }

        Ok(ModelResponse::Unary {
            results,
            metrics,
            rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Record;
    use serde_json::json;

    #[test]
    fn test_payload_shape() {
        let batch = Batch {
            index: 0,
            records: vec![Record::new("a", "great"), Record::new(7u64, "")],
        };
        let payload = BatchPayload::from_batch(&batch);
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"comments": [{"id": "a", "body": "great"}, {"id": "7", "body": ""}]})
        );
    }

    #[test]
    fn test_result_from_value_drops_nulls() {
        let result = ModelResult::from_value(json!({
            "id": 12,
            "sentiment": "positive",
            "sentiment_score": 0.91,
            "emotion": null
        }))
        .unwrap();

        assert_eq!(result.id.as_str(), "12");
        assert_eq!(result.sentiment(), Some("positive"));
        assert_eq!(result.sentiment_score(), Some(0.91));
        assert!(result.get("emotion").is_none());
    }

    #[test]
    fn test_result_without_id_rejected() {
        assert!(ModelResult::from_value(json!({"sentiment": "neutral"})).is_err());
        assert!(ModelResult::from_value(json!("nope")).is_err());
    }

    #[test]
    fn test_normalize_parses_encoded_lists() {
        let mut result = ModelResult::new("a")
            .with_field("topics", json!(["{\"label\":\"finance\",\"score\":0.8}"]))
            .with_field("clusters", json!(["[1,2]", "[3]"]))
            .with_field("keywords", json!(["plain", "words"]));

        let problems = result.normalize();

        assert!(problems.is_empty());
        assert_eq!(
            result.get("topics"),
            Some(&json!([{"label": "finance", "score": 0.8}]))
        );
        assert_eq!(result.get("clusters"), Some(&json!([[1, 2], [3]])));
        assert_eq!(result.get("keywords"), Some(&json!(["plain", "words"])));
    }

    #[test]
    fn test_normalize_leaves_field_on_failure() {
        let raw = json!(["{\"label\":\"joy\"}", "{broken"]);
        let mut result = ModelResult::new("b").with_field("emotions", raw.clone());

        let problems = result.normalize();

        assert_eq!(problems.len(), 1);
        assert!(problems[0].context.contains("field=emotions"));
        assert_eq!(result.get("emotions"), Some(&raw));
    }

    #[test]
    fn test_decode_unary() {
        let body = br#"{"results": [{"id": "a", "sentiment": "negative"}, {"oops": 1}],
                        "peak_memory_mb": 512.5, "stats": {"data_size_mb": 0.02}, "model": "x"}"#;
        let ModelResponse::Unary {
            results,
            metrics,
            rejected,
        } = ModelResponse::decode_unary(body).unwrap()
        else {
            panic!("expected unary response");
        };

        assert_eq!(results.len(), 1);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].context, "results[1]");
        assert_eq!(metrics["peak_memory_mb"], 512.5);
        assert_eq!(metrics["data_size_mb"], 0.02);
        assert!(!metrics.contains_key("model"));
    }

    #[test]
    fn test_decode_unary_bare_array() {
        let response = ModelResponse::decode_unary(br#"[{"id": "a"}]"#).unwrap();
        assert!(matches!(response, ModelResponse::Unary { ref results, .. } if results.len() == 1));
    }

    #[test]
    fn test_decode_unary_invalid() {
        assert!(matches!(
            ModelResponse::decode_unary(b"<html>502</html>"),
            Err(DispatchError::InvalidResponse(_))
        ));
        assert!(matches!(
            ModelResponse::decode_unary(br#"{"detail": "nope"}"#),
            Err(DispatchError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_stream_line_decode() {
        assert_eq!(StreamLine::decode("   ", 1), None);

        match StreamLine::decode(r#"{"type":"result","id":"x","sentiment":"positive"}"#, 1) {
            Some(StreamLine::Result(r)) => assert_eq!(r.sentiment(), Some("positive")),
            other => panic!("unexpected {:?}", other),
        }

        match StreamLine::decode(r#"{"type":"stats","peak_memory_mb":100,"note":"x"}"#, 2) {
            Some(StreamLine::Stats(s)) => {
                assert_eq!(s.len(), 1);
                assert_eq!(s["peak_memory_mb"], 100.0);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            StreamLine::decode(r#"{"type":"heartbeat"}"#, 3),
            Some(StreamLine::Unknown {
                tag: "heartbeat".to_string()
            })
        );

        assert!(matches!(
            StreamLine::decode("{not json", 4),
            Some(StreamLine::Malformed(m)) if m.context == "stream line 4"
        ));
        assert!(matches!(
            StreamLine::decode(r#"{"id":"x"}"#, 5),
            Some(StreamLine::Malformed(_))
        ));
        assert!(matches!(
            StreamLine::decode(r#"{"type":"result"}"#, 6),
            Some(StreamLine::Malformed(_))
        ));
    }
}
