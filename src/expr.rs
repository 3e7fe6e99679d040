use std::collections::HashMap;
use std::sync::Arc;

use cel_interpreter::objects::{Key, Map};
use cel_interpreter::{Context, Value};
use parking_lot::Mutex;

use crate::activity::{self, ActivityLink};

/// Root variable name bound to an audit record.
pub const AUDIT_ROOT: &str = "audit";
/// Root variable name bound to a cluster event.
pub const EVENT_ROOT: &str = "event";

/* ============================= LINK BUFFER ============================= */

/// Collects `link()` calls made during one summary evaluation.
///
/// A fresh buffer is handed to each evaluation context, so concurrent
/// evaluations of the same compiled rule never observe each other's links.
#[derive(Clone, Default)]
pub struct LinkBuffer {
    links: Arc<Mutex<Vec<ActivityLink>>>,
}

impl LinkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, marker: String, resource: serde_json::Value) {
        self.links.lock().push(ActivityLink { marker, resource });
    }

    /// Drain the captured links, leaving the buffer empty.
    pub fn take(&self) -> Vec<ActivityLink> {
        std::mem::take(&mut self.links.lock())
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }
}

/* ============================= VALUE CONVERSION ============================= */

/// Convert a JSON document into a CEL value tree.
pub fn json_to_cel(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(Arc::new(s.clone())),
        serde_json::Value::Array(items) => {
            Value::List(Arc::new(items.iter().map(json_to_cel).collect()))
        }
        serde_json::Value::Object(fields) => {
            let map: HashMap<Key, Value> = fields
                .iter()
                .map(|(k, v)| (Key::String(Arc::new(k.clone())), json_to_cel(v)))
                .collect();
            Value::Map(Map { map: Arc::new(map) })
        }
    }
}

fn key_to_string(key: &Key) -> String {
    match key {
        Key::String(s) => s.as_ref().clone(),
        Key::Int(i) => i.to_string(),
        Key::Uint(u) => u.to_string(),
        Key::Bool(b) => b.to_string(),
    }
}

/// Convert a CEL value back into JSON. Used to coerce `link()` resource
/// references into a string-keyed mapping.
pub fn cel_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::UInt(u) => serde_json::Value::from(*u),
        Value::Float(f) => {
            serde_json::Number::from_f64(*f).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null)
        }
        Value::String(s) => serde_json::Value::String(s.as_ref().clone()),
        Value::List(items) => {
            serde_json::Value::Array(items.iter().map(cel_to_json).collect())
        }
        Value::Map(map) => {
            let mut out = serde_json::Map::with_capacity(map.map.len());
            for (k, v) in map.map.iter() {
                out.insert(key_to_string(k), cel_to_json(v));
            }
            serde_json::Value::Object(out)
        }
        other => serde_json::Value::String(value_to_string(other)),
    }
}

/// Stringify a CEL value using its natural representation: `true`/`false`
/// for booleans, plain digits for numbers, JSON for composites.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.as_ref().clone(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::List(_) | Value::Map(_) => cel_to_json(value).to_string(),
        other => format!("{other:?}"),
    }
}

/* ============================= BINDINGS ============================= */

/// Variable bindings for one input record, shared by every program the
/// owning policy evaluates against that record.
///
/// CEL values are `Arc`-backed, so binding the same input into several
/// rule contexts is cheap.
#[derive(Clone)]
pub struct Bindings {
    root: &'static str,
    input: Value,
    actor: Value,
    actor_ref: Value,
}

impl Bindings {
    /// Bindings for an audit record: `audit`, `actor`, `actorRef`.
    pub fn for_audit(input: &serde_json::Value) -> Self {
        let actor_ref = activity::audit_actor_ref(input);
        Self {
            root: AUDIT_ROOT,
            input: json_to_cel(input),
            actor: Value::String(Arc::new(actor_ref.name.clone())),
            actor_ref: actor_ref_value(&actor_ref.type_, &actor_ref.name),
        }
    }

    /// Bindings for a cluster event: `event`, `actor`, `actorRef`.
    pub fn for_event(input: &serde_json::Value) -> Self {
        let actor_ref = activity::event_actor_ref(input);
        Self {
            root: EVENT_ROOT,
            input: json_to_cel(input),
            actor: Value::String(Arc::new(actor_ref.name.clone())),
            actor_ref: actor_ref_value(&actor_ref.type_, &actor_ref.name),
        }
    }

    /// Build the evaluation context for one program run: bound variables
    /// plus the `link()` builtin writing into `links`.
    pub fn evaluation_context(&self, links: &LinkBuffer) -> Context<'static> {
        let mut ctx = Context::default();
        ctx.add_variable_from_value(self.root, self.input.clone());
        ctx.add_variable_from_value("actor", self.actor.clone());
        ctx.add_variable_from_value("actorRef", self.actor_ref.clone());

        let buffer = links.clone();
        ctx.add_function("link", move |text: Arc<String>, reference: Value| {
            let resource = match &reference {
                Value::Map(_) => cel_to_json(&reference),
                _ => serde_json::Value::Object(serde_json::Map::new()),
            };
            buffer.record(text.as_ref().clone(), resource);
            Ok(Value::String(text))
        });

        ctx
    }
}

fn actor_ref_value(type_: &str, name: &str) -> Value {
    let mut map = HashMap::with_capacity(2);
    map.insert(
        Key::String(Arc::new("type".to_string())),
        Value::String(Arc::new(type_.to_string())),
    );
    map.insert(
        Key::String(Arc::new("name".to_string())),
        Value::String(Arc::new(name.to_string())),
    );
    Value::Map(Map { map: Arc::new(map) })
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use cel_interpreter::Program;
    use serde_json::json;

    #[test]
    fn test_json_to_cel_scalars() {
        assert_eq!(json_to_cel(&json!(true)), Value::Bool(true));
        assert_eq!(json_to_cel(&json!(42)), Value::Int(42));
        assert_eq!(json_to_cel(&json!(null)), Value::Null);
    }

    #[test]
    fn test_value_to_string_natural_forms() {
        assert_eq!(value_to_string(&Value::Bool(true)), "true");
        assert_eq!(value_to_string(&Value::Bool(false)), "false");
        assert_eq!(value_to_string(&Value::Int(-7)), "-7");
        assert_eq!(value_to_string(&Value::UInt(7)), "7");
        assert_eq!(value_to_string(&json_to_cel(&json!("web"))), "web");
    }

    #[test]
    fn test_value_to_string_map_is_json() {
        let v = json_to_cel(&json!({"a": 1}));
        assert_eq!(value_to_string(&v), r#"{"a":1}"#);
    }

    #[test]
    fn test_cel_json_roundtrip() {
        let doc = json!({
            "verb": "create",
            "code": 201,
            "ok": true,
            "items": ["a", "b"],
            "nested": {"name": "web-1"}
        });
        assert_eq!(cel_to_json(&json_to_cel(&doc)), doc);
    }

    #[test]
    fn test_audit_bindings_evaluate_match() {
        let audit = json!({
            "verb": "create",
            "user": {"username": "jane"},
            "objectRef": {"resource": "pods", "name": "web-1"}
        });
        let bindings = Bindings::for_audit(&audit);
        let links = LinkBuffer::new();

        let program = Program::compile("audit.verb == 'create'").expect("should compile");
        let result = program
            .execute(&bindings.evaluation_context(&links))
            .expect("should evaluate");
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn test_actor_bindings_exposed() {
        let audit = json!({
            "user": {"username": "system:serviceaccount:default:builder"}
        });
        let bindings = Bindings::for_audit(&audit);
        let links = LinkBuffer::new();

        let program = Program::compile("actorRef.type").expect("should compile");
        let result = program
            .execute(&bindings.evaluation_context(&links))
            .expect("should evaluate");
        assert_eq!(value_to_string(&result), "serviceaccount");
    }

    #[test]
    fn test_event_root_variable_name() {
        let event = json!({"reason": "Scheduled", "reportingController": "scheduler"});
        let bindings = Bindings::for_event(&event);
        let links = LinkBuffer::new();

        let program = Program::compile("event.reason == 'Scheduled'").expect("should compile");
        let result = program
            .execute(&bindings.evaluation_context(&links))
            .expect("should evaluate");
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn test_link_records_marker_and_resource() {
        let audit = json!({
            "user": {"username": "jane"},
            "objectRef": {"resource": "pods", "name": "web-1"}
        });
        let bindings = Bindings::for_audit(&audit);
        let links = LinkBuffer::new();

        let program = Program::compile("link('the pod', audit.objectRef)").expect("should compile");
        let result = program
            .execute(&bindings.evaluation_context(&links))
            .expect("should evaluate");

        // link() returns its text so the marker stays in the summary
        assert_eq!(value_to_string(&result), "the pod");

        let captured = links.take();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].marker, "the pod");
        assert_eq!(captured[0].resource["name"], "web-1");
    }

    #[test]
    fn test_link_non_map_ref_stores_empty_resource() {
        let audit = json!({"user": {"username": "jane"}});
        let bindings = Bindings::for_audit(&audit);
        let links = LinkBuffer::new();

        let program = Program::compile("link('marker', 42)").expect("should compile");
        program
            .execute(&bindings.evaluation_context(&links))
            .expect("should evaluate");

        let captured = links.take();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].marker, "marker");
        assert_eq!(captured[0].resource, json!({}));
    }

    #[test]
    fn test_link_buffer_take_resets() {
        let buffer = LinkBuffer::new();
        buffer.record("a".to_string(), json!({}));
        assert_eq!(buffer.len(), 1);
        let taken = buffer.take();
        assert_eq!(taken.len(), 1);
        assert!(buffer.is_empty());
    }
}
