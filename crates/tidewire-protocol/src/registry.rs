//! Content registry: maps `(category, type_id)` to a payload shape.
//!
//! A shape is a Rust type implementing `Serialize + DeserializeOwned +
//! Default`. The serialized default value acts as the field template: in
//! lenient mode it supplies the zero value of every field missing from an
//! inbound payload, in strict mode it is the exact set of fields a payload
//! must carry.
//!
//! Registration happens during setup; afterwards the registry is shared as
//! `Arc<ContentRegistry>` and only read.

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{CLOSE_CONNECTION, Category, CloseConnection, TAG_FIELD};

/// How inbound payloads are checked against their shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeMode {
    /// Missing fields take the shape's zero value, unknown fields are ignored.
    #[default]
    Lenient,
    /// Missing or unknown fields are decode errors.
    Strict,
}

#[derive(Debug, Clone)]
struct Shape {
    rust_type: TypeId,
    type_name: &'static str,
    template: Value,
}

type ShapeKey = (Category, String);

/// Registry of payload shapes.
#[derive(Debug)]
pub struct ContentRegistry {
    shapes: RwLock<HashMap<ShapeKey, Shape>>,
    mode: DecodeMode,
}

impl Default for ContentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentRegistry {
    /// Creates a lenient registry with the built-in control shapes.
    pub fn new() -> Self {
        Self::with_mode(DecodeMode::Lenient)
    }

    /// Creates a strict registry with the built-in control shapes.
    pub fn strict() -> Self {
        Self::with_mode(DecodeMode::Strict)
    }

    /// Creates a registry with the given decode mode.
    pub fn with_mode(mode: DecodeMode) -> Self {
        let registry = Self {
            shapes: RwLock::new(HashMap::new()),
            mode,
        };
        // Built-in shapes are plain types with infallible serialization.
        let _ = registry.register::<CloseConnection>(Category::Command, CLOSE_CONNECTION);
        let _ = registry.register::<()>(Category::Answer, CLOSE_CONNECTION);
        registry
    }

    /// Returns the decode mode.
    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// Registers `T` as the shape of `(category, type_id)`.
    ///
    /// Registering the same type twice is a no-op. Registering a different
    /// type under an existing key fails with [`ProtocolError::ShapeConflict`].
    pub fn register<T>(&self, category: Category, type_id: &str) -> ProtocolResult<()>
    where
        T: Serialize + DeserializeOwned + Default + 'static,
    {
        let requested = TypeId::of::<T>();
        let key = (category, type_id.to_string());

        if let Some(existing) = self.read_shapes().get(&key) {
            return if existing.rust_type == requested {
                Ok(())
            } else {
                Err(ProtocolError::ShapeConflict {
                    category,
                    type_id: type_id.to_string(),
                    existing: existing.type_name,
                    requested: type_name::<T>(),
                })
            };
        }

        let template = serde_json::to_value(T::default())?;
        let mut shapes = self.shapes.write().unwrap_or_else(PoisonError::into_inner);
        match shapes.get(&key) {
            // Lost a race against another registration of the same key.
            Some(existing) if existing.rust_type == requested => Ok(()),
            Some(existing) => Err(ProtocolError::ShapeConflict {
                category,
                type_id: type_id.to_string(),
                existing: existing.type_name,
                requested: type_name::<T>(),
            }),
            None => {
                info!(
                    ?category,
                    type_id,
                    shape = type_name::<T>(),
                    "Registered content type"
                );
                shapes.insert(
                    key,
                    Shape {
                        rust_type: requested,
                        type_name: type_name::<T>(),
                        template,
                    },
                );
                Ok(())
            }
        }
    }

    /// Returns true if a shape is registered for the key.
    pub fn is_registered(&self, category: Category, type_id: &str) -> bool {
        self.read_shapes()
            .contains_key(&(category, type_id.to_string()))
    }

    /// Returns the Rust type name registered for the key.
    pub fn shape_name(&self, category: Category, type_id: &str) -> Option<&'static str> {
        self.read_shapes()
            .get(&(category, type_id.to_string()))
            .map(|shape| shape.type_name)
    }

    /// Returns true if the shape registered for the key has a `tag` field.
    pub fn has_tag_field(&self, category: Category, type_id: &str) -> bool {
        self.read_shapes()
            .get(&(category, type_id.to_string()))
            .and_then(|shape| shape.template.as_object())
            .is_some_and(|fields| fields.contains_key(TAG_FIELD))
    }

    /// Returns true if `T` is the shape registered for the key.
    pub fn is_shape<T: 'static>(&self, category: Category, type_id: &str) -> bool {
        self.read_shapes()
            .get(&(category, type_id.to_string()))
            .is_some_and(|shape| shape.rust_type == TypeId::of::<T>())
    }

    /// Encodes a value to its structured form.
    ///
    /// Output is deterministic: struct fields keep declaration order.
    pub fn encode<T: Serialize>(&self, value: &T) -> ProtocolResult<Value> {
        Ok(serde_json::to_value(value)?)
    }

    /// Encodes a value to JSON bytes.
    pub fn encode_bytes<T: Serialize>(&self, value: &T) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decodes a payload into its registered shape.
    pub fn decode<T>(&self, category: Category, type_id: &str, payload: Value) -> ProtocolResult<T>
    where
        T: DeserializeOwned + 'static,
    {
        let requested = TypeId::of::<T>();
        let normalized = {
            let shapes = self.read_shapes();
            let shape = shapes
                .get(&(category, type_id.to_string()))
                .ok_or_else(|| ProtocolError::UnknownType {
                    category,
                    type_id: type_id.to_string(),
                })?;

            if shape.rust_type != requested {
                return Err(ProtocolError::ShapeMismatch {
                    category,
                    type_id: type_id.to_string(),
                    registered: shape.type_name,
                    requested: type_name::<T>(),
                });
            }
            self.normalize_with(shape, type_id, payload)?
        };

        serde_json::from_value(normalized)
            .map_err(|e| ProtocolError::decode(type_id, e.to_string()))
    }

    /// Decodes JSON bytes into the registered shape.
    pub fn decode_bytes<T>(&self, category: Category, type_id: &str, bytes: &[u8]) -> ProtocolResult<T>
    where
        T: DeserializeOwned + 'static,
    {
        let payload: Value = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::decode(type_id, e.to_string()))?;
        self.decode(category, type_id, payload)
    }

    /// Checks a payload against the registered shape without decoding it
    /// into a Rust type, returning it with missing fields filled in.
    pub fn normalize(&self, category: Category, type_id: &str, payload: Value) -> ProtocolResult<Value> {
        let shapes = self.read_shapes();
        let shape = shapes
            .get(&(category, type_id.to_string()))
            .ok_or_else(|| ProtocolError::UnknownType {
                category,
                type_id: type_id.to_string(),
            })?;
        self.normalize_with(shape, type_id, payload)
    }

    /// Writes `tag` into the payload's `tag` field when the registered shape
    /// declares one.
    ///
    /// Without `overwrite`, an existing non-null value is kept. Returns true
    /// if the payload was changed.
    pub fn apply_tag(
        &self,
        category: Category,
        type_id: &str,
        payload: &mut Value,
        tag: Option<i64>,
        overwrite: bool,
    ) -> bool {
        let Some(tag) = tag else {
            return false;
        };
        if !self.has_tag_field(category, type_id) {
            return false;
        }
        let Value::Object(fields) = payload else {
            return false;
        };
        let current = fields.get(TAG_FIELD).unwrap_or(&Value::Null);
        if !overwrite && !current.is_null() {
            return false;
        }
        fields.insert(TAG_FIELD.to_string(), Value::from(tag));
        true
    }

    fn normalize_with(&self, shape: &Shape, type_id: &str, payload: Value) -> ProtocolResult<Value> {
        match self.mode {
            DecodeMode::Lenient => Ok(fill_missing(&shape.template, payload)),
            DecodeMode::Strict => {
                check_exact(&shape.template, &payload, type_id, "")?;
                Ok(payload)
            }
        }
    }

    fn read_shapes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ShapeKey, Shape>> {
        self.shapes.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fills fields missing from `payload` with the template's values.
fn fill_missing(template: &Value, payload: Value) -> Value {
    match (template, payload) {
        (Value::Object(defaults), Value::Null) => Value::Object(defaults.clone()),
        (Value::Object(defaults), Value::Object(mut fields)) => {
            for (name, default) in defaults {
                match fields.remove(name) {
                    Some(value) => {
                        fields.insert(name.clone(), fill_missing(default, value));
                    }
                    None => {
                        debug!(field = %name, "Filling missing field with zero value");
                        fields.insert(name.clone(), default.clone());
                    }
                }
            }
            Value::Object(fields)
        }
        (_, payload) => payload,
    }
}

/// Verifies that `payload` carries exactly the template's fields.
fn check_exact(template: &Value, payload: &Value, type_id: &str, path: &str) -> ProtocolResult<()> {
    let (Value::Object(expected), Value::Object(actual)) = (template, payload) else {
        if template.is_object() && payload.is_null() {
            return Err(ProtocolError::decode(
                type_id,
                format!("missing content{}", describe_path(path)),
            ));
        }
        return Ok(());
    };

    if let Some(missing) = expected.keys().find(|name| !actual.contains_key(*name)) {
        return Err(ProtocolError::decode(
            type_id,
            format!("missing field `{}{missing}`", prefix(path)),
        ));
    }
    if let Some(unknown) = actual.keys().find(|name| !expected.contains_key(*name)) {
        return Err(ProtocolError::decode(
            type_id,
            format!("unknown field `{}{unknown}`", prefix(path)),
        ));
    }

    for (name, nested) in nested_objects(expected) {
        if let Some(value) = actual.get(name)
            && value.is_object()
        {
            check_exact(nested, value, type_id, &format!("{}{name}", prefix(path)))?;
        }
    }
    Ok(())
}

fn nested_objects(fields: &Map<String, Value>) -> impl Iterator<Item = (&String, &Value)> {
    fields.iter().filter(|(_, value)| value.is_object())
}

fn prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}.")
    }
}

fn describe_path(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!(" at `{path}`")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ordinal_enum;
    use crate::timestamp::{epoch_seconds, epoch_seconds_option};
    use chrono::{DateTime, TimeZone, Utc};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    ordinal_enum! {
        #[derive(Default)]
        enum Priority {
            #[default]
            High,
            Normal,
            Low,
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Window {
        #[serde(with = "epoch_seconds")]
        opened: DateTime<Utc>,
        #[serde(with = "epoch_seconds_option")]
        closed: Option<DateTime<Utc>>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Job {
        priority: Priority,
        name: String,
        window: Window,
        note: Option<String>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Echo {
        foo: String,
        bar: i32,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tagged {
        foo: String,
        tag: Option<i64>,
    }

    fn registry() -> ContentRegistry {
        let registry = ContentRegistry::new();
        registry.register::<Job>(Category::Command, "job").unwrap();
        registry.register::<Echo>(Category::Command, "echo").unwrap();
        registry.register::<Tagged>(Category::Answer, "echo").unwrap();
        registry
    }

    #[test]
    fn roundtrip_nested_with_nulls() {
        let registry = registry();
        let job = Job {
            priority: Priority::Low,
            name: "reindex".into(),
            window: Window {
                opened: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
                closed: None,
            },
            note: None,
        };

        let bytes = registry.encode_bytes(&job).unwrap();
        let decoded: Job = registry.decode_bytes(Category::Command, "job", &bytes).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn serialization_sample_keeps_field_order() {
        let registry = registry();
        let job = Job {
            priority: Priority::High,
            name: "sample".into(),
            window: Window {
                opened: Utc.timestamp_opt(100, 0).unwrap(),
                closed: None,
            },
            note: None,
        };

        let text = String::from_utf8(registry.encode_bytes(&job).unwrap()).unwrap();
        insta::assert_snapshot!(text, @r#"{"priority":0,"name":"sample","window":{"opened":100,"closed":null},"note":null}"#);
    }

    #[test]
    fn encode_is_deterministic() {
        let registry = registry();
        let echo = Echo {
            foo: "x".into(),
            bar: 1,
        };
        let first = registry.encode_bytes(&echo).unwrap();
        let second = registry.encode_bytes(&echo.clone()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn idempotent_registration() {
        let registry = registry();
        assert!(registry.register::<Echo>(Category::Command, "echo").is_ok());
    }

    #[test]
    fn conflicting_registration_fails() {
        let registry = registry();
        let result = registry.register::<Job>(Category::Command, "echo");
        assert!(matches!(result, Err(ProtocolError::ShapeConflict { .. })));
    }

    #[test]
    fn same_type_id_different_category_is_independent() {
        let registry = registry();
        assert_eq!(
            registry.shape_name(Category::Command, "echo"),
            Some(type_name::<Echo>())
        );
        assert_eq!(
            registry.shape_name(Category::Answer, "echo"),
            Some(type_name::<Tagged>())
        );
        assert!(!registry.is_registered(Category::Event, "echo"));
    }

    #[test]
    fn unknown_type_error() {
        let registry = registry();
        let result: ProtocolResult<Echo> = registry.decode(Category::Event, "nope", json!({}));
        assert!(matches!(result, Err(ProtocolError::UnknownType { .. })));
    }

    #[test]
    fn shape_mismatch_error() {
        let registry = registry();
        let result: ProtocolResult<Job> = registry.decode(Category::Command, "echo", json!({}));
        assert!(matches!(result, Err(ProtocolError::ShapeMismatch { .. })));
    }

    #[test]
    fn lenient_fills_missing_and_ignores_unknown() {
        let registry = registry();
        let echo: Echo = registry
            .decode(Category::Command, "echo", json!({"foo": "x", "extra": true}))
            .unwrap();
        assert_eq!(
            echo,
            Echo {
                foo: "x".into(),
                bar: 0
            }
        );

        let job: Job = registry
            .decode(Category::Command, "job", json!({"window": {"opened": 5}}))
            .unwrap();
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.window.opened, Utc.timestamp_opt(5, 0).unwrap());
        assert_eq!(job.window.closed, None);
    }

    #[test]
    fn lenient_null_content_is_zero_value() {
        let registry = registry();
        let echo: Echo = registry.decode(Category::Command, "echo", Value::Null).unwrap();
        assert_eq!(echo, Echo::default());
    }

    #[test]
    fn wrong_field_type_is_decode_error() {
        let registry = registry();
        let result: ProtocolResult<Echo> =
            registry.decode(Category::Command, "echo", json!({"foo": 1, "bar": 2}));
        assert!(matches!(result, Err(ProtocolError::Decode { .. })));
    }

    #[test]
    fn strict_rejects_missing_field() {
        let registry = ContentRegistry::strict();
        registry.register::<Echo>(Category::Command, "echo").unwrap();

        let err = registry
            .decode::<Echo>(Category::Command, "echo", json!({"foo": "x"}))
            .unwrap_err();
        assert!(err.to_string().contains("missing field `bar`"), "{err}");
    }

    #[test]
    fn strict_rejects_unknown_field() {
        let registry = ContentRegistry::strict();
        registry.register::<Job>(Category::Command, "job").unwrap();

        let payload = json!({
            "priority": 1,
            "name": "n",
            "window": {"opened": 1, "closed": null, "zone": "utc"},
            "note": null
        });
        let err = registry
            .decode::<Job>(Category::Command, "job", payload)
            .unwrap_err();
        assert!(err.to_string().contains("unknown field `window.zone`"), "{err}");
    }

    #[test]
    fn strict_accepts_exact_payload() {
        let registry = ContentRegistry::strict();
        registry.register::<Echo>(Category::Command, "echo").unwrap();
        let echo: Echo = registry
            .decode(Category::Command, "echo", json!({"foo": "x", "bar": 3}))
            .unwrap();
        assert_eq!(echo.bar, 3);
    }

    #[test]
    fn tag_field_detection() {
        let registry = registry();
        assert!(registry.has_tag_field(Category::Answer, "echo"));
        assert!(!registry.has_tag_field(Category::Command, "echo"));
        assert!(!registry.has_tag_field(Category::Command, "missing"));
    }

    #[test]
    fn apply_tag_respects_overwrite() {
        let registry = registry();

        let mut payload = json!({"foo": "x", "tag": null});
        assert!(registry.apply_tag(Category::Answer, "echo", &mut payload, Some(42), false));
        assert_eq!(payload["tag"], json!(42));

        assert!(!registry.apply_tag(Category::Answer, "echo", &mut payload, Some(7), false));
        assert_eq!(payload["tag"], json!(42));

        assert!(registry.apply_tag(Category::Answer, "echo", &mut payload, Some(7), true));
        assert_eq!(payload["tag"], json!(7));

        let mut untouched = json!({"foo": "x", "tag": null});
        assert!(!registry.apply_tag(Category::Answer, "echo", &mut untouched, None, true));
        assert_eq!(untouched["tag"], Value::Null);
    }

    #[test]
    fn builtin_close_connection_shape() {
        let registry = ContentRegistry::new();
        assert!(registry.is_shape::<CloseConnection>(Category::Command, CLOSE_CONNECTION));
        assert!(registry.is_shape::<()>(Category::Answer, CLOSE_CONNECTION));
    }

    #[test]
    fn concurrent_readers() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let echo: Echo = registry
                        .decode(Category::Command, "echo", json!({"foo": "t", "bar": i}))
                        .unwrap();
                    echo.bar
                })
            })
            .collect();

        let mut seen: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }
}
