use ahash::AHashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use polytrace_types::{nest, Tensor, TypeSpec, Value};

use crate::runtime::jit::binder::literal_to_tensor;
use crate::runtime::jit::error::{JitError, JitResult};
use crate::runtime::jit::specialization::TraceType;

static NEXT_CAPTURE_ID: AtomicU64 = AtomicU64::new(0);

/// Identifies a deferred capture across traces and invocations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaptureKey(String);

impl CaptureKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn unique() -> Self {
        let id = NEXT_CAPTURE_ID.fetch_add(1, Ordering::Relaxed);
        Self(format!("deferred_{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CaptureKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for CaptureKey {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<u64> for CaptureKey {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for CaptureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Resolver = Arc<dyn Fn() -> Value + Send + Sync>;

/// One extra kernel input appended after the flat arguments.
#[derive(Debug, Clone)]
pub enum CaptureSlot {
    Value(Tensor),
    Deferred { key: CaptureKey, spec: Value },
}

struct DeferredCapture {
    spec: Value,
    resolver: Resolver,
}

/// Resolvers for deferred captures, looked up by key on every invocation.
///
/// Keys registered as side inputs by reference are also resolved whenever a
/// call is keyed, in registration order.
#[derive(Default)]
pub struct CaptureRegistry {
    entries: RwLock<AHashMap<CaptureKey, DeferredCapture>>,
    side_inputs: RwLock<Vec<CaptureKey>>,
}

impl fmt::Debug for CaptureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        let mut keys: Vec<&str> = entries.keys().map(CaptureKey::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("CaptureRegistry").field("keys", &keys).finish()
    }
}

impl CaptureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolver unless the key is taken. Returns whether it was inserted.
    pub fn register(&self, key: CaptureKey, spec: Value, resolver: Resolver) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, DeferredCapture { spec, resolver });
        true
    }

    /// Swaps the resolver for an existing key; the declared spec is kept.
    pub fn replace(&self, key: &CaptureKey, resolver: Resolver) -> JitResult<()> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.resolver = resolver;
                Ok(())
            }
            None => Err(JitError::DeferredCaptureType {
                key: key.to_string(),
                detail: "no resolver is registered under this key".to_string(),
            }),
        }
    }

    /// Registers a side input captured by reference. The first resolver for a
    /// key is kept. Returns whether the key was new.
    ///
    /// Side inputs have no declared spec; each trace derives one from the value
    /// it sees.
    pub fn register_side_input(&self, key: CaptureKey, resolver: Resolver) -> bool {
        let inserted = self.register(key.clone(), Value::None, resolver);
        let mut side_inputs = self.side_inputs.write();
        if !side_inputs.contains(&key) {
            side_inputs.push(key);
        }
        inserted
    }

    /// Runs the resolver for `key` without any validation.
    pub fn current_value(&self, key: &CaptureKey) -> Option<Value> {
        let resolver = self.entries.read().get(key).map(|e| Arc::clone(&e.resolver))?;
        Some(resolver())
    }

    pub fn is_side_input(&self, key: &CaptureKey) -> bool {
        self.side_inputs.read().contains(key)
    }

    /// Current types of every side input, as folded into call keys.
    pub fn side_input_types(&self, function: &str) -> JitResult<Vec<(String, TraceType)>> {
        let resolvers: Vec<(CaptureKey, Resolver)> = {
            let entries = self.entries.read();
            self.side_inputs
                .read()
                .iter()
                .filter_map(|key| {
                    entries
                        .get(key)
                        .map(|e| (key.clone(), Arc::clone(&e.resolver)))
                })
                .collect()
        };
        resolvers
            .into_iter()
            .map(|(key, resolver)| {
                let value = resolver();
                TraceType::from_value(&value, key.as_str())
                    .map(|ty| (key.to_string(), ty))
                    .map_err(|u| JitError::UnhashableInput {
                        function: function.to_string(),
                        path: u.path,
                        type_name: u.type_name,
                    })
            })
            .collect()
    }

    /// Drops keys registered by a trace that did not complete.
    pub(crate) fn remove(&self, keys: &[CaptureKey]) {
        if keys.is_empty() {
            return;
        }
        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(key);
        }
        self.side_inputs.write().retain(|k| !keys.contains(k));
    }

    pub(crate) fn insert(&self, key: CaptureKey, spec: Value, resolver: Resolver) {
        self.entries
            .write()
            .insert(key, DeferredCapture { spec, resolver });
    }

    pub fn spec(&self, key: &CaptureKey) -> Option<Value> {
        self.entries.read().get(key).map(|e| e.spec.clone())
    }

    pub fn contains(&self, key: &CaptureKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Runs the resolver for `key` and validates its result against `spec`,
    /// returning the flat tensors to feed the kernel.
    pub fn resolve(&self, key: &CaptureKey, spec: &Value) -> JitResult<Vec<Tensor>> {
        let resolver = self
            .entries
            .read()
            .get(key)
            .map(|e| Arc::clone(&e.resolver))
            .ok_or_else(|| JitError::DeferredCaptureType {
                key: key.to_string(),
                detail: "no resolver is registered under this key".to_string(),
            })?;
        let value = resolver();
        let mut out = Vec::new();
        flatten_against_spec(spec, &value, &mut out).map_err(|detail| {
            JitError::DeferredCaptureType {
                key: key.to_string(),
                detail,
            }
        })?;
        Ok(out)
    }
}

fn flatten_against_spec(spec: &Value, value: &Value, out: &mut Vec<Tensor>) -> Result<(), String> {
    match (spec, value) {
        (Value::List(specs), Value::List(values)) | (Value::Tuple(specs), Value::Tuple(values))
            if specs.len() == values.len() =>
        {
            for (s, v) in specs.iter().zip(values) {
                flatten_against_spec(s, v, out)?;
            }
            Ok(())
        }
        (Value::Dict(specs), Value::Dict(values))
            if specs.keys().eq(values.keys()) =>
        {
            for (s, v) in specs.values().zip(values.values()) {
                flatten_against_spec(s, v, out)?;
            }
            Ok(())
        }
        // Literal leaves of a side input are part of the call key already.
        (literal, _) if literal.is_literal() => Ok(()),
        (Value::Spec(TypeSpec::Tensor(want)), value) => {
            let tensor = match value {
                Value::Tensor(t) => t.clone(),
                literal => match literal_to_tensor(literal, Some(want.dtype)) {
                    Some(t) if !(matches!(literal, Value::Float(_)) && want.dtype.is_integer()) => t,
                    _ => {
                        return Err(format!(
                            "value {} cannot be converted to a tensor with dtype {}",
                            literal, want.dtype
                        ));
                    }
                },
            };
            if tensor.dtype() != want.dtype {
                return Err(format!(
                    "value {tensor} cannot be converted to a tensor with dtype {}",
                    want.dtype
                ));
            }
            if !want.shape.is_compatible_with(tensor.shape()) {
                return Err(format!(
                    "value {tensor} has a shape incompatible with the declared shape {}",
                    want.shape
                ));
            }
            out.push(tensor);
            Ok(())
        }
        (Value::Spec(TypeSpec::Composite(want)), Value::Composite(c)) => {
            if !c.spec().is_subtype_of(want) {
                return Err(format!(
                    "value of type {} is incompatible with the declared {want}",
                    c.spec()
                ));
            }
            out.extend(c.components().iter().cloned());
            Ok(())
        }
        (spec, value) => Err(format!(
            "expected a value matching {spec}, got {}",
            value.describe()
        )),
    }
}

/// Checks that every leaf of a declared capture spec is a type spec.
pub fn validate_spec(spec: &Value) -> Result<(), String> {
    for leaf in nest::flatten(spec) {
        if !matches!(leaf, Value::Spec(_)) {
            return Err(format!(
                "capture specs may only contain type specs, found {}",
                leaf.describe()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use polytrace_types::{Composite, DType, TensorShape};

    fn scalar_spec() -> Value {
        Value::Spec(TypeSpec::tensor(DType::Float32, TensorShape::scalar()))
    }

    #[test]
    fn first_registration_wins() {
        let registry = CaptureRegistry::new();
        let key = CaptureKey::from("k");
        assert!(registry.register(key.clone(), scalar_spec(), Arc::new(|| Value::Float(1.0))));
        assert!(!registry.register(key.clone(), scalar_spec(), Arc::new(|| Value::Float(9.0))));
        let out = registry.resolve(&key, &scalar_spec()).unwrap();
        assert_eq!(out[0].scalar_value(), Some(1.0));
    }

    #[test]
    fn resolve_rejects_dtype_and_shape_mismatches() {
        let registry = CaptureRegistry::new();
        let key = CaptureKey::from("k");
        registry.register(
            key.clone(),
            scalar_spec(),
            Arc::new(|| Value::Tensor(Tensor::scalar(DType::Int32, 1.0))),
        );
        let err = registry.resolve(&key, &scalar_spec()).unwrap_err();
        assert!(err.to_string().contains("with dtype float32"));

        registry
            .replace(
                &key,
                Arc::new(|| Value::Tensor(Tensor::from_vec(DType::Float32, vec![1.0]))),
            )
            .unwrap();
        let err = registry.resolve(&key, &scalar_spec()).unwrap_err();
        assert!(err.to_string().contains("shape"));
    }

    #[test]
    fn nested_specs_flatten_composites() {
        let spec = Value::dict([
            ("r", Value::Spec(TypeSpec::ragged(DType::Int32, TensorShape::unknown_dims(2)))),
            ("t", scalar_spec()),
        ]);
        let value = Value::dict([
            ("r", Value::Composite(Composite::ragged(DType::Int32, vec![vec![1.0], vec![]]))),
            ("t", Value::Float(2.5)),
        ]);
        let mut out = Vec::new();
        flatten_against_spec(&spec, &value, &mut out).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].scalar_value(), Some(2.5));
    }

    #[test]
    fn side_inputs_are_typed_in_registration_order() -> JitResult<()> {
        let registry = CaptureRegistry::new();
        registry.register_side_input("b".into(), Arc::new(|| Value::Int(3)));
        registry.register_side_input(
            "a".into(),
            Arc::new(|| Value::Tensor(Tensor::scalar(DType::Float32, 1.0))),
        );
        assert_eq!(registry.current_value(&"b".into()), Some(Value::Int(3)));
        let types = registry.side_input_types("f")?;
        let names: Vec<&str> = types.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(types[0].1.to_string(), "3");
        assert!(registry.is_side_input(&"a".into()));

        registry.remove(&[CaptureKey::from("b")]);
        assert!(!registry.contains(&"b".into()));
        assert_eq!(registry.side_input_types("f")?.len(), 1);
        Ok(())
    }

    #[test]
    fn unhashable_side_inputs_fail_keying() {
        let registry = CaptureRegistry::new();
        registry.register_side_input("s".into(), Arc::new(|| Value::Set(vec![Value::Int(1)])));
        let err = registry.side_input_types("f").unwrap_err();
        assert!(matches!(err, JitError::UnhashableInput { ref type_name, .. } if type_name == "set"));
    }

    #[test]
    fn specs_must_be_specs() {
        assert!(validate_spec(&Value::list([scalar_spec(), Value::Int(1)])).is_err());
        assert!(validate_spec(&scalar_spec()).is_ok());
    }
}
