use parking_lot::{ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use polytrace_types::{Kwargs, Placeholder, Tensor, TypeSpec, Value};
use tracing::{debug, info, warn};

use crate::config::JitConfig;

use super::binder::{literal_to_tensor, BoundArguments, FunctionSpec, Param, ParamKind};
use super::cache::{CacheStats, CachedFunction, FunctionCache};
use super::capture::{CaptureKey, CaptureRegistry};
use super::concrete::{ConcreteFunction, ConcreteParam, ConcreteParts, FlatParam, Kernel};
use super::context::{ExecutionContext, TraceContext};
use super::error::{JitError, JitResult};
use super::metrics::{DispatchMetrics, DispatchMetricsSnapshot};
use super::specialization::{KeyEntry, RelaxationState, SignatureKey, TraceType};

/// Arguments handed to a trace body, one entry per declared parameter.
///
/// Tensor leaves are replaced by placeholders. Variadic positions are gathered
/// into a tuple and collected keywords into a dict.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TraceArgs {
    entries: Vec<(String, Value)>,
}

impl TraceArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Placeholder bound directly to `name`.
    pub fn placeholder(&self, name: &str) -> JitResult<&Placeholder> {
        self.get(name).and_then(Value::as_placeholder).ok_or_else(|| {
            JitError::trace(name, format!("argument {name} is not a traced tensor"))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a trace produces: an output nest and the kernel that computes its tensors.
///
/// Placeholder and spec leaves of `outputs` are filled from the kernel results in
/// flatten order; every other leaf is returned as is.
pub struct TracedGraph {
    outputs: Value,
    kernel: Arc<dyn Kernel>,
}

impl TracedGraph {
    pub fn new<K>(outputs: Value, kernel: K) -> Self
    where
        K: Fn(&ExecutionContext, &[Tensor]) -> JitResult<Vec<Tensor>> + Send + Sync + 'static,
    {
        Self {
            outputs,
            kernel: Arc::new(kernel),
        }
    }

    pub fn outputs(&self) -> &Value {
        &self.outputs
    }
}

/// User code that can be traced into a [`TracedGraph`].
pub trait Traceable: Send + Sync {
    fn trace(&self, ctx: &mut TraceContext, args: &mut TraceArgs) -> JitResult<TracedGraph>;
}

struct FnTraceable<F>(F);

impl<F> Traceable for FnTraceable<F>
where
    F: Fn(&mut TraceContext, &mut TraceArgs) -> JitResult<TracedGraph> + Send + Sync,
{
    fn trace(&self, ctx: &mut TraceContext, args: &mut TraceArgs) -> JitResult<TracedGraph> {
        (self.0)(ctx, args)
    }
}

/// The thing a [`Function`] wraps. Only callables can be traced.
#[derive(Clone)]
pub enum Target {
    Callable(Arc<dyn Traceable>),
    Value(Value),
}

pub struct FunctionBuilder {
    name: String,
    params: Vec<Param>,
    target: Option<Target>,
    input_signature: Option<Vec<Value>>,
    config: JitConfig,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            target: None,
            input_signature: None,
            config: JitConfig::global().clone(),
        }
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn trace_fn<F>(mut self, body: F) -> Self
    where
        F: Fn(&mut TraceContext, &mut TraceArgs) -> JitResult<TracedGraph> + Send + Sync + 'static,
    {
        self.target = Some(Target::Callable(Arc::new(FnTraceable(body))));
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    /// One nest of type specs per leading positional parameter.
    pub fn input_signature(mut self, signature: Vec<Value>) -> Self {
        self.input_signature = Some(signature);
        self
    }

    pub fn config(mut self, config: JitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reduce_retracing(mut self, enabled: bool) -> Self {
        self.config.reduce_retracing = enabled;
        self
    }

    pub fn relaxation_threshold(mut self, threshold: usize) -> Self {
        self.config.relaxation_threshold = threshold;
        self
    }

    pub fn follow_type_hints(mut self, enabled: bool) -> Self {
        self.config.follow_type_hints = enabled;
        self
    }

    pub fn build(self) -> JitResult<Function> {
        let traceable = match self.target {
            Some(Target::Callable(traceable)) => traceable,
            Some(Target::Value(value)) => {
                return Err(JitError::UncallableTarget {
                    target: value.describe(),
                });
            }
            None => {
                return Err(JitError::UncallableTarget {
                    target: format!("{} (no target)", self.name),
                });
            }
        };
        let spec = FunctionSpec::new(self.name, self.params);
        let input_signature = self
            .input_signature
            .map(|values| InputSignature::new(&spec, values))
            .transpose()?;

        Ok(Function {
            relaxation: RwLock::new(RelaxationState::new(self.config.relaxation_threshold)),
            spec,
            traceable,
            input_signature,
            config: self.config,
            cache: FunctionCache::new(),
            trace_lock: ReentrantMutex::new(RefCell::new(Vec::new())),
            registry: Arc::new(CaptureRegistry::new()),
            metrics: DispatchMetrics::new(),
        })
    }
}

/// A declared input signature and the single key every call maps to.
#[derive(Debug)]
struct InputSignature {
    specs: Vec<Value>,
    key: SignatureKey,
}

impl InputSignature {
    fn new(spec: &FunctionSpec, specs: Vec<Value>) -> JitResult<Self> {
        let invalid = |reason: String| JitError::InvalidInputSignature {
            function: spec.name.clone(),
            reason,
        };
        for (i, entry) in specs.iter().enumerate() {
            if let Some(leaf) = polytrace_types::nest::flatten(entry)
                .into_iter()
                .find(|leaf| !matches!(leaf, Value::Spec(_)))
            {
                return Err(invalid(format!(
                    "entry {i} contains {}, expected only type specs",
                    leaf.describe()
                )));
            }
        }
        if specs.len() > spec.positional_count() {
            return Err(invalid(format!(
                "{} has {} positional parameters but the signature has {} entries",
                spec.signature(),
                spec.positional_count(),
                specs.len()
            )));
        }

        let mut entries = Vec::new();
        let fixed = spec
            .params
            .iter()
            .filter(|p| matches!(p.kind, ParamKind::PositionalOrKeyword | ParamKind::KeywordOnly));
        for (i, param) in fixed.enumerate() {
            let value = match specs.get(i) {
                Some(value) if param.kind == ParamKind::PositionalOrKeyword => value,
                _ => param.default.as_ref().ok_or_else(|| {
                    invalid(format!(
                        "parameter {} is not covered by the signature and has no default",
                        param.name
                    ))
                })?,
            };
            let trace_type = TraceType::from_value(value, &param.name).map_err(|u| {
                invalid(format!("{} has unsupported type {}", u.path, u.type_name))
            })?;
            entries.push(KeyEntry {
                name: param.name.clone(),
                kind: param.kind,
                trace_type,
            });
        }

        Ok(Self {
            specs,
            key: SignatureKey::new(entries),
        })
    }

    fn len(&self) -> usize {
        self.specs.len()
    }

    /// Checks and converts call arguments in place.
    fn conform(&self, function: &str, bound: &mut BoundArguments) -> JitResult<()> {
        let supplied = bound.entries().iter().filter(|e| !e.from_default).count();
        let extra = bound
            .entries()
            .iter()
            .skip(self.specs.len())
            .any(|e| !e.from_default);
        if extra {
            return Err(JitError::SignatureMismatch {
                function: function.to_string(),
                diff: format!(
                    "input signature specifies {} positional arguments, but got {supplied}",
                    self.specs.len()
                ),
            });
        }
        for (entry, spec) in bound.entries_mut().iter_mut().zip(&self.specs) {
            entry.value = conform_value(&entry.value, spec, &entry.name).map_err(|diff| {
                JitError::SignatureMismatch {
                    function: function.to_string(),
                    diff,
                }
            })?;
        }
        Ok(())
    }
}

fn conform_value(value: &Value, spec: &Value, path: &str) -> Result<Value, String> {
    match (spec, value) {
        (Value::List(specs), Value::List(values)) | (Value::Tuple(specs), Value::Tuple(values))
            if specs.len() == values.len() =>
        {
            let items = specs
                .iter()
                .zip(values)
                .enumerate()
                .map(|(i, (s, v))| conform_value(v, s, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(match spec {
                Value::List(_) => Value::List(items),
                _ => Value::Tuple(items),
            })
        }
        (Value::Dict(specs), Value::Dict(values)) if specs.keys().eq(values.keys()) => specs
            .iter()
            .zip(values.values())
            .map(|((k, s), v)| Ok((k.clone(), conform_value(v, s, &format!("{path}['{k}']"))?)))
            .collect::<Result<BTreeMap<_, _>, String>>()
            .map(Value::Dict),
        (Value::Spec(want), Value::Spec(given)) if given.is_subtype_of(want) => Ok(value.clone()),
        (Value::Spec(TypeSpec::Tensor(want)), Value::Tensor(t)) => {
            if want.accepts(t.dtype(), t.shape()) {
                Ok(value.clone())
            } else {
                Err(format!("{path}: expected {want}, got {}", t.spec()))
            }
        }
        (Value::Spec(TypeSpec::Tensor(want)), literal)
            if literal.is_literal()
                && !(matches!(literal, Value::Float(_)) && want.dtype.is_integer()) =>
        {
            match literal_to_tensor(literal, Some(want.dtype)) {
                Some(t) if want.accepts(t.dtype(), t.shape()) => Ok(Value::Tensor(t)),
                _ => Err(format!("{path}: expected {want}, got {}", literal.describe())),
            }
        }
        (Value::Spec(TypeSpec::Composite(want)), Value::Composite(c))
            if c.spec().is_subtype_of(want) =>
        {
            Ok(value.clone())
        }
        (spec, value) => Err(format!("{path}: expected {spec}, got {}", value.describe())),
    }
}

/// A polymorphic function: traces one concrete function per distinct input
/// structure and dispatches calls to them.
pub struct Function {
    spec: FunctionSpec,
    traceable: Arc<dyn Traceable>,
    input_signature: Option<InputSignature>,
    config: JitConfig,
    cache: FunctionCache,
    relaxation: RwLock<RelaxationState>,
    // Serializes miss -> trace -> insert and holds the keys being traced.
    // Reentrant so a trace body may call this function again.
    trace_lock: ReentrantMutex<RefCell<Vec<SignatureKey>>>,
    registry: Arc<CaptureRegistry>,
    metrics: DispatchMetrics,
}

impl Function {
    pub fn builder(name: impl Into<String>) -> FunctionBuilder {
        FunctionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &FunctionSpec {
        &self.spec
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn call(&self, args: &[Value], kwargs: &Kwargs) -> JitResult<Value> {
        self.call_with_context(&ExecutionContext::new(), args, kwargs)
    }

    /// Dispatches a call made from inside another function's kernel, so that
    /// execution errors report the whole chain.
    pub fn call_with_context(
        &self,
        ctx: &ExecutionContext,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> JitResult<Value> {
        let (key, bound) = self.key_for(args, kwargs)?;
        let entry = self.concrete_for(&key, &bound, 0)?;
        entry.metadata.record_call();
        entry
            .function
            .invoke_bound(&ctx.enter(&self.spec.name), &bound)
    }

    /// Traces (or fetches) the concrete function for these arguments without running it.
    ///
    /// Arguments may be type specs. With an input signature and no arguments, the
    /// signature itself is used.
    pub fn get_concrete_function(
        &self,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> JitResult<Arc<ConcreteFunction>> {
        self.concrete_function_at(0, args, kwargs)
    }

    /// Same as [`Function::get_concrete_function`], for a trace started inside
    /// `depth` enclosing traces.
    pub(crate) fn concrete_function_at(
        &self,
        depth: usize,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> JitResult<Arc<ConcreteFunction>> {
        let (key, bound) = match &self.input_signature {
            Some(signature) if args.is_empty() && kwargs.is_empty() => {
                let bound = self.spec.bind(&signature.specs, &Kwargs::new())?;
                (self.with_side_inputs(&signature.key)?, bound)
            }
            _ => self.key_for(args, kwargs)?,
        };
        Ok(self.concrete_for(&key, &bound, depth)?.function)
    }

    fn key_for(&self, args: &[Value], kwargs: &Kwargs) -> JitResult<(SignatureKey, BoundArguments)> {
        let mut bound = self.spec.bind(args, kwargs)?;
        if self.config.follow_type_hints {
            self.spec.apply_type_hints(&mut bound);
        }
        let key = match &self.input_signature {
            Some(signature) => {
                signature.conform(&self.spec.name, &mut bound)?;
                signature.key.clone()
            }
            None => SignatureKey::from_bound(&self.spec.name, &bound)?,
        };
        Ok((self.with_side_inputs(&key)?, bound))
    }

    /// `key` carrying the current types of this function's side inputs.
    fn with_side_inputs(&self, key: &SignatureKey) -> JitResult<SignatureKey> {
        let side_inputs = self.registry.side_input_types(&self.spec.name)?;
        if side_inputs.is_empty() && key.side_inputs().is_empty() {
            return Ok(key.clone());
        }
        Ok(key.with_side_inputs(side_inputs))
    }

    fn lookup(&self, key: &SignatureKey) -> Option<CachedFunction> {
        let covering = self.relaxation.read().covering_key(key);
        covering
            .and_then(|relaxed| self.cache.get(&relaxed))
            .or_else(|| self.cache.get(key))
    }

    fn concrete_for(
        &self,
        key: &SignatureKey,
        bound: &BoundArguments,
        depth: usize,
    ) -> JitResult<CachedFunction> {
        if let Some(entry) = self.lookup(key) {
            self.metrics.record_hit();
            debug!(function = %self.spec.name, key = %entry.key, "cache hit");
            return Ok(entry);
        }

        let in_flight = self.trace_lock.lock();
        // A trace that finished while we waited may have added side inputs.
        let key = &self.with_side_inputs(key)?;
        if let Some(entry) = self.lookup(key) {
            self.metrics.record_hit();
            debug!(function = %self.spec.name, key = %entry.key, "cache hit after waiting for trace");
            return Ok(entry);
        }
        self.metrics.record_miss();
        debug!(function = %self.spec.name, key = %key, "cache miss");

        let relaxed = if self.config.reduce_retracing && self.input_signature.is_none() {
            self.relaxation.read().consider(key)
        } else {
            None
        };
        if let Some(relaxed_key) = &relaxed {
            debug!(function = %self.spec.name, from = %key, to = %relaxed_key, "relaxing shapes");
        }
        let trace_key = relaxed.clone().unwrap_or_else(|| key.clone());
        if let Some(entry) = relaxed.as_ref().and_then(|k| self.cache.get(k)) {
            self.relaxation.write().record(key.clone(), &trace_key);
            self.metrics.record_relaxation();
            debug!(function = %self.spec.name, key = %trace_key, "relaxed key already traced");
            return Ok(entry);
        }
        if in_flight.borrow().contains(&trace_key) {
            self.metrics.record_failed_trace();
            return Err(JitError::trace(
                &self.spec.name,
                format!(
                    "recursive call with arguments {trace_key} while they are being traced; \
                     recursion must change the arguments before calling again"
                ),
            ));
        }

        let start = Instant::now();
        let traced = {
            let _tracing = InFlight::enter(&in_flight, trace_key.clone());
            self.trace(&trace_key, bound, depth)
        };
        let function = match traced {
            Ok(function) => function,
            Err(err) => {
                self.metrics.record_failed_trace();
                return Err(err);
            }
        };
        // The traced key also carries side inputs the trace captured.
        let traced_key = function.key().clone();
        let entry = self
            .cache
            .insert(traced_key.clone(), Arc::new(function), start.elapsed());
        self.relaxation.write().record(
            key.with_side_inputs(traced_key.side_inputs().to_vec()),
            &traced_key,
        );

        let streak = self.metrics.record_trace(relaxed.is_some());
        info!(
            function = %self.spec.name,
            key = %traced_key,
            elapsed_us = start.elapsed().as_micros() as u64,
            "traced concrete function"
        );
        if streak >= self.config.retrace_warning_threshold {
            warn!(
                function = %self.spec.name,
                consecutive = streak,
                "function keeps retracing; pass tensors instead of literals or declare an input signature"
            );
        }
        Ok(entry)
    }

    fn trace(
        &self,
        key: &SignatureKey,
        bound: &BoundArguments,
        depth: usize,
    ) -> JitResult<ConcreteFunction> {
        let mut args = TraceArgs {
            entries: self
                .spec
                .params
                .iter()
                .map(|p| {
                    let empty = match p.kind {
                        ParamKind::VarPositional => Value::Tuple(Vec::new()),
                        ParamKind::VarKeyword => Value::Dict(BTreeMap::new()),
                        _ => Value::None,
                    };
                    (p.name.clone(), empty)
                })
                .collect(),
        };

        let mut builder = PlaceholderBuilder::default();
        let mut params = Vec::with_capacity(key.entries().len());
        let visible = self
            .input_signature
            .as_ref()
            .map_or(usize::MAX, InputSignature::len);
        for (i, (entry, arg)) in key.entries().iter().zip(bound.entries()).enumerate() {
            let traced = builder.build(&entry.trace_type, Some(&arg.value), &arg.flat_name);
            if let Some(slot) = args.get_mut(&arg.param) {
                match (slot, arg.kind) {
                    (Value::Tuple(items), ParamKind::VarPositional) => items.push(traced),
                    (Value::Dict(map), ParamKind::VarKeyword) => {
                        map.insert(arg.name.clone(), traced);
                    }
                    (slot, _) => *slot = traced,
                }
            }
            params.push(ConcreteParam {
                name: entry.name.clone(),
                kind: entry.kind,
                trace_type: entry.trace_type.clone(),
                hidden_value: (i >= visible).then(|| arg.value.clone()),
            });
        }

        let original = args.clone();
        let mut ctx = TraceContext::new(
            self.spec.name.clone(),
            Arc::clone(&self.registry),
            builder.next_index,
        )
        .with_depth(depth);
        let graph = self.traceable.trace(&mut ctx, &mut args)?;
        if args != original {
            return Err(JitError::MutationDetected {
                function: self.spec.name.clone(),
            });
        }
        let key = key.with_side_inputs(self.registry.side_input_types(&self.spec.name)?);
        let captures = ctx.take_captures();
        let function = ConcreteFunction::new(ConcreteParts {
            name: self.spec.name.clone(),
            key,
            params,
            flat_params: builder.flat_params,
            outputs: graph.outputs,
            kernel: graph.kernel,
            captures,
            registry: Arc::clone(&self.registry),
        })?;
        ctx.commit();
        Ok(function)
    }

    /// Traced functions in the order they were created.
    pub fn concrete_functions(&self) -> Vec<Arc<ConcreteFunction>> {
        self.cache.list_entries()
    }

    /// Swaps the resolver of a deferred capture; no retrace happens.
    pub fn replace_deferred_capture<F>(&self, key: impl Into<CaptureKey>, resolver: F) -> JitResult<()>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.registry.replace(&key.into(), Arc::new(resolver))
    }

    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cached_entries(&self) -> Vec<CachedFunction> {
        self.cache.entries()
    }

    /// Relaxed keys currently superseding narrower ones.
    pub fn relaxed_keys(&self) -> Vec<SignatureKey> {
        self.relaxation.read().relaxed_keys()
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("signature", &self.spec.signature())
            .field("concrete_functions", &self.cache.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Marks a key as being traced on this thread until dropped.
struct InFlight<'a> {
    keys: &'a RefCell<Vec<SignatureKey>>,
}

impl<'a> InFlight<'a> {
    fn enter(keys: &'a RefCell<Vec<SignatureKey>>, key: SignatureKey) -> Self {
        keys.borrow_mut().push(key);
        Self { keys }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.keys.borrow_mut().pop();
    }
}

/// Assigns flat input positions and names while turning a key into trace arguments.
#[derive(Default)]
struct PlaceholderBuilder {
    next_index: usize,
    flat_params: Vec<FlatParam>,
}

impl PlaceholderBuilder {
    fn build(&mut self, ty: &TraceType, value: Option<&Value>, base: &str) -> Value {
        match ty {
            TraceType::Literal(lit) => lit.to_value(),
            TraceType::Spec(spec) => {
                let base = value
                    .and_then(|v| match v {
                        Value::Spec(s) => s.name(),
                        _ => None,
                    })
                    .unwrap_or(base)
                    .to_string();
                let placeholder = Placeholder {
                    index: self.next_index,
                    spec: spec.clone(),
                };
                for component in spec.component_specs() {
                    let name = self.unique_name(&base);
                    self.flat_params.push(FlatParam {
                        name,
                        spec: component.unnamed(),
                    });
                }
                self.next_index += spec.flat_len();
                Value::Placeholder(placeholder)
            }
            TraceType::List(items) => Value::List(self.build_items(items, value, base)),
            TraceType::Tuple(items) => Value::Tuple(self.build_items(items, value, base)),
            TraceType::Dict(items) => {
                let values = match value {
                    Some(Value::Dict(map)) => Some(map),
                    _ => None,
                };
                Value::Dict(
                    items
                        .iter()
                        .map(|(k, ty)| {
                            let child = values.and_then(|m| m.get(k));
                            (k.clone(), self.build(ty, child, base))
                        })
                        .collect(),
                )
            }
        }
    }

    fn build_items(&mut self, items: &[TraceType], value: Option<&Value>, base: &str) -> Vec<Value> {
        let values = match value {
            Some(Value::List(v) | Value::Tuple(v)) => Some(v),
            _ => None,
        };
        items
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                let child = values.and_then(|v| v.get(i));
                self.build(ty, child, base)
            })
            .collect()
    }

    fn unique_name(&self, base: &str) -> String {
        let taken = |name: &str| self.flat_params.iter().any(|p| p.name == name);
        if !taken(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| base.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polytrace_types::{DType, TensorShape};

    #[test]
    fn flat_names_are_deduplicated() {
        let mut builder = PlaceholderBuilder::default();
        let ty = TraceType::List(vec![
            TraceType::Spec(TypeSpec::tensor(DType::Int32, TensorShape::scalar())),
            TraceType::Spec(TypeSpec::tensor(DType::Int32, TensorShape::scalar())),
        ]);
        builder.build(&ty, None, "c");
        let names: Vec<&str> = builder.flat_params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["c", "c_1"]);
        assert_eq!(builder.next_index, 2);
    }

    #[test]
    fn value_targets_are_rejected() {
        let err = FunctionBuilder::new("f")
            .target(Target::Value(Value::Int(5)))
            .build()
            .unwrap_err();
        assert!(matches!(err, JitError::UncallableTarget { .. }));
        assert!(err.to_string().starts_with("int value 5 is not callable"));
    }

    #[test]
    fn signature_literals_become_tensors() {
        let spec = Value::Spec(TypeSpec::tensor(DType::Float32, TensorShape::unknown()));
        let converted = conform_value(&Value::Int(3), &spec, "a").unwrap();
        assert_eq!(converted, Value::Tensor(Tensor::scalar(DType::Float32, 3.0)));

        let int_spec = Value::Spec(TypeSpec::tensor(DType::Int32, TensorShape::scalar()));
        assert!(conform_value(&Value::Float(1.5), &int_spec, "a").is_err());
    }
}
