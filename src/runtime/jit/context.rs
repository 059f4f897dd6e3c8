use ahash::AHashMap;
use crossbeam_channel::{select, Receiver};
use std::sync::Arc;

use polytrace_types::{nest, Kwargs, Placeholder, Tensor, TypeSpec, Value};
use tracing::debug;

use crate::runtime::jit::cancellation::CancellationToken;
use crate::runtime::jit::capture::{validate_spec, CaptureKey, CaptureRegistry, CaptureSlot};
use crate::runtime::jit::concrete::ConcreteFunction;
use crate::runtime::jit::engine::Function;
use crate::runtime::jit::error::{JitError, JitResult};
use crate::runtime::jit::specialization::TraceType;

/// State threaded through a single trace of a user function.
///
/// Exit callbacks run when the context is dropped, so a trace nested inside
/// another one finishes its callbacks first. Resolvers this trace registered
/// are dropped again unless the trace is committed.
pub struct TraceContext {
    function: String,
    registry: Arc<CaptureRegistry>,
    depth: usize,
    next_index: usize,
    captures: Vec<CaptureSlot>,
    deferred: AHashMap<CaptureKey, Value>,
    registered: Vec<CaptureKey>,
    committed: bool,
    exit_callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl TraceContext {
    pub(crate) fn new(
        function: impl Into<String>,
        registry: Arc<CaptureRegistry>,
        first_capture_index: usize,
    ) -> Self {
        Self {
            function: function.into(),
            registry,
            depth: 0,
            next_index: first_capture_index,
            captures: Vec::new(),
            deferred: AHashMap::new(),
            registered: Vec::new(),
            committed: false,
            exit_callbacks: Vec::new(),
        }
    }

    /// Marks this as a trace started from inside `depth` enclosing traces.
    pub(crate) fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn function_name(&self) -> &str {
        &self.function
    }

    /// Number of traces enclosing this one; 0 for a top-level trace.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Traces (or fetches) `function` as part of this trace.
    ///
    /// The nested trace knows it is nested, which restricts what it may capture.
    pub fn concrete_function_of(
        &self,
        function: &Function,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> JitResult<Arc<ConcreteFunction>> {
        function.concrete_function_at(self.depth + 1, args, kwargs)
    }

    /// Captures a tensor by value; it is fed to the kernel on every call.
    pub fn capture(&mut self, tensor: Tensor) -> Value {
        let placeholder = Placeholder {
            index: self.next_index,
            spec: TypeSpec::Tensor(tensor.spec()),
        };
        self.next_index += 1;
        self.captures.push(CaptureSlot::Value(tensor));
        Value::Placeholder(placeholder)
    }

    /// Declares a value that is re-resolved before each execution.
    ///
    /// `spec` is a nest of type specs. A key already captured in this trace
    /// returns the existing placeholders and `resolver` is never run. Without a
    /// key a fresh one is generated.
    pub fn capture_call_time_value<F>(
        &mut self,
        key: Option<CaptureKey>,
        spec: Value,
        resolver: F,
    ) -> JitResult<Value>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let key = key.unwrap_or_else(CaptureKey::unique);
        if let Some(existing) = self.deferred.get(&key) {
            debug!(function = %self.function, key = %key, "reusing deferred capture");
            return Ok(existing.clone());
        }
        validate_spec(&spec).map_err(|reason| JitError::trace(&self.function, reason))?;

        if self
            .registry
            .register(key.clone(), spec.clone(), Arc::new(resolver))
        {
            self.registered.push(key.clone());
        }
        let spec = self.registry.spec(&key).unwrap_or(spec);
        self.defer(key, spec)
    }

    /// Captures whatever `resolver` returns as a side input read by reference.
    ///
    /// The resolved value is part of every call's key: literal values are
    /// baked into the trace and retrace when they change, array values only
    /// retrace when their type changes and are re-read before each execution.
    /// Only top-level traces may do this.
    pub fn capture_side_input_by_ref<F>(
        &mut self,
        key: impl Into<CaptureKey>,
        resolver: F,
    ) -> JitResult<Value>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let key = key.into();
        if self.depth > 0 {
            return Err(JitError::trace(
                &self.function,
                format!(
                    "side input {key}: manual side input usage for inner nested functions is not supported"
                ),
            ));
        }
        if let Some(existing) = self.deferred.get(&key) {
            return Ok(existing.clone());
        }

        if self
            .registry
            .register_side_input(key.clone(), Arc::new(resolver))
        {
            self.registered.push(key.clone());
        }
        let value = self.registry.current_value(&key).ok_or_else(|| {
            JitError::trace(&self.function, format!("side input {key} has no resolver"))
        })?;
        let trace_type =
            TraceType::from_value(&value, key.as_str()).map_err(|u| JitError::UnhashableInput {
                function: self.function.clone(),
                path: u.path,
                type_name: u.type_name,
            })?;
        let spec = spec_value(&trace_type);
        if trace_type.specs().is_empty() {
            debug!(function = %self.function, key = %key, value = %spec, "side input baked into trace");
            self.deferred.insert(key, spec.clone());
            return Ok(spec);
        }
        self.defer(key, spec)
    }

    fn defer(&mut self, key: CaptureKey, spec: Value) -> JitResult<Value> {
        let mut next = self.next_index;
        let placeholders = nest::map_leaves(&spec, &mut |leaf| match leaf {
            Value::Spec(s) => {
                let placeholder = Placeholder {
                    index: next,
                    spec: s.clone(),
                };
                next += s.flat_len();
                Ok(Value::Placeholder(placeholder))
            }
            literal if literal.is_literal() => Ok(literal.clone()),
            other => Err(JitError::trace(
                "capture",
                format!("unexpected leaf {}", other.describe()),
            )),
        })?;
        self.next_index = next;
        self.captures.push(CaptureSlot::Deferred {
            key: key.clone(),
            spec,
        });
        self.deferred.insert(key, placeholders.clone());
        Ok(placeholders)
    }

    /// Registers `callback` to run once when this trace finishes.
    pub fn add_exit_callback(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.exit_callbacks.push(Box::new(callback));
    }

    pub(crate) fn take_captures(&mut self) -> Vec<CaptureSlot> {
        std::mem::take(&mut self.captures)
    }

    /// Keeps the resolvers registered during this trace.
    pub(crate) fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for TraceContext {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.remove(&self.registered);
        }
        for callback in self.exit_callbacks.drain(..) {
            callback();
        }
    }
}

/// Nest of type specs (and literal leaves) describing values of `ty`.
fn spec_value(ty: &TraceType) -> Value {
    match ty {
        TraceType::Literal(lit) => lit.to_value(),
        TraceType::Spec(spec) => Value::Spec(spec.clone()),
        TraceType::List(items) => Value::List(items.iter().map(spec_value).collect()),
        TraceType::Tuple(items) => Value::Tuple(items.iter().map(spec_value).collect()),
        TraceType::Dict(items) => Value::Dict(
            items
                .iter()
                .map(|(k, v)| (k.clone(), spec_value(v)))
                .collect(),
        ),
    }
}

/// Per-invocation state: the chain of dispatching functions and an optional
/// cancellation token.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    cancellation: Option<CancellationToken>,
    stack: Vec<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: Some(token),
            stack: Vec::new(),
        }
    }

    /// Child context for a nested call into `function`.
    pub fn enter(&self, function: &str) -> ExecutionContext {
        let mut stack = self.stack.clone();
        stack.push(function.to_string());
        Self {
            cancellation: self.cancellation.clone(),
            stack,
        }
    }

    pub fn call_chain(&self) -> &[String] {
        &self.stack
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Safe point: fails with [`JitError::Cancelled`] once cancellation has started.
    pub fn checkpoint(&self) -> JitResult<()> {
        if self.is_cancelled() {
            return Err(JitError::Cancelled);
        }
        Ok(())
    }

    /// Blocking receive that returns early when the invocation is cancelled.
    pub fn recv<T>(&self, rx: &Receiver<T>) -> JitResult<T> {
        let Some(token) = &self.cancellation else {
            return rx.recv().map_err(|_| self.fail("channel disconnected"));
        };
        self.checkpoint()?;
        select! {
            recv(rx) -> msg => msg.map_err(|_| self.fail("channel disconnected")),
            recv(token.closed()) -> _ => Err(JitError::Cancelled),
        }
    }

    /// Kernel failure tagged with the current call chain.
    pub fn fail(&self, message: impl Into<String>) -> JitError {
        JitError::Execution {
            call_chain: self.stack.clone(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::jit::cancellation::CancellationManager;
    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;
    use polytrace_types::DType;

    #[test]
    fn enter_builds_the_call_chain() {
        let root = ExecutionContext::new();
        let inner = root.enter("fn").enter("fn2");
        assert_eq!(inner.call_chain(), ["fn".to_string(), "fn2".to_string()]);
        assert!(root.call_chain().is_empty());
        let err = inner.fail("boom");
        assert!(err.to_string().contains("fn -> fn2"));
    }

    #[test]
    fn recv_returns_queued_values() {
        let (tx, rx) = unbounded();
        tx.send(3).unwrap();
        let ctx = ExecutionContext::with_cancellation(CancellationManager::new().token());
        assert_eq!(ctx.recv(&rx).unwrap(), 3);
    }

    #[test]
    fn recv_observes_cancellation() {
        let manager = CancellationManager::new();
        let ctx = ExecutionContext::with_cancellation(manager.token());
        let (_tx, rx) = unbounded::<i32>();
        manager.start_cancel();
        assert!(ctx.recv(&rx).unwrap_err().is_cancelled());
        assert!(ctx.checkpoint().is_err());
    }

    #[test]
    fn exit_callbacks_run_on_drop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let mut outer = TraceContext::new("outer", Arc::new(CaptureRegistry::new()), 0);
            let l = Arc::clone(&log);
            outer.add_exit_callback(move || l.lock().push("outer"));
            {
                let mut inner = TraceContext::new("inner", Arc::new(CaptureRegistry::new()), 0);
                let l = Arc::clone(&log);
                inner.add_exit_callback(move || l.lock().push("inner"));
            }
        }
        assert_eq!(*log.lock(), vec!["inner", "outer"]);
    }

    #[test]
    fn keyed_deferred_capture_is_reused() -> JitResult<()> {
        let registry = Arc::new(CaptureRegistry::new());
        let mut ctx = TraceContext::new("f", Arc::clone(&registry), 1);
        let spec = Value::Spec(TypeSpec::tensor(DType::Float32, polytrace_types::TensorShape::unknown()));
        let first = ctx.capture_call_time_value(Some(1u64.into()), spec.clone(), || Value::Float(2.0))?;
        let second = ctx.capture_call_time_value(Some(1u64.into()), spec, || {
            panic!("second resolver must not run")
        })?;
        assert_eq!(first, second);
        assert_eq!(ctx.take_captures().len(), 1);
        assert_eq!(registry.len(), 1);
        ctx.commit();
        drop(ctx);
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn uncommitted_traces_drop_their_resolvers() -> JitResult<()> {
        let registry = Arc::new(CaptureRegistry::new());
        let spec = Value::Spec(TypeSpec::tensor(DType::Float32, polytrace_types::TensorShape::scalar()));
        {
            let mut ctx = TraceContext::new("f", Arc::clone(&registry), 0);
            ctx.capture_call_time_value(Some("k".into()), spec.clone(), || Value::Float(1.0))?;
            ctx.capture_side_input_by_ref("s", || Value::Int(1))?;
            assert_eq!(registry.len(), 2);
        }
        assert!(registry.is_empty());
        assert!(registry.side_input_types("f")?.is_empty());
        Ok(())
    }

    #[test]
    fn literal_side_inputs_are_returned_as_is() -> JitResult<()> {
        let registry = Arc::new(CaptureRegistry::new());
        let mut ctx = TraceContext::new("f", Arc::clone(&registry), 2);
        let value = ctx.capture_side_input_by_ref("s", || {
            Value::list([Value::Int(4), Value::Tensor(Tensor::scalar(DType::Int32, 1.0))])
        })?;
        match value {
            Value::List(items) => {
                assert_eq!(items[0], Value::Int(4));
                assert_eq!(items[1].as_placeholder().map(|p| p.index), Some(2));
            }
            other => panic!("unexpected side input {other}"),
        }
        assert_eq!(ctx.take_captures().len(), 1);

        let mut nested = TraceContext::new("g", registry, 0).with_depth(1);
        let err = nested.capture_side_input_by_ref("t", || Value::Int(1)).unwrap_err();
        assert!(err.to_string().contains("inner nested functions is not supported"));
        Ok(())
    }
}
