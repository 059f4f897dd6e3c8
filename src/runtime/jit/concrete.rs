use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use polytrace_types::{nest, Composite, Kwargs, Placeholder, Tensor, TensorSpec, TypeSpec, Value};
use tracing::debug;

use crate::runtime::jit::binder::{BoundArguments, FunctionSpec, Param, ParamKind};
use crate::runtime::jit::capture::{CaptureKey, CaptureRegistry, CaptureSlot, Resolver};
use crate::runtime::jit::context::ExecutionContext;
use crate::runtime::jit::error::{JitError, JitResult};
use crate::runtime::jit::specialization::{Literal, SignatureKey, TraceType};

/// Replayable body of a traced function: flat tensors in, flat tensors out.
pub trait Kernel: Send + Sync {
    fn run(&self, ctx: &ExecutionContext, inputs: &[Tensor]) -> JitResult<Vec<Tensor>>;
}

impl<F> Kernel for F
where
    F: Fn(&ExecutionContext, &[Tensor]) -> JitResult<Vec<Tensor>> + Send + Sync,
{
    fn run(&self, ctx: &ExecutionContext, inputs: &[Tensor]) -> JitResult<Vec<Tensor>> {
        self(ctx, inputs)
    }
}

/// One traced parameter in canonical order.
///
/// A parameter bound through an input signature's defaults is hidden: it does not
/// appear in the structured signature and always takes `hidden_value`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcreteParam {
    pub name: String,
    pub kind: ParamKind,
    pub trace_type: TraceType,
    pub hidden_value: Option<Value>,
}

impl ConcreteParam {
    pub fn is_visible(&self) -> bool {
        self.hidden_value.is_none()
    }
}

/// One position of the flat calling convention.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatParam {
    pub name: String,
    pub spec: TensorSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapturedInput {
    Value(Tensor),
    Deferred(CaptureKey),
}

pub(crate) struct ConcreteParts {
    pub name: String,
    pub key: SignatureKey,
    pub params: Vec<ConcreteParam>,
    pub flat_params: Vec<FlatParam>,
    pub outputs: Value,
    pub kernel: Arc<dyn Kernel>,
    pub captures: Vec<CaptureSlot>,
    pub registry: Arc<CaptureRegistry>,
}

/// A traced, executable specialization of a polymorphic function.
pub struct ConcreteFunction {
    name: String,
    key: SignatureKey,
    params: Vec<ConcreteParam>,
    structured: FunctionSpec,
    signature: String,
    flat: FunctionSpec,
    flat_params: Vec<FlatParam>,
    outputs: Value,
    output_type: TraceType,
    output_len: usize,
    kernel: Arc<dyn Kernel>,
    captures: RwLock<Vec<CaptureSlot>>,
    registry: Arc<CaptureRegistry>,
    structured_enabled: AtomicBool,
}

impl ConcreteFunction {
    pub(crate) fn new(parts: ConcreteParts) -> JitResult<Self> {
        let output_type = TraceType::from_value(&parts.outputs, "output").map_err(|u| {
            JitError::trace(
                &parts.name,
                format!("{} returned an unsupported value of type {}", u.path, u.type_name),
            )
        })?;
        let output_len = nest::flatten(&parts.outputs)
            .into_iter()
            .filter_map(|leaf| match leaf {
                Value::Placeholder(Placeholder { spec, .. }) | Value::Spec(spec) => {
                    Some(spec.flat_len())
                }
                _ => None,
            })
            .sum();

        let structured = FunctionSpec::new(
            parts.name.clone(),
            parts
                .params
                .iter()
                .filter(|p| p.is_visible())
                .map(|p| {
                    let param = match p.kind {
                        ParamKind::PositionalOrKeyword | ParamKind::VarPositional => {
                            Param::positional(&p.name)
                        }
                        ParamKind::KeywordOnly | ParamKind::VarKeyword => {
                            Param::keyword_only(&p.name)
                        }
                    };
                    match &p.trace_type {
                        TraceType::Literal(lit) => param.with_default(lit.to_value()),
                        _ => param,
                    }
                })
                .collect(),
        );
        let flat = FunctionSpec::new(
            parts.name.clone(),
            parts
                .flat_params
                .iter()
                .map(|p| Param::positional(&p.name))
                .collect(),
        );

        Ok(Self {
            signature: structured.signature(),
            name: parts.name,
            key: parts.key,
            params: parts.params,
            structured,
            flat,
            flat_params: parts.flat_params,
            outputs: parts.outputs,
            output_type,
            output_len,
            kernel: parts.kernel,
            captures: RwLock::new(parts.captures),
            registry: parts.registry,
            structured_enabled: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The key this function was traced for (exact or relaxed).
    pub fn key(&self) -> &SignatureKey {
        &self.key
    }

    pub fn params(&self) -> &[ConcreteParam] {
        &self.params
    }

    pub fn flat_params(&self) -> &[FlatParam] {
        &self.flat_params
    }

    pub fn output_type(&self) -> &TraceType {
        &self.output_type
    }

    /// `name(x, y)` as used in binding diagnostics.
    pub fn structured_signature(&self) -> &str {
        &self.signature
    }

    /// `name(x, y, c, c_1)`: one tensor per position.
    pub fn flat_signature(&self) -> String {
        self.flat.signature()
    }

    /// Restricts calls to the flat convention.
    pub fn disable_structured_signature(&self) {
        self.structured_enabled.store(false, Ordering::Release);
    }

    pub fn captured_inputs(&self) -> Vec<CapturedInput> {
        self.captures
            .read()
            .iter()
            .map(|slot| match slot {
                CaptureSlot::Value(t) => CapturedInput::Value(t.clone()),
                CaptureSlot::Deferred { key, .. } => CapturedInput::Deferred(key.clone()),
            })
            .collect()
    }

    pub fn call(&self, args: &[Value], kwargs: &Kwargs) -> JitResult<Value> {
        self.call_with_context(&ExecutionContext::new(), args, kwargs)
    }

    /// Calls with either convention. The structured one is tried first; when both
    /// fail, the structured error is reported.
    pub fn call_with_context(
        &self,
        ctx: &ExecutionContext,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> JitResult<Value> {
        let inputs = if self.structured_enabled.load(Ordering::Acquire) {
            match self.bind_structured(args, kwargs) {
                Ok(inputs) => inputs,
                Err(structured_err) => match self.bind_flat(args, kwargs) {
                    Ok(inputs) => inputs,
                    Err(_) => return Err(structured_err),
                },
            }
        } else {
            self.bind_flat(args, kwargs)?
        };
        self.run(&ctx.enter(&self.name), inputs)
    }

    /// Executes with arguments already bound against the polymorphic signature.
    pub(crate) fn invoke_bound(
        &self,
        ctx: &ExecutionContext,
        bound: &BoundArguments,
    ) -> JitResult<Value> {
        let mut inputs = Vec::with_capacity(self.flat_params.len());
        for (param, arg) in self.params.iter().zip(bound.entries()) {
            self.flatten_argument(&param.name, &param.trace_type, &arg.value, &mut inputs)?;
        }
        self.run(ctx, inputs)
    }

    fn bind_structured(&self, args: &[Value], kwargs: &Kwargs) -> JitResult<Vec<Tensor>> {
        let bound = self.structured.bind(args, kwargs)?;
        let mut inputs = Vec::with_capacity(self.flat_params.len());
        let mut bound_values = bound.entries().iter();
        for param in &self.params {
            let value = match &param.hidden_value {
                Some(hidden) => hidden,
                None => match bound_values.next() {
                    Some(arg) => &arg.value,
                    None => break,
                },
            };
            self.flatten_argument(&param.name, &param.trace_type, value, &mut inputs)?;
        }
        Ok(inputs)
    }

    fn bind_flat(&self, args: &[Value], kwargs: &Kwargs) -> JitResult<Vec<Tensor>> {
        let bound = self.flat.bind(args, kwargs)?;
        bound
            .entries()
            .iter()
            .zip(&self.flat_params)
            .enumerate()
            .map(|(i, (arg, param))| match &arg.value {
                Value::Tensor(t) if param.spec.accepts(t.dtype(), t.shape()) => Ok(t.clone()),
                Value::Tensor(t) => Err(self.flat_mismatch(format!(
                    "expected argument #{i}(zero-based) to be {}; got {}",
                    param.spec,
                    t.spec()
                ))),
                other => Err(self.flat_mismatch(format!(
                    "expected argument #{i}(zero-based) to be a Tensor; got {} ({other})",
                    other.type_name()
                ))),
            })
            .collect()
    }

    fn flat_mismatch(&self, detail: String) -> JitError {
        JitError::ArgumentTypeMismatch {
            signature: self.flat.signature(),
            detail: format!(": {detail}"),
        }
    }

    fn flatten_argument(
        &self,
        name: &str,
        expected: &TraceType,
        value: &Value,
        out: &mut Vec<Tensor>,
    ) -> JitResult<()> {
        let incorrect_type = || JitError::ArgumentTypeMismatch {
            signature: self.signature.clone(),
            detail: format!(
                ": argument {name} had incorrect type\n  expected: {}\n       got: {}",
                expected.type_summary(),
                value_summary(value)
            ),
        };
        match (expected, value) {
            (TraceType::Literal(lit), value) => {
                if Literal::from_value(value).as_ref() == Some(lit) {
                    return Ok(());
                }
                Err(JitError::ArgumentTypeMismatch {
                    signature: format!("ConcreteFunction {}", self.signature),
                    detail: format!(
                        " was constructed with {} in {name}, but was called with {}",
                        lit.to_value().describe(),
                        value.describe()
                    ),
                })
            }
            (TraceType::Spec(TypeSpec::Tensor(want)), Value::Tensor(t)) => {
                if !want.accepts(t.dtype(), t.shape()) {
                    return Err(JitError::ArgumentTypeMismatch {
                        signature: self.signature.clone(),
                        detail: format!(
                            ": argument {name} had incorrect type\n  expected: {want}\n       got: {}",
                            t.spec()
                        ),
                    });
                }
                out.push(t.clone());
                Ok(())
            }
            (TraceType::Spec(TypeSpec::Tensor(_)), value) if value.is_literal() => {
                Err(JitError::ArgumentTypeMismatch {
                    signature: self.signature.clone(),
                    detail: format!(" expected a Tensor in {name}, but got {}", value.describe()),
                })
            }
            (TraceType::Spec(TypeSpec::Composite(want)), Value::Composite(c))
                if c.spec().is_subtype_of(want) =>
            {
                out.extend(c.components().iter().cloned());
                Ok(())
            }
            (TraceType::List(types), Value::List(values))
            | (TraceType::Tuple(types), Value::Tuple(values))
                if types.len() == values.len() =>
            {
                for (ty, v) in types.iter().zip(values) {
                    self.flatten_argument(name, ty, v, out)?;
                }
                Ok(())
            }
            (TraceType::Dict(types), Value::Dict(values))
                if types.len() == values.len()
                    && types.iter().map(|(k, _)| k).eq(values.keys()) =>
            {
                for ((_, ty), v) in types.iter().zip(values.values()) {
                    self.flatten_argument(name, ty, v, out)?;
                }
                Ok(())
            }
            _ => Err(incorrect_type()),
        }
    }

    fn run(&self, ctx: &ExecutionContext, mut inputs: Vec<Tensor>) -> JitResult<Value> {
        ctx.checkpoint()?;
        let slots = self.captures.read().clone();
        for slot in &slots {
            match slot {
                CaptureSlot::Value(t) => inputs.push(t.clone()),
                CaptureSlot::Deferred { key, spec } => {
                    inputs.extend(self.registry.resolve(key, spec)?);
                }
            }
        }
        let produced = self.kernel.run(ctx, &inputs)?;
        self.pack_outputs(ctx, produced)
    }

    fn pack_outputs(&self, ctx: &ExecutionContext, produced: Vec<Tensor>) -> JitResult<Value> {
        if produced.len() != self.output_len {
            return Err(ctx.fail(format!(
                "{} produced {} output tensors, expected {}",
                self.name,
                produced.len(),
                self.output_len
            )));
        }
        let mut produced = produced.into_iter();
        nest::map_leaves(&self.outputs, &mut |leaf| match leaf {
            Value::Placeholder(Placeholder { spec, .. }) | Value::Spec(spec) => {
                take_output(ctx, spec, &mut produced)
            }
            other => Ok(other.clone()),
        })
    }

    /// Swaps the by-value capture at `index` for a resolver run before every call.
    ///
    /// `spec` must agree with the captured tensor in one direction of the subtype
    /// relation.
    pub fn replace_capture_with_deferred_capture<F>(
        &self,
        index: usize,
        spec: TypeSpec,
        resolver: F,
    ) -> JitResult<CaptureKey>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let mut captures = self.captures.write();
        let available = captures.len();
        let Some(slot) = captures.get_mut(index) else {
            return Err(JitError::UnknownCapture {
                function: self.name.clone(),
                index,
                available,
            });
        };
        let original = match slot {
            CaptureSlot::Value(t) => TypeSpec::Tensor(t.spec()),
            CaptureSlot::Deferred { key, .. } => {
                return Err(JitError::DeferredCaptureType {
                    key: key.to_string(),
                    detail: format!("capture {index} of {} is already deferred", self.name),
                });
            }
        };
        let candidate = spec.unnamed();
        if !candidate.is_subtype_of(&original) && !original.is_subtype_of(&candidate) {
            return Err(JitError::Trace {
                function: self.name.clone(),
                message: format!(
                    "Attempting to substitute closure with spec {candidate} that's \
                     incompatible with the original capture {original}"
                ),
            });
        }
        let key = CaptureKey::unique();
        let spec = Value::Spec(candidate);
        let resolver: Resolver = Arc::new(resolver);
        self.registry.insert(key.clone(), spec.clone(), resolver);
        *slot = CaptureSlot::Deferred {
            key: key.clone(),
            spec,
        };
        debug!(function = %self.name, index, key = %key, "capture replaced with deferred capture");
        Ok(key)
    }

    /// `func(x, kangaroo, octopus=7)`; the verbose form adds `Args:` and `Returns:`.
    pub fn pretty_printed_signature(&self, verbose: bool) -> String {
        let summary = self.structured.summary();
        if !verbose {
            return summary;
        }
        let mut lines = vec![summary, "  Args:".to_string()];
        let mut any_args = false;
        for param in self.params.iter().filter(|p| p.is_visible()) {
            if param.trace_type.specs().is_empty() {
                continue;
            }
            any_args = true;
            describe_nest(&mut lines, &param.name, &param.trace_type);
        }
        if !any_args {
            lines.pop();
        }
        lines.push("  Returns:".to_string());
        match &self.output_type {
            TraceType::Spec(spec) => lines.push(format!("    {spec}")),
            other => {
                let mut refs = Vec::new();
                let rendered = render_with_refs(other, &mut refs);
                lines.push(format!("    {rendered}"));
                push_refs(&mut lines, &refs);
            }
        }
        lines.join("\n")
    }
}

fn take_output(
    ctx: &ExecutionContext,
    spec: &TypeSpec,
    produced: &mut std::vec::IntoIter<Tensor>,
) -> JitResult<Value> {
    match spec {
        TypeSpec::Tensor(want) => {
            let tensor = produced
                .next()
                .ok_or_else(|| ctx.fail("kernel produced too few outputs"))?;
            if !want.accepts(tensor.dtype(), tensor.shape()) {
                return Err(ctx.fail(format!(
                    "kernel output {} does not match the traced output type {want}",
                    tensor.spec()
                )));
            }
            Ok(Value::Tensor(tensor))
        }
        TypeSpec::Composite(want) => {
            let components: Vec<Tensor> = produced.by_ref().take(want.components.len()).collect();
            Ok(Value::Composite(Composite::new(want.clone(), components)?))
        }
    }
}

fn describe_nest(lines: &mut Vec<String>, name: &str, ty: &TraceType) {
    match ty {
        TraceType::Spec(spec) => lines.push(format!("    {name}: {spec}")),
        other => {
            let mut refs = Vec::new();
            let rendered = render_with_refs(other, &mut refs);
            lines.push(format!("    {name}: {rendered}"));
            push_refs(lines, &refs);
        }
    }
}

fn push_refs(lines: &mut Vec<String>, refs: &[&TypeSpec]) {
    for (i, spec) in refs.iter().enumerate() {
        lines.push(format!("      <{}>: {spec}", i + 1));
    }
}

/// Renders a nest with each spec leaf replaced by `<n>`, numbered from 1.
fn render_with_refs<'a>(ty: &'a TraceType, refs: &mut Vec<&'a TypeSpec>) -> String {
    match ty {
        TraceType::Literal(lit) => lit.to_string(),
        TraceType::Spec(spec) => {
            refs.push(spec);
            format!("<{}>", refs.len())
        }
        TraceType::List(items) => {
            let parts: Vec<String> = items.iter().map(|i| render_with_refs(i, refs)).collect();
            format!("[{}]", parts.join(", "))
        }
        TraceType::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(|i| render_with_refs(i, refs)).collect();
            if parts.len() == 1 {
                format!("({},)", parts[0])
            } else {
                format!("({})", parts.join(", "))
            }
        }
        TraceType::Dict(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|(k, v)| format!("'{k}': {}", render_with_refs(v, refs)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}

/// Structural summary of a call-time value, matching [`TraceType::type_summary`].
fn value_summary(value: &Value) -> String {
    match value {
        Value::List(items) => format!("[{}]", join_values(items)),
        Value::Tuple(items) if items.len() == 1 => format!("({},)", join_values(items)),
        Value::Tuple(items) => format!("({})", join_values(items)),
        Value::Dict(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("'{k}': {}", value_summary(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        other => other.type_name().to_string(),
    }
}

fn join_values(items: &[Value]) -> String {
    items.iter().map(value_summary).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for ConcreteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verbose = self.pretty_printed_signature(true);
        let (summary, details) = verbose.split_once('\n').unwrap_or((verbose.as_str(), ""));
        write!(f, "ConcreteFunction {summary}\n{details}")
    }
}

impl fmt::Debug for ConcreteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<ConcreteFunction {} at {:p}>",
            self.pretty_printed_signature(false),
            self
        )
    }
}
