use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Result;
use once_cell::sync::OnceCell;
use polytrace::runtime::jit::{Function, JitError, Param, Target, TracedGraph};
use polytrace_types::{kwargs, DType, Kwargs, Tensor, TensorShape, TypeSpec, Value};

fn scalar(v: f64) -> Value {
    Value::Tensor(Tensor::scalar(DType::Float32, v))
}

fn square(traces: Arc<AtomicUsize>) -> Result<Function> {
    Ok(Function::builder("square")
        .param(Param::positional("x"))
        .trace_fn(move |_ctx, args| {
            traces.fetch_add(1, Ordering::SeqCst);
            let x = args.placeholder("x")?.clone();
            let index = x.index;
            Ok(TracedGraph::new(Value::Spec(x.spec), move |_ctx, inputs| {
                Ok(vec![inputs[index].mul(&inputs[index])?])
            }))
        })
        .build()?)
}

#[test]
fn equal_structures_share_one_trace() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = square(Arc::clone(&traces))?;

    assert_eq!(f.call(&[scalar(3.0)], &Kwargs::new())?, scalar(9.0));
    assert_eq!(f.call(&[scalar(4.0)], &Kwargs::new())?, scalar(16.0));
    assert_eq!(f.call(&[], &kwargs([("x", scalar(5.0))]))?, scalar(25.0));

    assert_eq!(traces.load(Ordering::SeqCst), 1);
    assert_eq!(f.concrete_functions().len(), 1);
    let metrics = f.metrics();
    assert_eq!(metrics.calls, 3);
    assert_eq!(metrics.cache_hits, 2);
    assert_eq!(metrics.traces, 1);
    assert_eq!(f.cache_stats().total_calls, 3);
    Ok(())
}

#[test]
fn dtype_changes_retrace() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = square(Arc::clone(&traces))?;
    f.call(&[scalar(2.0)], &Kwargs::new())?;
    let out = f.call(&[Value::Tensor(Tensor::scalar(DType::Int32, 3.0))], &Kwargs::new())?;
    assert_eq!(out, Value::Tensor(Tensor::scalar(DType::Int32, 9.0)));
    assert_eq!(traces.load(Ordering::SeqCst), 2);
    Ok(())
}

fn scale() -> Result<Function> {
    Ok(Function::builder("scale")
        .params([Param::positional("x"), Param::positional("factor")])
        .trace_fn(|_ctx, args| {
            let x = args.placeholder("x")?.clone();
            let factor = args.get("factor").and_then(Value::as_f64).unwrap_or(1.0);
            Ok(TracedGraph::new(Value::Spec(x.spec), move |_ctx, inputs| {
                Ok(vec![inputs[x.index].map(|v| v * factor)])
            }))
        })
        .build()?)
}

#[test]
fn literal_arguments_key_by_value() -> Result<()> {
    let f = scale()?;
    assert_eq!(f.call(&[scalar(2.0), Value::Int(3)], &Kwargs::new())?, scalar(6.0));
    assert_eq!(f.call(&[scalar(2.0), Value::Int(4)], &Kwargs::new())?, scalar(8.0));
    assert_eq!(f.call(&[scalar(1.0), Value::Int(3)], &Kwargs::new())?, scalar(3.0));
    assert_eq!(f.concrete_functions().len(), 2);
    Ok(())
}

#[test]
fn type_hints_turn_literals_into_tensors() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&traces);
    let f = Function::builder("hinted")
        .param(Param::positional("x").tensor_hint(Some(DType::Float32)))
        .follow_type_hints(true)
        .trace_fn(move |_ctx, args| {
            counter.fetch_add(1, Ordering::SeqCst);
            let x = args.placeholder("x")?.clone();
            Ok(TracedGraph::new(Value::Spec(x.spec), move |_ctx, inputs| {
                Ok(vec![inputs[x.index].clone()])
            }))
        })
        .build()?;

    assert_eq!(f.call(&[Value::Int(1)], &Kwargs::new())?, scalar(1.0));
    assert_eq!(f.call(&[Value::Int(2)], &Kwargs::new())?, scalar(2.0));
    assert_eq!(traces.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn unhashable_arguments_are_rejected_before_tracing() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = square(Arc::clone(&traces))?;
    let err = f
        .call(&[Value::Set(vec![Value::Int(1)])], &Kwargs::new())
        .unwrap_err();
    assert!(matches!(err, JitError::UnhashableInput { .. }));
    assert!(err.to_string().contains("set"));
    assert_eq!(traces.load(Ordering::SeqCst), 0);
    assert!(f.concrete_functions().is_empty());
    Ok(())
}

#[test]
fn non_callable_targets_fail_at_build() {
    let err = Function::builder("f")
        .target(Target::Value(Value::Str("not a function".into())))
        .build()
        .unwrap_err();
    assert!(matches!(err, JitError::UncallableTarget { .. }));
}

#[test]
fn binding_errors_name_the_signature() -> Result<()> {
    let f = Function::builder("func")
        .params([Param::positional("x"), Param::positional("y")])
        .trace_fn(|_ctx, _args| Ok(TracedGraph::new(Value::None, |_ctx, _inputs| Ok(Vec::new()))))
        .build()?;

    let err = f.call(&[], &kwargs([("y", scalar(1.0))])).unwrap_err();
    assert_eq!(err.to_string(), "func(x, y) missing required arguments: x");

    let err = f
        .call(&[scalar(1.0), scalar(2.0), scalar(3.0)], &Kwargs::new())
        .unwrap_err();
    assert_eq!(err.to_string(), "func(x, y) takes 2 positional arguments, got 3");

    let err = f
        .call(&[scalar(1.0), scalar(2.0)], &kwargs([("c", scalar(3.0))]))
        .unwrap_err();
    assert_eq!(err.to_string(), "func(x, y) got unexpected keyword arguments: c");
    Ok(())
}

#[test]
fn trace_mutating_its_inputs_is_reported() -> Result<()> {
    let f = Function::builder("appender")
        .param(Param::positional("items"))
        .trace_fn(|_ctx, args| {
            if let Some(Value::List(items)) = args.get_mut("items") {
                items.push(Value::Int(1));
            }
            Ok(TracedGraph::new(Value::None, |_ctx, _inputs| Ok(Vec::new())))
        })
        .build()?;

    let err = f
        .call(&[Value::list([scalar(1.0)])], &Kwargs::new())
        .unwrap_err();
    assert!(matches!(err, JitError::MutationDetected { .. }));
    assert!(err.to_string().starts_with("appender() should not modify"));
    assert!(f.concrete_functions().is_empty());
    assert_eq!(f.metrics().failed_traces, 1);
    Ok(())
}

#[test]
fn exit_callbacks_run_once_per_trace() -> Result<()> {
    let exits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&exits);
    let f = Function::builder("f")
        .param(Param::positional("x"))
        .trace_fn(move |ctx, args| {
            let seen = Arc::clone(&seen);
            ctx.add_exit_callback(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            });
            let x = args.placeholder("x")?.clone();
            Ok(TracedGraph::new(Value::Spec(x.spec), move |_ctx, inputs| {
                Ok(vec![inputs[x.index].clone()])
            }))
        })
        .build()?;

    f.call(&[scalar(1.0)], &Kwargs::new())?;
    f.call(&[scalar(2.0)], &Kwargs::new())?;
    assert_eq!(exits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn failed_traces_leave_the_cache_untouched() -> Result<()> {
    let f = Function::builder("picky")
        .param(Param::positional("x"))
        .trace_fn(|ctx, args| {
            let x = args.placeholder("x")?.clone();
            if x.spec.shape().dims() == Some(&[Some(2), Some(2)][..]) {
                return Err(JitError::trace(ctx.function_name(), "2x2 inputs are not supported"));
            }
            Ok(TracedGraph::new(Value::Spec(x.spec), move |_ctx, inputs| {
                Ok(vec![inputs[x.index].clone()])
            }))
        })
        .build()?;

    let zeros = |shape: Vec<usize>| Value::Tensor(Tensor::zeros(DType::Float32, shape));
    f.call(&[zeros(vec![1])], &Kwargs::new())?;
    let err = f.call(&[zeros(vec![2, 2])], &Kwargs::new()).unwrap_err();
    assert!(err.to_string().contains("2x2 inputs are not supported"));
    assert_eq!(f.concrete_functions().len(), 1);

    // The failed 2x2 key is not in the history, so 3x3 is traced exactly.
    f.call(&[zeros(vec![3, 3])], &Kwargs::new())?;
    assert_eq!(f.concrete_functions().len(), 2);
    assert!(f.relaxed_keys().is_empty());
    assert_eq!(f.metrics().failed_traces, 1);
    Ok(())
}

#[test]
fn nested_failures_report_the_call_chain() -> Result<()> {
    let inner = Arc::new(
        Function::builder("fn2")
            .param(Param::positional("x"))
            .trace_fn(|_ctx, args| {
                let x = args.placeholder("x")?.clone();
                Ok(TracedGraph::new(Value::Spec(x.spec), |ctx, _inputs| {
                    Err(ctx.fail("kernel failed"))
                }))
            })
            .build()?,
    );

    let callee = Arc::clone(&inner);
    let outer = Function::builder("fn")
        .param(Param::positional("x"))
        .trace_fn(move |_ctx, args| {
            let x = args.placeholder("x")?.clone();
            let callee = Arc::clone(&callee);
            Ok(TracedGraph::new(Value::Spec(x.spec), move |ctx, inputs| {
                let out = callee.call_with_context(
                    ctx,
                    &[Value::Tensor(inputs[x.index].clone())],
                    &Kwargs::new(),
                )?;
                Ok(out.as_tensor().cloned().into_iter().collect())
            }))
        })
        .build()?;

    let err = outer.call(&[scalar(1.0)], &Kwargs::new()).unwrap_err();
    match &err {
        JitError::Execution { call_chain, .. } => assert_eq!(call_chain, &["fn", "fn2"]),
        other => panic!("expected execution error, got {other}"),
    }
    assert!(err.to_string().ends_with("Function call stack:\nfn -> fn2"));

    let err = inner.call(&[scalar(1.0)], &Kwargs::new()).unwrap_err();
    assert!(err.to_string().ends_with("Function call stack:\nfn2"));
    Ok(())
}

/// `factorial(n)` for a literal `n`; each trace calls the function again with `n - step`.
fn factorial(traces: Arc<AtomicUsize>, step: i64) -> Result<Arc<Function>> {
    let me: Arc<OnceCell<Weak<Function>>> = Arc::new(OnceCell::new());
    let handle = Arc::clone(&me);
    let f = Arc::new(
        Function::builder("factorial")
            .param(Param::positional("n"))
            .trace_fn(move |_ctx, args| {
                traces.fetch_add(1, Ordering::SeqCst);
                let n = args.get("n").and_then(Value::as_f64).unwrap_or_default();
                let value = if n <= 1.0 {
                    1.0
                } else {
                    let me = handle
                        .get()
                        .and_then(Weak::upgrade)
                        .ok_or_else(|| JitError::trace("factorial", "function dropped"))?;
                    let inner = me.call(&[Value::Int(n as i64 - step)], &Kwargs::new())?;
                    n * inner.as_f64().unwrap_or_default()
                };
                Ok(TracedGraph::new(
                    Value::Spec(TypeSpec::tensor(DType::Float32, TensorShape::scalar())),
                    move |_ctx, _inputs| Ok(vec![Tensor::scalar(DType::Float32, value)]),
                ))
            })
            .build()?,
    );
    let _ = me.set(Arc::downgrade(&f));
    Ok(f)
}

#[test]
fn traces_may_call_their_own_function() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = factorial(Arc::clone(&traces), 1)?;

    assert_eq!(f.call(&[Value::Int(4)], &Kwargs::new())?, scalar(24.0));
    assert_eq!(traces.load(Ordering::SeqCst), 4);
    assert_eq!(f.concrete_functions().len(), 4);

    assert_eq!(f.call(&[Value::Int(3)], &Kwargs::new())?, scalar(6.0));
    assert_eq!(traces.load(Ordering::SeqCst), 4);
    Ok(())
}

#[test]
fn recursing_on_the_key_being_traced_fails() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = factorial(Arc::clone(&traces), 0)?;

    let err = f.call(&[Value::Int(3)], &Kwargs::new()).unwrap_err();
    assert!(matches!(err, JitError::Trace { .. }));
    assert!(err.to_string().contains("recursive call with arguments"));
    assert_eq!(traces.load(Ordering::SeqCst), 1);
    assert!(f.concrete_functions().is_empty());
    assert_eq!(f.metrics().failed_traces, 2);

    // The failed attempt leaves nothing behind.
    assert_eq!(f.call(&[Value::Int(1)], &Kwargs::new())?, scalar(1.0));
    Ok(())
}
