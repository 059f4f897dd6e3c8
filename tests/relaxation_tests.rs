use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use polytrace::runtime::jit::{Function, FunctionBuilder, Param, TraceType, TracedGraph};
use polytrace_types::{Composite, DType, Kwargs, Tensor, TensorShape, TypeSpec, Value};

fn reduce_sum(name: &str, traces: Arc<AtomicUsize>) -> FunctionBuilder {
    Function::builder(name)
        .param(Param::positional("x"))
        .trace_fn(move |_ctx, args| {
            traces.fetch_add(1, Ordering::SeqCst);
            let x = args.placeholder("x")?.clone();
            Ok(TracedGraph::new(
                Value::Spec(TypeSpec::tensor(x.spec.dtype(), TensorShape::scalar())),
                move |_ctx, inputs| Ok(vec![inputs[x.index].sum()]),
            ))
        })
}

fn ones(shape: &[usize]) -> Value {
    let len = shape.iter().product();
    Value::Tensor(Tensor::new(DType::Float32, shape.to_vec(), vec![1.0; len]).unwrap_or_else(|e| panic!("{e}")))
}

fn call(f: &Function, shape: &[usize]) -> Result<f64> {
    let out = f.call(&[ones(shape)], &Kwargs::new())?;
    Ok(out.as_f64().unwrap_or(f64::NAN))
}

#[test]
fn second_distinct_shape_relaxes() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = reduce_sum("sum", Arc::clone(&traces)).build()?;

    assert_eq!(call(&f, &[1])?, 1.0);
    assert_eq!(call(&f, &[2])?, 2.0);
    assert_eq!(call(&f, &[3])?, 3.0);
    assert_eq!(call(&f, &[7])?, 7.0);

    assert_eq!(traces.load(Ordering::SeqCst), 2);
    let metrics = f.metrics();
    assert_eq!(metrics.relaxations, 1);

    let relaxed = f.relaxed_keys();
    assert_eq!(relaxed.len(), 1);
    match &relaxed[0].entries()[0].trace_type {
        TraceType::Spec(spec) => assert_eq!(spec.shape(), &TensorShape::unknown_dims(1)),
        other => panic!("expected a spec, got {other}"),
    }
    Ok(())
}

#[test]
fn relaxed_key_supersedes_narrow_entries() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = reduce_sum("sum", Arc::clone(&traces)).build()?;
    call(&f, &[1])?;
    call(&f, &[2])?;
    let entries = f.cached_entries();
    let narrow_calls_before = entries[0].metadata.call_count();

    call(&f, &[1])?;
    assert_eq!(traces.load(Ordering::SeqCst), 2);
    assert_eq!(f.concrete_functions().len(), 2);
    assert_eq!(entries[0].metadata.call_count(), narrow_calls_before);
    assert_eq!(entries[1].metadata.call_count(), 2);
    Ok(())
}

#[test]
fn rank_changes_never_relax() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = reduce_sum("sum", Arc::clone(&traces)).build()?;

    call(&f, &[1])?;
    call(&f, &[1, 1])?;
    call(&f, &[1, 1, 1])?;
    assert_eq!(traces.load(Ordering::SeqCst), 3);
    assert!(f.relaxed_keys().is_empty());

    // Each rank keeps its own history.
    assert_eq!(call(&f, &[2, 2])?, 4.0);
    assert_eq!(call(&f, &[3, 1])?, 3.0);
    assert_eq!(traces.load(Ordering::SeqCst), 4);
    assert_eq!(f.metrics().relaxations, 1);
    Ok(())
}

#[test]
fn relaxation_can_be_disabled() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = reduce_sum("sum", Arc::clone(&traces))
        .reduce_retracing(false)
        .build()?;
    for n in 1..=4 {
        call(&f, &[n])?;
    }
    assert_eq!(traces.load(Ordering::SeqCst), 4);
    assert_eq!(f.metrics().relaxations, 0);
    Ok(())
}

#[test]
fn threshold_is_tunable() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = reduce_sum("sum", Arc::clone(&traces))
        .relaxation_threshold(3)
        .build()?;
    call(&f, &[1])?;
    call(&f, &[2])?;
    assert_eq!(traces.load(Ordering::SeqCst), 2);
    assert!(f.relaxed_keys().is_empty());

    call(&f, &[3])?;
    call(&f, &[4])?;
    call(&f, &[5])?;
    assert_eq!(traces.load(Ordering::SeqCst), 3);
    assert_eq!(f.relaxed_keys().len(), 1);
    Ok(())
}

#[test]
fn equal_dimensions_are_kept_when_relaxing() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = reduce_sum("sum", Arc::clone(&traces)).build()?;
    call(&f, &[1, 4])?;
    call(&f, &[2, 4])?;
    let relaxed = f.relaxed_keys();
    match &relaxed[0].entries()[0].trace_type {
        TraceType::Spec(spec) => {
            assert_eq!(spec.shape(), &TensorShape::new(vec![None, Some(4)]));
        }
        other => panic!("expected a spec, got {other}"),
    }

    call(&f, &[9, 4])?;
    assert_eq!(traces.load(Ordering::SeqCst), 2);
    // A different trailing dimension widens the group further.
    call(&f, &[9, 5])?;
    assert_eq!(traces.load(Ordering::SeqCst), 3);
    call(&f, &[1, 6])?;
    assert_eq!(traces.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn ragged_value_counts_do_not_retrace() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&traces);
    let f = Function::builder("ragged_sum")
        .param(Param::positional("rt"))
        .trace_fn(move |_ctx, args| {
            counter.fetch_add(1, Ordering::SeqCst);
            let rt = args.placeholder("rt")?.clone();
            Ok(TracedGraph::new(
                Value::Spec(TypeSpec::tensor(rt.spec.dtype(), TensorShape::scalar())),
                move |_ctx, inputs| Ok(vec![inputs[rt.index].sum()]),
            ))
        })
        .build()?;

    let a = Composite::ragged(DType::Int32, vec![vec![1.0, 2.0], vec![3.0]]);
    let b = Composite::ragged(DType::Int32, vec![vec![1.0], vec![2.0, 3.0, 4.0, 5.0]]);
    let out_a = f.call(&[Value::Composite(a)], &Kwargs::new())?;
    let out_b = f.call(&[Value::Composite(b)], &Kwargs::new())?;
    assert_eq!(out_a.as_f64(), Some(6.0));
    assert_eq!(out_b.as_f64(), Some(15.0));
    assert_eq!(traces.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn traced_relaxed_key_is_reused_instead_of_retraced() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = reduce_sum("sum", Arc::clone(&traces)).build()?;
    let any_vector = Value::Spec(TypeSpec::tensor(DType::Float32, TensorShape::unknown_dims(1)));
    f.get_concrete_function(&[any_vector], &Kwargs::new())?;

    assert_eq!(call(&f, &[3])?, 3.0);
    assert_eq!(call(&f, &[5])?, 5.0);

    assert_eq!(traces.load(Ordering::SeqCst), 1);
    assert_eq!(f.concrete_functions().len(), 1);
    let metrics = f.metrics();
    assert_eq!(metrics.traces, 1);
    assert_eq!(metrics.relaxations, 1);
    assert_eq!(f.relaxed_keys().len(), 1);
    Ok(())
}
