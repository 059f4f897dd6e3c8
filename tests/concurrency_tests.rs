use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use polytrace::runtime::jit::{Function, Param, TracedGraph};
use polytrace_types::{DType, Kwargs, Tensor, Value};
use rayon::prelude::*;

fn slow_identity(traces: Arc<AtomicUsize>) -> Result<Function> {
    Ok(Function::builder("slow_identity")
        .param(Param::positional("x"))
        .trace_fn(move |_ctx, args| {
            traces.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            let x = args.placeholder("x")?.clone();
            Ok(TracedGraph::new(Value::Spec(x.spec), move |_ctx, inputs| {
                Ok(vec![inputs[x.index].clone()])
            }))
        })
        .build()?)
}

#[test]
fn concurrent_first_calls_trace_once() -> Result<()> {
    const THREADS: usize = 100;
    let traces = Arc::new(AtomicUsize::new(0));
    let f = slow_identity(Arc::clone(&traces))?;
    let barrier = Barrier::new(THREADS);

    let outputs = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let f = &f;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let input = Value::Tensor(Tensor::scalar(DType::Float32, i as f64));
                    f.call(&[input], &Kwargs::new())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow::anyhow!("caller panicked")))
            .collect::<Result<Vec<_>>>()
    })?;

    for (i, out) in outputs.into_iter().enumerate() {
        assert_eq!(out?, Value::Tensor(Tensor::scalar(DType::Float32, i as f64)));
    }
    assert_eq!(traces.load(Ordering::SeqCst), 1);
    assert_eq!(f.concrete_functions().len(), 1);
    let metrics = f.metrics();
    assert_eq!(metrics.calls, THREADS as u64);
    assert_eq!(metrics.traces, 1);
    assert_eq!(metrics.cache_hits, THREADS as u64 - 1);
    Ok(())
}

#[test]
fn parallel_calls_with_two_dtypes_trace_twice() -> Result<()> {
    let traces = Arc::new(AtomicUsize::new(0));
    let f = slow_identity(Arc::clone(&traces))?;
    let pool = rayon::ThreadPoolBuilder::new().num_threads(16).build()?;

    pool.install(|| {
        (0..64).into_par_iter().try_for_each(|i| {
            let dtype = if i % 2 == 0 { DType::Float32 } else { DType::Int32 };
            let input = Value::Tensor(Tensor::scalar(dtype, i as f64));
            let out = f.call(&[input.clone()], &Kwargs::new())?;
            anyhow::ensure!(out == input, "call {i} returned {out}");
            Ok(())
        })
    })?;

    assert_eq!(traces.load(Ordering::SeqCst), 2);
    assert_eq!(f.concrete_functions().len(), 2);
    Ok(())
}
