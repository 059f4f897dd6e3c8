use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use polytrace_types::{DType, Kwargs, Tensor, TensorShape, TensorSpec, TypeSpec, Value};
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::config::JitConfig;
use crate::runtime::jit::{
    DispatchMetricsSnapshot, Function, JitResult, Param, TraceArgs, TraceContext, TracedGraph,
};
use polytrace_utils::logger;

#[derive(Parser, Debug)]
#[command(name = "polytrace", version, about = "Polymorphic function tracing toolkit")]
pub struct PolytraceCli {
    #[arg(long, global = true)]
    /// Print machine readable JSON instead of a report.
    json: bool,

    #[command(subcommand)]
    command: Command,
}

impl PolytraceCli {
    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Calls a reduction with tensors of the given shapes and reports retracing.
    Relax {
        /// Shapes such as `3`, `2x4` or `scalar`.
        shapes: Vec<String>,
        #[arg(long)]
        threshold: Option<usize>,
        /// Disable shape relaxation.
        #[arg(long)]
        no_relax: bool,
    },
    /// Traces a function for the given parameters and prints its signature.
    Signature {
        name: String,
        /// `x:int32[]`, `v:float32[2,None]` for tensors or `octopus=7` for bound literals.
        params: Vec<String>,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Makes many concurrent first calls and reports how many traces happened.
    Stress {
        #[arg(short, long, default_value_t = 100)]
        threads: usize,
    },
}

pub fn run() -> Result<()> {
    logger::init_logging();
    let cli = PolytraceCli::parse();
    match &cli.command {
        Command::Relax {
            shapes,
            threshold,
            no_relax,
        } => handle_relax(&cli, shapes, *threshold, *no_relax),
        Command::Signature {
            name,
            params,
            verbose,
        } => handle_signature(&cli, name, params, *verbose),
        Command::Stress { threads } => handle_stress(&cli, *threads),
    }
}

fn reduce_sum(ctx: &mut TraceContext, args: &mut TraceArgs) -> JitResult<TracedGraph> {
    let x = args.placeholder("x")?;
    let index = x.index;
    let dtype = x.spec.dtype();
    debug!(function = ctx.function_name(), spec = %x.spec, "tracing reduction");
    Ok(TracedGraph::new(
        Value::Spec(TypeSpec::tensor(dtype, TensorShape::scalar())),
        move |ctx, inputs| {
            let input = inputs
                .get(index)
                .ok_or_else(|| ctx.fail("missing input tensor"))?;
            Ok(vec![input.sum()])
        },
    ))
}

fn reduction(config: JitConfig) -> Result<Function> {
    Function::builder("reduce_sum")
        .param(Param::positional("x"))
        .config(config)
        .trace_fn(reduce_sum)
        .build()
        .context("failed to build reduction")
}

#[derive(Serialize)]
struct RelaxReport {
    calls: Vec<RelaxStep>,
    concrete_functions: usize,
    metrics: DispatchMetricsSnapshot,
}

#[derive(Serialize)]
struct RelaxStep {
    shape: Vec<usize>,
    traced: bool,
    key: String,
}

fn handle_relax(
    cli: &PolytraceCli,
    shapes: &[String],
    threshold: Option<usize>,
    no_relax: bool,
) -> Result<()> {
    if shapes.is_empty() {
        bail!("at least one shape is required");
    }
    let mut config = JitConfig::global().clone();
    config.reduce_retracing = !no_relax;
    if let Some(threshold) = threshold {
        config.relaxation_threshold = threshold;
    }
    let function = reduction(config)?;

    let mut calls = Vec::with_capacity(shapes.len());
    for raw in shapes {
        let shape = parse_shape(raw)?;
        let before = function.metrics().traces;
        let input = Tensor::zeros(DType::Float32, shape.clone());
        function
            .call(&[Value::Tensor(input)], &Kwargs::new())
            .with_context(|| format!("call with shape {raw} failed"))?;
        let traced = function.metrics().traces > before;
        let key = function
            .concrete_functions()
            .last()
            .map(|f| f.key().to_string())
            .unwrap_or_default();
        calls.push(RelaxStep { shape, traced, key });
    }

    let report = RelaxReport {
        calls,
        concrete_functions: function.concrete_functions().len(),
        metrics: function.metrics(),
    };
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for step in &report.calls {
        let status = if step.traced {
            "traced".yellow().bold()
        } else {
            "cached".green().bold()
        };
        println!("{:>8} {:?}", status, step.shape);
    }
    println!(
        "{} {} concrete functions, {} relaxations",
        "done".bold(),
        report.concrete_functions,
        report.metrics.relaxations
    );
    Ok(())
}

fn handle_signature(cli: &PolytraceCli, name: &str, raw_params: &[String], verbose: bool) -> Result<()> {
    let mut params = Vec::with_capacity(raw_params.len());
    let mut args = Vec::with_capacity(raw_params.len());
    for raw in raw_params {
        let (param, arg) = parse_param(raw)?;
        params.push(Param::positional(param));
        args.push(arg);
    }
    let tensor_count = args.iter().filter(|a| matches!(a, Value::Spec(_))).count();
    let function = Function::builder(name)
        .params(params)
        .trace_fn(move |_ctx, _args| {
            Ok(TracedGraph::new(
                Value::Spec(TypeSpec::tensor(DType::Int32, TensorShape::scalar())),
                move |_ctx, inputs| {
                    Ok(vec![Tensor::scalar(DType::Int32, inputs.len().min(tensor_count) as f64)])
                },
            ))
        })
        .build()?;
    let concrete = function.get_concrete_function(&args, &Kwargs::new())?;
    let signature = concrete.pretty_printed_signature(verbose);
    if cli.json {
        println!("{}", serde_json::json!({ "signature": signature }));
    } else {
        println!("{signature}");
    }
    Ok(())
}

#[derive(Serialize)]
struct StressReport {
    threads: usize,
    concrete_functions: usize,
    elapsed_ms: f64,
    metrics: DispatchMetricsSnapshot,
}

fn handle_stress(cli: &PolytraceCli, threads: usize) -> Result<()> {
    let function = Arc::new(reduction(JitConfig::global().clone())?);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .context("failed to build thread pool")?;
    let start = Instant::now();
    pool.install(|| {
        (0..threads).into_par_iter().try_for_each(|i| {
            let input = Tensor::scalar(DType::Float32, i as f64);
            function
                .call(&[Value::Tensor(input)], &Kwargs::new())
                .map(|_| ())
        })
    })?;

    let report = StressReport {
        threads,
        concrete_functions: function.concrete_functions().len(),
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        metrics: function.metrics(),
    };
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} {} calls, {} concrete function(s) in {:.2} ms",
            "stress".bold(),
            report.threads,
            report.concrete_functions,
            report.elapsed_ms
        );
    }
    Ok(())
}

/// `3`, `2x4`, `scalar` or the empty string.
fn parse_shape(raw: &str) -> Result<Vec<usize>> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "scalar" {
        return Ok(Vec::new());
    }
    raw.split('x')
        .map(|dim| {
            dim.trim()
                .parse()
                .with_context(|| format!("invalid dimension `{dim}` in shape `{raw}`"))
        })
        .collect()
}

fn parse_param(raw: &str) -> Result<(String, Value)> {
    if let Some((name, literal)) = raw.split_once('=') {
        return Ok((name.to_string(), parse_literal(literal)));
    }
    let (name, spec) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("parameter `{raw}` needs `:dtype[dims]` or `=literal`"))?;
    let open = spec
        .find('[')
        .ok_or_else(|| anyhow!("spec `{spec}` is missing its `[dims]`"))?;
    let dtype: DType = spec[..open]
        .parse()
        .map_err(|e: String| anyhow!(e))
        .with_context(|| format!("invalid dtype in `{raw}`"))?;
    let dims = spec[open + 1..]
        .strip_suffix(']')
        .ok_or_else(|| anyhow!("spec `{spec}` is missing a closing `]`"))?;
    let shape = if dims.trim() == "?" {
        TensorShape::unknown()
    } else {
        TensorShape::new(
            dims.split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(|d| match d {
                    "None" => Ok(None),
                    other => other
                        .parse()
                        .map(Some)
                        .with_context(|| format!("invalid dimension `{other}`")),
                })
                .collect::<Result<Vec<_>>>()?,
        )
    };
    Ok((
        name.to_string(),
        Value::Spec(TypeSpec::Tensor(TensorSpec::new(dtype, shape))),
    ))
}

fn parse_literal(raw: &str) -> Value {
    match raw {
        "None" => Value::None,
        "True" | "true" => Value::Bool(true),
        "False" | "false" => Value::Bool(false),
        other => other
            .parse::<i64>()
            .map(Value::Int)
            .or_else(|_| other.parse::<f64>().map(Value::Float))
            .unwrap_or_else(|_| Value::Str(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_shapes() -> Result<()> {
        assert_eq!(parse_shape("2x4")?, vec![2, 4]);
        assert_eq!(parse_shape("scalar")?, Vec::<usize>::new());
        assert!(parse_shape("2xa").is_err());
        Ok(())
    }

    #[test]
    fn parses_params() -> Result<()> {
        let (name, value) = parse_param("v:float32[2,None]")?;
        assert_eq!(name, "v");
        assert_eq!(
            value,
            Value::Spec(TypeSpec::tensor(
                DType::Float32,
                TensorShape::new(vec![Some(2), None])
            ))
        );
        assert_eq!(parse_param("octopus=7")?.1, Value::Int(7));
        Ok(())
    }
}
