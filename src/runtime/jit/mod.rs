// Polymorphic tracing runtime
pub mod binder;
pub mod cache;
pub mod cancellation;
pub mod capture;
pub mod concrete;
pub mod context;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod specialization;

pub use binder::{BoundArguments, FunctionSpec, Param, ParamHint, ParamKind};
pub use cancellation::{CancelableFunction, CancellationManager, CancellationToken};
pub use capture::{CaptureKey, CaptureRegistry};
pub use concrete::{CapturedInput, ConcreteFunction, ConcreteParam, FlatParam, Kernel};
pub use context::{ExecutionContext, TraceContext};
pub use engine::{Function, FunctionBuilder, Target, TraceArgs, Traceable, TracedGraph};
pub use error::{JitError, JitResult};
pub use metrics::DispatchMetricsSnapshot;
pub use specialization::{make_key, RelaxationState, SignatureKey, TraceType};
