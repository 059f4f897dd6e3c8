use polytrace_types::TensorError;
use thiserror::Error;

pub type JitResult<T> = Result<T, JitError>;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("{target} is not callable; a traced function needs a callable target")]
    UncallableTarget { target: String },

    #[error(
        "{function}: argument {path} has type {type_name}, which cannot be hashed into a \
         signature key"
    )]
    UnhashableInput {
        function: String,
        path: String,
        type_name: String,
    },

    #[error("{function} was called with arguments incompatible with its input signature: {diff}")]
    SignatureMismatch { function: String, diff: String },

    #[error("invalid input signature for {function}: {reason}")]
    InvalidInputSignature { function: String, reason: String },

    #[error("{signature} missing required arguments: {}", missing.join(", "))]
    MissingRequiredArgs {
        signature: String,
        missing: Vec<String>,
    },

    #[error("{signature} takes {expected} positional arguments, got {got}")]
    TooManyPositionalArgs {
        signature: String,
        expected: usize,
        got: usize,
    },

    #[error(
        "{signature} got unexpected keyword arguments: {}{}",
        names.join(", "),
        suggestion.as_ref().map(|s| format!(" (did you mean `{s}`?)")).unwrap_or_default()
    )]
    UnexpectedKeywordArgs {
        signature: String,
        names: Vec<String>,
        suggestion: Option<String>,
    },

    #[error("{signature} got two values for '{name}'")]
    DuplicateArgument { signature: String, name: String },

    #[error("{signature}{detail}")]
    ArgumentTypeMismatch { signature: String, detail: String },

    #[error("deferred capture {key}: {detail}")]
    DeferredCaptureType { key: String, detail: String },

    #[error("{function} has {available} captured inputs, no capture at index {index}")]
    UnknownCapture {
        function: String,
        index: usize,
        available: usize,
    },

    #[error("operation was cancelled")]
    Cancelled,

    #[error(
        "{function}() should not modify its input arguments; check whether it mutates lists \
         or dicts it was given. Modifying a copy is allowed."
    )]
    MutationDetected { function: String },

    #[error("error while tracing {function}: {message}")]
    Trace { function: String, message: String },

    #[error("{message}\n\nFunction call stack:\n{}", call_chain.join(" -> "))]
    Execution {
        call_chain: Vec<String>,
        message: String,
    },

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl JitError {
    pub fn trace(function: impl Into<String>, message: impl Into<String>) -> Self {
        JitError::Trace {
            function: function.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JitError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_lead_with_the_signature() {
        let err = JitError::MissingRequiredArgs {
            signature: "func(x, y)".into(),
            missing: vec!["x".into(), "y".into()],
        };
        assert_eq!(err.to_string(), "func(x, y) missing required arguments: x, y");

        let err = JitError::UnexpectedKeywordArgs {
            signature: "func(x, octopus)".into(),
            names: vec!["octopu".into()],
            suggestion: Some("octopus".into()),
        };
        assert_eq!(
            err.to_string(),
            "func(x, octopus) got unexpected keyword arguments: octopu (did you mean `octopus`?)"
        );
    }

    #[test]
    fn execution_errors_render_the_call_chain() {
        let err = JitError::Execution {
            call_chain: vec!["fn".into(), "fn2".into()],
            message: "boom".into(),
        };
        assert!(err.to_string().ends_with("Function call stack:\nfn -> fn2"));
    }
}
