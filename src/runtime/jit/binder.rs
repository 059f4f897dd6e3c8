use std::collections::BTreeMap;
use std::fmt;

use polytrace_types::{DType, Kwargs, Tensor, Value};
use polytrace_utils::suggest::find_best_match;

use crate::runtime::jit::error::{JitError, JitResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    PositionalOrKeyword,
    VarPositional,
    KeywordOnly,
    VarKeyword,
}

/// Annotation that lets literal arguments be converted before keying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamHint {
    #[default]
    Any,
    Tensor(Option<DType>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<Value>,
    pub hint: ParamHint,
}

impl Param {
    fn with_kind(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            hint: ParamHint::Any,
        }
    }

    pub fn positional(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::PositionalOrKeyword)
    }

    pub fn var_positional(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::VarPositional)
    }

    pub fn keyword_only(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::KeywordOnly)
    }

    pub fn var_keyword(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::VarKeyword)
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn tensor_hint(mut self, dtype: Option<DType>) -> Self {
        self.hint = ParamHint::Tensor(dtype);
        self
    }
}

/// Declared parameter list of a callable.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub params: Vec<Param>,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// `name(x, y, *args, *, c, **kwargs)` without defaults.
    pub fn signature(&self) -> String {
        self.render(false)
    }

    /// Like [`signature`](Self::signature) but shows `name=default` for defaulted parameters.
    pub fn summary(&self) -> String {
        self.render(true)
    }

    fn render(&self, with_defaults: bool) -> String {
        let mut parts = Vec::with_capacity(self.params.len());
        let mut star_emitted = false;
        for param in &self.params {
            match param.kind {
                ParamKind::VarPositional => {
                    star_emitted = true;
                    parts.push(format!("*{}", param.name));
                }
                ParamKind::VarKeyword => parts.push(format!("**{}", param.name)),
                ParamKind::KeywordOnly | ParamKind::PositionalOrKeyword => {
                    if param.kind == ParamKind::KeywordOnly && !star_emitted {
                        star_emitted = true;
                        parts.push("*".to_string());
                    }
                    match (&param.default, with_defaults) {
                        (Some(default), true) => parts.push(format!("{}={default}", param.name)),
                        _ => parts.push(param.name.clone()),
                    }
                }
            }
        }
        format!("{}({})", self.name, parts.join(", "))
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn positional_count(&self) -> usize {
        self.params
            .iter()
            .filter(|p| p.kind == ParamKind::PositionalOrKeyword)
            .count()
    }

    /// Binds call arguments to parameters.
    ///
    /// Checks run in a fixed order: positional arity, duplicate values,
    /// unknown keywords, then missing arguments (all of them are reported).
    pub fn bind(&self, args: &[Value], kwargs: &Kwargs) -> JitResult<BoundArguments> {
        let positional: Vec<&Param> = self
            .params
            .iter()
            .filter(|p| p.kind == ParamKind::PositionalOrKeyword)
            .collect();
        let var_positional = self
            .params
            .iter()
            .find(|p| p.kind == ParamKind::VarPositional);
        let var_keyword = self.params.iter().find(|p| p.kind == ParamKind::VarKeyword);

        if args.len() > positional.len() && var_positional.is_none() {
            return Err(JitError::TooManyPositionalArgs {
                signature: self.signature(),
                expected: positional.len(),
                got: args.len(),
            });
        }

        let mut assigned: BTreeMap<&str, Value> = BTreeMap::new();
        for (param, value) in positional.iter().zip(args) {
            assigned.insert(param.name.as_str(), value.clone());
        }
        let extra_positional = args.get(positional.len()..).unwrap_or_default();

        let mut extra_keywords = Kwargs::new();
        let mut unexpected = Vec::new();
        for (name, value) in kwargs {
            let accepts = self.params.iter().any(|p| {
                p.name == *name
                    && matches!(p.kind, ParamKind::PositionalOrKeyword | ParamKind::KeywordOnly)
            });
            if accepts {
                if assigned.contains_key(name.as_str()) {
                    return Err(JitError::DuplicateArgument {
                        signature: self.signature(),
                        name: name.clone(),
                    });
                }
                assigned.insert(name.as_str(), value.clone());
            } else if var_keyword.is_some() {
                extra_keywords.insert(name.clone(), value.clone());
            } else {
                unexpected.push(name.clone());
            }
        }

        if !unexpected.is_empty() {
            let suggestion = unexpected
                .first()
                .filter(|name| name.chars().count() >= 3)
                .and_then(|name| {
                    find_best_match(
                        name,
                        self.params
                            .iter()
                            .filter(|p| !assigned.contains_key(p.name.as_str()))
                            .map(|p| p.name.as_str()),
                    )
                });
            return Err(JitError::UnexpectedKeywordArgs {
                signature: self.signature(),
                names: unexpected,
                suggestion,
            });
        }

        let missing: Vec<String> = self
            .params
            .iter()
            .filter(|p| matches!(p.kind, ParamKind::PositionalOrKeyword | ParamKind::KeywordOnly))
            .filter(|p| !assigned.contains_key(p.name.as_str()) && p.default.is_none())
            .map(|p| p.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(JitError::MissingRequiredArgs {
                signature: self.signature(),
                missing,
            });
        }

        let mut entries = Vec::with_capacity(self.params.len() + extra_positional.len());
        for param in &positional {
            let (value, from_default) = match assigned.remove(param.name.as_str()) {
                Some(value) => (value, false),
                None => (param.default.clone().unwrap_or(Value::None), true),
            };
            entries.push(BoundArg {
                name: param.name.clone(),
                flat_name: param.name.clone(),
                param: param.name.clone(),
                kind: ParamKind::PositionalOrKeyword,
                value,
                from_default,
            });
        }
        if let Some(var) = var_positional {
            for (j, value) in extra_positional.iter().enumerate() {
                entries.push(BoundArg {
                    name: format!("<arg{}>", positional.len() + j + 1),
                    flat_name: format!("{}_{j}", var.name),
                    param: var.name.clone(),
                    kind: ParamKind::VarPositional,
                    value: value.clone(),
                    from_default: false,
                });
            }
        }
        for param in self.params.iter().filter(|p| p.kind == ParamKind::KeywordOnly) {
            let (value, from_default) = match assigned.remove(param.name.as_str()) {
                Some(value) => (value, false),
                None => (param.default.clone().unwrap_or(Value::None), true),
            };
            entries.push(BoundArg {
                name: param.name.clone(),
                flat_name: param.name.clone(),
                param: param.name.clone(),
                kind: ParamKind::KeywordOnly,
                value,
                from_default,
            });
        }
        if let Some(var) = var_keyword {
            for (name, value) in extra_keywords {
                entries.push(BoundArg {
                    flat_name: name.clone(),
                    name,
                    param: var.name.clone(),
                    kind: ParamKind::VarKeyword,
                    value,
                    from_default: false,
                });
            }
        }

        Ok(BoundArguments { entries })
    }

    /// Converts literal numbers bound to tensor-hinted parameters into scalar tensors.
    pub fn apply_type_hints(&self, bound: &mut BoundArguments) {
        for entry in &mut bound.entries {
            let Some(ParamHint::Tensor(dtype)) = self.param(&entry.param).map(|p| p.hint) else {
                continue;
            };
            if let Some(tensor) = literal_to_tensor(&entry.value, dtype) {
                entry.value = Value::Tensor(tensor);
            }
        }
    }
}

impl fmt::Display for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Scalar tensor for a numeric literal. Integers default to `int32`, floats to `float32`.
pub fn literal_to_tensor(value: &Value, dtype: Option<DType>) -> Option<Tensor> {
    let (default_dtype, raw) = match value {
        Value::Bool(b) => (DType::Bool, f64::from(u8::from(*b))),
        Value::Int(i) => (DType::Int32, *i as f64),
        Value::Float(x) => (DType::Float32, *x),
        _ => return None,
    };
    Some(Tensor::scalar(dtype.unwrap_or(default_dtype), raw))
}

/// One bound argument in canonical order.
///
/// `name` is what signatures show (`x`, `<arg3>` for a variadic position, `c` for a
/// collected keyword); `flat_name` is the base of the flat tensor names (`x`, `args_0`).
#[derive(Debug, Clone, PartialEq)]
pub struct BoundArg {
    pub name: String,
    pub flat_name: String,
    pub param: String,
    pub kind: ParamKind,
    pub value: Value,
    pub from_default: bool,
}

/// Arguments in canonical order: positional parameters, variadic positions,
/// keyword-only parameters, then collected keywords sorted by name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoundArguments {
    entries: Vec<BoundArg>,
}

impl BoundArguments {
    pub fn new(entries: Vec<BoundArg>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[BoundArg] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [BoundArg] {
        &mut self.entries
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
