use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element type carried by tensors and tensor specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::Int32 | DType::Int64)
    }

    pub fn is_floating(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }

    /// Coerce a raw element into the representable range of this dtype.
    pub fn normalize(self, value: f64) -> f64 {
        match self {
            DType::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::Int32 | DType::Int64 => value.trunc(),
            DType::Float32 => f64::from(value as f32),
            DType::Float64 => value,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "bool" => Ok(DType::Bool),
            "int32" => Ok(DType::Int32),
            "int64" => Ok(DType::Int64),
            "float32" => Ok(DType::Float32),
            "float64" => Ok(DType::Float64),
            other => Err(format!("unknown dtype `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names() {
        assert_eq!("int32".parse::<DType>(), Ok(DType::Int32));
        assert_eq!(" float64 ".parse::<DType>(), Ok(DType::Float64));
        assert!("complex64".parse::<DType>().is_err());
    }

    #[test]
    fn normalize_truncates_integers() {
        assert_eq!(DType::Int32.normalize(2.7), 2.0);
        assert_eq!(DType::Bool.normalize(-3.0), 1.0);
    }
}
