// Signature keys and shape relaxation
pub mod key;
pub mod relax;

pub use key::{make_key, KeyEntry, Literal, SignatureKey, TraceType};
pub use relax::RelaxationState;
