//! Attention backward kernel and its candle front end.

pub mod attention_backward;
pub mod backward;
pub mod interop;
pub mod reference;

pub use attention_backward::{
    attention_backward, validate_backward_inputs, BackwardInputs, BackwardOptions, Gradients,
};
pub use backward::{workspace_size, Arch, KernelConfig, KernelVariant, MaxK, Precision};
pub use reference::{DenseGradients, DenseProblem};
