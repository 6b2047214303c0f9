//! Domain helpers shared by the ComfyUI client and the worker binary.

pub mod naming;
pub mod timing;
