//! # Cuantizar: Learned-Rounding Post-Training Quantization
//!
//! Cuantizar quantizes neural-network weights block by block, learning a
//! per-element floor/ceil rounding decision that minimizes each block's
//! output reconstruction error over cached calibration activations.
//!
//! ## Architecture
//!
//! - **autograd**: Tape-based automatic differentiation
//! - **nn**: Module tree, quantized linear layer, sequential container
//! - **quant**: Fake quantization and the learned rounding parameter
//! - **optim**: Optimizers (SignSGD, SGD, Adam) and LR schedulers
//! - **round**: Block extraction, activation cache, capture taps, loss
//!   strategies, and the block-wise learned-rounding optimizer

pub mod autograd;
pub mod nn;
pub mod optim;
pub mod quant;
pub mod round;

pub mod error;

// Re-export commonly used types
pub use autograd::{backward, Tensor};
pub use error::{Error, Result};
