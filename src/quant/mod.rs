//! Weight quantization
//!
//! Fake (simulated) integer quantization of layer weights for post-training
//! quantization, with an optional learned floor/ceil rounding parameter per
//! weight element.

mod fake_quantize;
mod learned_round;

pub use fake_quantize::{QuantConfig, WeightQuantizer};
pub use learned_round::{LearnedRound, RoundImpl};
