//! Block-wise learned-rounding optimization
//!
//! The post-training-quantization core: extract blocks from a model,
//! capture each block's calibration activations into a cache, and train the
//! block's rounding parameters by gradient descent against the captured
//! reference outputs, one block at a time in extraction order.
//!
//! # Example
//!
//! ```
//! use cuantizar::nn::{Module, QuantLinear, Sequential};
//! use cuantizar::quant::{QuantConfig, RoundImpl};
//! use cuantizar::round::{
//!     forward_with_tap, ActivationCache, LearnedRoundConfig, LearnedRoundOptimizer, RunHooks,
//! };
//! use cuantizar::Tensor;
//!
//! let mut model = Sequential::new()
//!     .push("block0", QuantLinear::new(vec![0.13, -0.41, 0.27, 0.33], 2, 2, QuantConfig::q4_symmetric()))
//!     .push("block1", QuantLinear::new(vec![0.21, 0.17, -0.35, 0.09], 2, 2, QuantConfig::q4_symmetric()));
//!
//! let data: Vec<Tensor> =
//!     (0..8).map(|i| Tensor::from_vec(vec![0.1 * i as f32, 1.0 - 0.2 * i as f32], false)).collect();
//!
//! let config = LearnedRoundConfig::new()
//!     .with_iters(20)
//!     .with_batch_size(4)
//!     .with_rounding(RoundImpl::Identity);
//! let mut optimizer = LearnedRoundOptimizer::new(config)?;
//!
//! let mut cache = ActivationCache::new();
//! let results = optimizer.apply_learned_round(
//!     &mut model,
//!     forward_with_tap,
//!     |block, x| block.forward(x),
//!     &data,
//!     &mut cache,
//!     &|_, name| name.starts_with("block"),
//!     RunHooks::none(),
//! )?;
//! assert_eq!(results.len(), 2);
//! # Ok::<(), cuantizar::Error>(())
//! ```

mod blocks;
mod cache;
mod loss;
mod optimizer;
mod saver;

pub use blocks::get_blocks;
pub use cache::{ActivationCache, Cache};
pub use loss::{
    cast_f16, BlockLoss, LinearTempDecay, LossKind, LossTerms, ReconstructionLoss, RegularizedLoss,
};
pub use optimizer::{
    BlockResult, LearnedRoundConfig, LearnedRoundOptimizer, OptimKind, RunHooks, SchedulerKind,
};
pub use saver::{forward_with_tap, DataSaver};
