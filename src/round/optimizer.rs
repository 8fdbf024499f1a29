//! Block-wise learned-rounding optimizer
//!
//! Processes the extracted blocks strictly one at a time, in extraction
//! order. Per block: capture calibration activations into the cache, freeze
//! everything except the rounding parameters, train them by gradient
//! descent on cached mini-batches, keep the best-loss snapshot, then freeze
//! again and move on. Finished blocks keep their optimized parameters in
//! place, so a crash mid-run only loses the in-flight block.

use super::blocks::get_blocks;
use super::cache::Cache;
use super::loss::{cast_f16, LossKind};
use super::saver::DataSaver;
use crate::autograd::{backward, scale};
use crate::error::{Error, Result};
use crate::nn::{module_at, BlockPath, Module};
use crate::optim::{Adam, CosineAnnealingLR, LRScheduler, LinearLR, Optimizer, SignSGD, SGD};
use crate::quant::{LearnedRound, RoundImpl};
use crate::Tensor;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::path::Path;

/// Optimizer algorithm selection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OptimKind {
    /// Sign gradient descent (robust under aggressive loss scaling)
    SignSgd,
    /// SGD with momentum
    Sgd {
        /// Momentum factor
        momentum: f32,
    },
    /// Adam
    Adam {
        /// First-moment decay
        beta1: f32,
        /// Second-moment decay
        beta2: f32,
        /// Denominator fuzz
        epsilon: f32,
    },
}

impl Default for OptimKind {
    fn default() -> Self {
        Self::SignSgd
    }
}

/// Learning-rate scheduler selection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// Linear factor interpolation over the iteration budget
    Linear {
        /// Multiplier at iteration 0
        start_factor: f32,
        /// Multiplier at the final iteration
        end_factor: f32,
    },
    /// Cosine annealing down to `lr_min`
    Cosine {
        /// Final learning rate
        lr_min: f32,
    },
}

impl Default for SchedulerKind {
    fn default() -> Self {
        Self::Linear {
            start_factor: 1.0 / 3.0,
            end_factor: 1.0,
        }
    }
}

/// Configuration for [`LearnedRoundOptimizer`]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnedRoundConfig {
    /// Optimizer choice
    pub optimizer: OptimKind,
    /// Learning rate
    pub lr: f32,
    /// Scheduler choice; its span is always the iteration budget
    pub scheduler: Option<SchedulerKind>,
    /// Mini-batch size (capped by the cache's sample count)
    pub batch_size: usize,
    /// Training iterations per block
    pub iters: usize,
    /// Reload the best-loss snapshot after training
    pub use_best_model: bool,
    /// Round loss inputs through f16 to emulate reduced precision
    pub use_amp: bool,
    /// Factor applied to the loss before the gradient step, keeping
    /// gradients in a representable range under reduced precision
    pub loss_scaling_factor: f32,
    /// Loss strategy
    pub loss: LossKind,
    /// Rounding parameterization inserted into quantized layers
    pub rounding: RoundImpl,
    /// Capture block inputs with quantization enabled
    pub capture_quant_input: bool,
    /// Capture reference outputs with quantization enabled
    pub capture_quant_output: bool,
    /// Detach captured tensors from the tape before caching
    pub offload: bool,
    /// Seed for mini-batch index permutations
    pub seed: u64,
    /// Print loss components every N iterations
    pub log_interval: usize,
}

impl Default for LearnedRoundConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimKind::SignSgd,
            lr: 5e-3,
            scheduler: Some(SchedulerKind::default()),
            batch_size: 8,
            iters: 200,
            use_best_model: true,
            use_amp: false,
            loss_scaling_factor: 1000.0,
            loss: LossKind::Reconstruction,
            rounding: RoundImpl::hard_sigmoid(),
            capture_quant_input: true,
            capture_quant_output: false,
            offload: false,
            seed: 0,
            log_interval: 10,
        }
    }
}

impl LearnedRoundConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the iteration budget per block
    pub fn with_iters(mut self, iters: usize) -> Self {
        self.iters = iters;
        self
    }

    /// Set the mini-batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the learning rate
    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    /// Set the optimizer choice
    pub fn with_optimizer(mut self, optimizer: OptimKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Set the scheduler choice
    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Run with a constant learning rate
    pub fn without_scheduler(mut self) -> Self {
        self.scheduler = None;
        self
    }

    /// Set the loss strategy
    pub fn with_loss(mut self, loss: LossKind) -> Self {
        self.loss = loss;
        self
    }

    /// Set the rounding parameterization
    pub fn with_rounding(mut self, rounding: RoundImpl) -> Self {
        self.rounding = rounding;
        self
    }

    /// Keep or discard the best-loss snapshot
    pub fn with_use_best(mut self, use_best: bool) -> Self {
        self.use_best_model = use_best;
        self
    }

    /// Set the capture quantization flags for inputs and outputs
    pub fn with_capture_flags(mut self, quant_input: bool, quant_output: bool) -> Self {
        self.capture_quant_input = quant_input;
        self.capture_quant_output = quant_output;
        self
    }

    /// Detach captured tensors before caching
    pub fn with_offload(mut self, offload: bool) -> Self {
        self.offload = offload;
        self
    }

    /// Set the mini-batch sampling seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Load and validate a configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Check the configuration for structural errors
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.iters == 0 {
            return Err(Error::Config("iters must be at least 1".to_string()));
        }
        if self.lr <= 0.0 {
            return Err(Error::Config(format!(
                "learning rate must be positive, got {}",
                self.lr
            )));
        }
        if self.loss_scaling_factor <= 0.0 {
            return Err(Error::Config(format!(
                "loss scaling factor must be positive, got {}",
                self.loss_scaling_factor
            )));
        }
        if self.log_interval == 0 {
            return Err(Error::Config("log_interval must be at least 1".to_string()));
        }
        self.loss.validate()
    }

    fn build_optimizer(&self) -> Box<dyn Optimizer> {
        match self.optimizer {
            OptimKind::SignSgd => Box::new(SignSGD::new(self.lr)),
            OptimKind::Sgd { momentum } => Box::new(SGD::new(self.lr, momentum)),
            OptimKind::Adam {
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(self.lr, beta1, beta2, epsilon)),
        }
    }

    fn build_scheduler(&self) -> Option<Box<dyn LRScheduler>> {
        self.scheduler.as_ref().map(|kind| -> Box<dyn LRScheduler> {
            match *kind {
                SchedulerKind::Linear {
                    start_factor,
                    end_factor,
                } => Box::new(LinearLR::new(self.lr, start_factor, end_factor, self.iters)),
                SchedulerKind::Cosine { lr_min } => {
                    Box::new(CosineAnnealingLR::new(self.lr, self.iters, lr_min))
                }
            }
        })
    }
}

/// Per-block optimization summary
#[derive(Clone, Debug)]
pub struct BlockResult {
    /// The optimized block
    pub path: BlockPath,
    /// Loss of the first training iteration
    pub init_loss: f32,
    /// Lowest loss observed (final loss if best-model tracking is off)
    pub best_loss: f32,
    /// Iteration (1-based) that produced `best_loss`
    pub best_iter: usize,
}

/// Optional callbacks around a whole optimization run, e.g. for toggling
/// stateful model behaviors that must be off while capturing
pub struct RunHooks<'a, M> {
    /// Invoked once before any block is processed
    pub prepare: Option<&'a mut dyn FnMut(&mut M)>,
    /// Invoked once after the last block
    pub finish: Option<&'a mut dyn FnMut(&mut M)>,
}

impl<M> RunHooks<'_, M> {
    /// No hooks
    pub fn none() -> Self {
        Self {
            prepare: None,
            finish: None,
        }
    }
}

impl<M> Default for RunHooks<'_, M> {
    fn default() -> Self {
        Self::none()
    }
}

/// Block-wise learned-rounding optimizer
pub struct LearnedRoundOptimizer {
    config: LearnedRoundConfig,
    rng: StdRng,
}

impl LearnedRoundOptimizer {
    /// Create an optimizer from a validated configuration
    pub fn new(config: LearnedRoundConfig) -> Result<Self> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self { config, rng })
    }

    /// The active configuration
    pub fn config(&self) -> &LearnedRoundConfig {
        &self.config
    }

    /// Optimize the rounding parameters of every matching block, in place.
    ///
    /// `model_forward` runs the model end-to-end under a capture tap
    /// ([`super::forward_with_tap`] for tree-structured models);
    /// `block_forward` runs one block in isolation; `data` is the
    /// calibration set, one sample per tensor; `predicate` selects the
    /// block roots. Returns one [`BlockResult`] per block in processing
    /// order.
    ///
    /// Only the capture tap's stop signal is absorbed. Any error from
    /// configuration, capture, or training aborts the run; blocks already
    /// finalized keep their optimized parameters.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_learned_round<M, FM, FB>(
        &mut self,
        model: &mut M,
        mut model_forward: FM,
        mut block_forward: FB,
        data: &[Tensor],
        cache: &mut dyn Cache,
        predicate: &dyn Fn(&dyn Module, &str) -> bool,
        mut hooks: RunHooks<'_, M>,
    ) -> Result<Vec<BlockResult>>
    where
        M: Module,
        FM: FnMut(&mut M, &Tensor, &mut DataSaver<'_>) -> ControlFlow<(), Tensor>,
        FB: FnMut(&mut dyn Module, &Tensor) -> Tensor,
    {
        self.config.validate()?;

        if let Some(prepare) = hooks.prepare.as_mut() {
            prepare(model);
        }

        // Attach rounding parameters to every quantized layer, then pick
        // the block boundaries
        model.insert_learned_round(&self.config.rounding);
        let blocks = get_blocks(&mut *model, predicate);

        println!("Total iterations per block {}", self.config.iters);
        println!("Number of blocks {}", blocks.len());

        cache.initialize();

        let mut results = Vec::with_capacity(blocks.len());
        for (block_idx, path) in blocks.iter().enumerate() {
            // The cache belongs to this block until reset below
            cache.clear();
            self.populate_cache(model, &mut model_forward, path, data, cache)?;
            if cache.is_empty() {
                return Err(Error::Capture(format!(
                    "no activations captured for block {path}"
                )));
            }

            let block = module_at(&mut *model, path).ok_or_else(|| {
                Error::Config(format!("block path {path} does not resolve to a module"))
            })?;

            // Freeze the block; only rounding parameters train
            block.set_training(false);
            for param in block.parameters() {
                param.set_requires_grad(false);
            }
            for module in block.learned_round_modules() {
                module.set_training(true);
                module.value_mut().set_requires_grad(true);
            }

            let block_loss = {
                let modules = block.learned_round_modules();
                let refs: Vec<&LearnedRound> = modules.iter().map(|m| &**m).collect();
                self.config.loss.instantiate(self.config.iters, &refs)?
            };

            let (init_loss, best_loss, best_iter) =
                self.optimize_block(&mut *block, &*cache, block_loss, &mut block_forward)?;

            println!(
                "Optimized block {}/{} ({path}): initial loss {:.6}, best loss {:.6} at iteration {}",
                block_idx + 1,
                blocks.len(),
                init_loss,
                best_loss,
                best_iter
            );

            // Freeze the rounding parameters again before moving on
            for module in block.learned_round_modules() {
                module.set_training(false);
                module.value_mut().set_requires_grad(false);
            }

            cache.reset();
            results.push(BlockResult {
                path: path.clone(),
                init_loss,
                best_loss,
                best_iter,
            });
        }

        if let Some(finish) = hooks.finish.as_mut() {
            finish(model);
        }

        Ok(results)
    }

    /// Fill the cache with the block's inputs and reference outputs.
    ///
    /// The pass that stores a tensor always runs with quantization set to
    /// that tensor's capture flag: inputs come from the first pass, and
    /// outputs ride along only when both flags agree; otherwise a second
    /// pass stores the outputs under the other quantization state.
    fn populate_cache<M, FM>(
        &self,
        model: &mut M,
        model_forward: &mut FM,
        target: &BlockPath,
        data: &[Tensor],
        cache: &mut dyn Cache,
    ) -> Result<()>
    where
        M: Module,
        FM: FnMut(&mut M, &Tensor, &mut DataSaver<'_>) -> ControlFlow<(), Tensor>,
    {
        let quant_input = self.config.capture_quant_input;
        let quant_output = self.config.capture_quant_output;

        self.save_inputs_output(
            model,
            model_forward,
            target,
            data,
            cache,
            true,
            quant_input == quant_output,
            !quant_input,
        )?;
        if quant_input != quant_output {
            self.save_inputs_output(
                model,
                model_forward,
                target,
                data,
                cache,
                false,
                true,
                !quant_output,
            )?;
        }
        Ok(())
    }

    /// One capture pass over the calibration data
    #[allow(clippy::too_many_arguments)]
    fn save_inputs_output<M, FM>(
        &self,
        model: &mut M,
        model_forward: &mut FM,
        target: &BlockPath,
        data: &[Tensor],
        cache: &mut dyn Cache,
        store_inputs: bool,
        store_output: bool,
        disable_quant: bool,
    ) -> Result<()>
    where
        M: Module,
        FM: FnMut(&mut M, &Tensor, &mut DataSaver<'_>) -> ControlFlow<(), Tensor>,
    {
        if disable_quant {
            model.set_quant_enabled(false);
        }

        {
            let mut saver = DataSaver::new(
                cache,
                target.clone(),
                store_inputs,
                store_output,
                self.config.offload,
            );
            for sample in data {
                // Break means the tap fired and the rest of the pass was
                // skipped; Continue means the target was never reached,
                // which surfaces later as an empty cache
                let _ = model_forward(model, sample, &mut saver);
            }
        }

        if disable_quant {
            model.set_quant_enabled(true);
        }
        Ok(())
    }

    /// Train one block's rounding parameters over the cached activations
    fn optimize_block(
        &mut self,
        block: &mut dyn Module,
        cache: &dyn Cache,
        mut block_loss: Box<dyn super::loss::BlockLoss>,
        block_forward: &mut dyn FnMut(&mut dyn Module, &Tensor) -> Tensor,
    ) -> Result<(f32, f32, usize)> {
        let mut optimizer = self.config.build_optimizer();
        let mut scheduler = self.config.build_scheduler();
        if let Some(sched) = scheduler.as_ref() {
            optimizer.set_lr(sched.get_lr());
        }

        let n_samples = cache.len();
        let batch_size = self.config.batch_size.min(n_samples);

        let mut best_loss = f32::MAX;
        let mut curr_loss = f32::MAX;
        let mut init_loss = -1.0;
        let mut last_best_iter = self.config.iters;
        let mut best_state: Option<Vec<Array1<f32>>> = None;

        let mut indices: Vec<usize> = (0..n_samples).collect();

        for i in 0..self.config.iters {
            // Mini-batch without replacement via a seeded permutation
            indices.shuffle(&mut self.rng);
            let (inputs, targets) = cache.sample_batch(&indices[..batch_size])?;

            let mut preds = Vec::with_capacity(inputs.len());
            for x in &inputs {
                preds.push(block_forward(&mut *block, x));
            }

            let rounding: Vec<Tensor> = block
                .learned_round_modules()
                .iter()
                .filter_map(|m| m.p_forward())
                .collect();

            let (loss, terms) = if self.config.use_amp {
                let preds: Vec<Tensor> = preds.iter().map(cast_f16).collect();
                let targets: Vec<Tensor> = targets.iter().map(cast_f16).collect();
                block_loss.compute(&preds, &targets, &rounding)
            } else {
                block_loss.compute(&preds, &targets, &rounding)
            };

            // Track the best snapshot before the gradient step mutates it
            curr_loss = loss.data()[0];
            if i == 0 {
                init_loss = curr_loss;
            }
            if curr_loss < best_loss {
                best_loss = curr_loss;
                last_best_iter = i + 1;
                if self.config.use_best_model {
                    best_state = Some(collect_round_state(&mut *block));
                }
            }

            // Scale the loss to keep gradients representable, then step
            let mut scaled = scale(&loss, self.config.loss_scaling_factor);
            backward(&mut scaled, None);
            {
                let modules = block.learned_round_modules();
                let mut params: Vec<&mut Tensor> =
                    modules.into_iter().map(|m| m.value_mut()).collect();
                optimizer.step(&mut params);
                optimizer.zero_grad(&mut params);
            }
            if let Some(sched) = scheduler.as_mut() {
                sched.step();
                optimizer.set_lr(sched.get_lr());
            }

            if (i + 1) % self.config.log_interval == 0 {
                println!("  iter {:>4}: {}", i + 1, block_loss.format_terms(&terms));
            }
        }

        if self.config.use_best_model {
            if let Some(state) = best_state {
                load_round_state(&mut *block, &state);
            }
        } else {
            // The final parameters stand and are reported as best
            best_loss = curr_loss;
            last_best_iter = self.config.iters;
        }

        Ok((init_loss, best_loss, last_best_iter))
    }
}

/// Snapshot the rounding parameters of a block, in traversal order
fn collect_round_state(block: &mut dyn Module) -> Vec<Array1<f32>> {
    block
        .learned_round_modules()
        .iter()
        .map(|m| m.value().data().clone())
        .collect()
}

/// Restore a snapshot taken by [`collect_round_state`]
fn load_round_state(block: &mut dyn Module, state: &[Array1<f32>]) {
    for (module, saved) in block.learned_round_modules().into_iter().zip(state) {
        module.value_mut().data_mut().assign(saved);
    }
}
