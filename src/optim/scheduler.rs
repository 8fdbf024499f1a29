//! Learning rate schedulers

use super::Optimizer;
use std::f32::consts::PI;

/// Learning rate scheduler trait
pub trait LRScheduler {
    /// Get the current learning rate
    fn get_lr(&self) -> f32;

    /// Step the scheduler (typically called after each optimizer step)
    fn step(&mut self);
}

/// Linear learning rate scheduler
///
/// Interpolates the learning rate multiplicatively from
/// `base_lr * start_factor` to `base_lr * end_factor` over `total_iters`
/// steps, then holds the final value. With the default factors (1/3 → 1)
/// this is a linear warmup.
pub struct LinearLR {
    base_lr: f32,
    start_factor: f32,
    end_factor: f32,
    total_iters: usize,
    current_step: usize,
}

impl LinearLR {
    /// Create a new linear scheduler
    pub fn new(base_lr: f32, start_factor: f32, end_factor: f32, total_iters: usize) -> Self {
        Self {
            base_lr,
            start_factor,
            end_factor,
            total_iters,
            current_step: 0,
        }
    }

    /// Warmup from base_lr/3 to base_lr over `total_iters`
    pub fn default_factors(base_lr: f32, total_iters: usize) -> Self {
        Self::new(base_lr, 1.0 / 3.0, 1.0, total_iters)
    }

    /// Apply the current learning rate to an optimizer
    pub fn apply<O: Optimizer + ?Sized>(&self, optimizer: &mut O) {
        optimizer.set_lr(self.get_lr());
    }
}

impl LRScheduler for LinearLR {
    fn get_lr(&self) -> f32 {
        if self.total_iters == 0 {
            return self.base_lr * self.end_factor;
        }

        let progress = (self.current_step as f32 / self.total_iters as f32).min(1.0);
        let factor = self.start_factor + (self.end_factor - self.start_factor) * progress;
        self.base_lr * factor
    }

    fn step(&mut self) {
        self.current_step += 1;
    }
}

/// Cosine Annealing Learning Rate Scheduler
///
/// Decreases the learning rate following a cosine curve from lr_max to
/// lr_min: `lr_t = lr_min + 0.5 * (lr_max - lr_min) * (1 + cos(π t / T))`.
pub struct CosineAnnealingLR {
    lr_max: f32,
    lr_min: f32,
    t_max: usize,
    current_step: usize,
}

impl CosineAnnealingLR {
    /// Create a new cosine annealing scheduler
    pub fn new(lr_max: f32, t_max: usize, lr_min: f32) -> Self {
        Self {
            lr_max,
            lr_min,
            t_max,
            current_step: 0,
        }
    }

    /// Create scheduler with lr_min = 0
    pub fn default_min(lr_max: f32, t_max: usize) -> Self {
        Self::new(lr_max, t_max, 0.0)
    }

    /// Apply the current learning rate to an optimizer
    pub fn apply<O: Optimizer + ?Sized>(&self, optimizer: &mut O) {
        optimizer.set_lr(self.get_lr());
    }
}

impl LRScheduler for CosineAnnealingLR {
    fn get_lr(&self) -> f32 {
        if self.current_step >= self.t_max {
            return self.lr_min;
        }

        let progress = self.current_step as f32 / self.t_max as f32;
        let cosine_decay = 0.5 * (1.0 + (PI * progress).cos());
        self.lr_min + (self.lr_max - self.lr_min) * cosine_decay
    }

    fn step(&mut self) {
        self.current_step += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_linear_endpoints() {
        let mut scheduler = LinearLR::new(1.0, 0.5, 1.0, 10);
        assert_abs_diff_eq!(scheduler.get_lr(), 0.5, epsilon = 1e-6);

        for _ in 0..10 {
            scheduler.step();
        }
        assert_abs_diff_eq!(scheduler.get_lr(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_linear_holds_after_total_iters() {
        let mut scheduler = LinearLR::new(1.0, 0.5, 1.0, 10);
        for _ in 0..25 {
            scheduler.step();
        }
        assert_abs_diff_eq!(scheduler.get_lr(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_linear_default_is_warmup() {
        let mut scheduler = LinearLR::default_factors(0.3, 3);
        let first = scheduler.get_lr();
        scheduler.step();
        assert!(scheduler.get_lr() > first);
    }

    #[test]
    fn test_cosine_initial_and_final_lr() {
        let mut scheduler = CosineAnnealingLR::new(1.0, 100, 0.1);
        assert_abs_diff_eq!(scheduler.get_lr(), 1.0, epsilon = 1e-6);

        for _ in 0..100 {
            scheduler.step();
        }
        assert_abs_diff_eq!(scheduler.get_lr(), 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_cosine_decreases_monotonically() {
        let mut scheduler = CosineAnnealingLR::default_min(1.0, 50);
        let mut prev = scheduler.get_lr();

        for _ in 0..50 {
            scheduler.step();
            let lr = scheduler.get_lr();
            assert!(lr <= prev, "lr should not increase: {} > {}", lr, prev);
            prev = lr;
        }
    }

    #[test]
    fn test_apply_to_optimizer() {
        use crate::optim::SGD;

        let mut optimizer = SGD::new(1.0, 0.0);
        let mut scheduler = LinearLR::new(1.0, 0.5, 1.0, 4);

        scheduler.apply(&mut optimizer);
        assert_abs_diff_eq!(optimizer.lr(), 0.5, epsilon = 1e-6);

        scheduler.step();
        scheduler.apply(&mut optimizer);
        assert!(optimizer.lr() > 0.5);
    }
}
