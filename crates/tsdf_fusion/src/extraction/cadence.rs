//! Additive-increase / multiplicative-decrease pacing for extraction.
//!
//! The quota is the number of dirty blocks one cycle may mesh. Cycles that
//! finish under the target time ramp it up slowly; an over-budget cycle
//! cuts it at once, then a short forgiveness window absorbs the spikes that
//! usually follow a cut.
//!
//! ```text
//!   quota
//!     │        ┌─┐            ramp: +step after `ramp_streak`
//!     │     ┌──┘ │   ┌──┐           consecutive fast cycles
//!     │  ┌──┘    │ ┌─┘  │     cut:  × multiplicative_cut on a slow
//!     │──┘       └─┘    └─          cycle outside the window
//!     └──────────────────────► cycles
//! ```

use std::time::Duration;

use crate::config::ExtractionConfig;

/// What the controller did after a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaChange {
  Held,
  Raised,
  Cut,
  /// Over budget inside the forgiveness window.
  Forgiven,
}

#[derive(Clone, Debug)]
pub struct AimdController {
  quota: usize,
  min: usize,
  max: usize,
  step: usize,
  cut: f32,
  ramp_streak: u32,
  forgiveness_cycles: u32,
  target: Duration,
  under_budget_streak: u32,
  forgiveness_left: u32,
}

impl AimdController {
  pub fn new(config: &ExtractionConfig, target: Duration) -> Self {
    let min = config.min_quota.max(1);
    let max = config.max_quota.max(min);
    Self {
      quota: config.initial_quota.clamp(min, max),
      min,
      max,
      step: config.additive_step,
      cut: config.multiplicative_cut,
      ramp_streak: config.ramp_streak.max(1),
      forgiveness_cycles: config.forgiveness_cycles,
      target,
      under_budget_streak: 0,
      forgiveness_left: 0,
    }
  }

  /// Blocks the next cycle may mesh.
  #[inline]
  pub fn quota(&self) -> usize {
    self.quota
  }

  #[inline]
  pub fn target(&self) -> Duration {
    self.target
  }

  /// True while over-budget cycles are tolerated after a cut.
  #[inline]
  pub fn in_forgiveness(&self) -> bool {
    self.forgiveness_left > 0
  }

  /// Feed the duration of the cycle that just ran.
  pub fn record_cycle(&mut self, elapsed: Duration) -> QuotaChange {
    let forgiving = self.forgiveness_left > 0;
    self.forgiveness_left = self.forgiveness_left.saturating_sub(1);

    if elapsed <= self.target {
      self.under_budget_streak += 1;
      if self.under_budget_streak >= self.ramp_streak {
        self.under_budget_streak = 0;
        let raised = self.quota.saturating_add(self.step).min(self.max);
        if raised != self.quota {
          self.quota = raised;
          return QuotaChange::Raised;
        }
      }
      return QuotaChange::Held;
    }

    self.under_budget_streak = 0;
    if forgiving {
      return QuotaChange::Forgiven;
    }
    let cut = ((self.quota as f32 * self.cut).floor() as usize).clamp(self.min, self.max);
    self.quota = cut;
    self.forgiveness_left = self.forgiveness_cycles;
    QuotaChange::Cut
  }
}
