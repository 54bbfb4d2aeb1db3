use serde::{Deserialize, Serialize};

use crate::types::Credits;

/// Schema version written into every persisted `RunConfig`. Older stored
/// configs are migrated forward before a run resumes.
pub const LATEST_RUN_CONFIG_VERSION: u32 = 2;

/// What to do when a limit is breached.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum LimitBehavior {
    Pause,
    Fail,
}

impl Default for LimitBehavior {
    fn default() -> Self {
        Self::Fail
    }
}

/// What to do when a branch fails while others are still progressing.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum BranchFailureBehavior {
    /// Log and keep the remaining branches going.
    Continue,
    /// Pause the whole run for inspection.
    Pause,
    /// Fail the whole run.
    Stop,
}

impl Default for BranchFailureBehavior {
    fn default() -> Self {
        Self::Continue
    }
}

/// Resource limits for one run.
///
/// `max_time_ms` is a wall-clock deadline on the run as a whole: time spent
/// with branches parked in `Waiting` still counts, since a run waiting on a
/// human decision is still occupying the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLimits {
    #[serde(default = "default_max_time_ms")]
    pub max_time_ms: u64,
    #[serde(default = "default_max_credits")]
    pub max_credits: Credits,
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default)]
    pub on_max_time: LimitBehavior,
    #[serde(default)]
    pub on_max_credits: LimitBehavior,
    #[serde(default)]
    pub on_max_steps: LimitBehavior,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_time_ms: default_max_time_ms(),
            max_credits: default_max_credits(),
            max_steps: default_max_steps(),
            on_max_time: LimitBehavior::default(),
            on_max_credits: LimitBehavior::default(),
            on_max_steps: LimitBehavior::default(),
        }
    }
}

fn default_max_time_ms() -> u64 {
    1000 * 60 * 60 // one hour
}

fn default_max_credits() -> Credits {
    Credits::from(1_000_000)
}

fn default_max_steps() -> u64 {
    1000
}

/// Loop delay tuning. The delay grows exponentially (bounded) while every
/// branch is waiting on external input, to avoid busy-polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_loop_delay_ms")]
    pub loop_delay_ms: u64,
    #[serde(default = "default_loop_delay_multiplier")]
    pub loop_delay_multiplier: f64,
    #[serde(default = "default_max_loop_delay_ms")]
    pub max_loop_delay_ms: u64,
    /// Mutable cursor: the delay the loop will sleep next.
    #[serde(default = "default_loop_delay_ms")]
    pub current_loop_delay_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            loop_delay_ms: default_loop_delay_ms(),
            loop_delay_multiplier: default_loop_delay_multiplier(),
            max_loop_delay_ms: default_max_loop_delay_ms(),
            current_loop_delay_ms: default_loop_delay_ms(),
        }
    }
}

impl LoopConfig {
    /// Exponential backoff, bounded by `max_loop_delay_ms`.
    pub fn back_off(&mut self) {
        let next = (self.current_loop_delay_ms as f64 * self.loop_delay_multiplier) as u64;
        self.current_loop_delay_ms = next.min(self.max_loop_delay_ms);
    }

    /// Reset the delay after progress was made.
    pub fn reset(&mut self) {
        self.current_loop_delay_ms = self.loop_delay_ms;
    }
}

fn default_loop_delay_ms() -> u64 {
    50
}

fn default_loop_delay_multiplier() -> f64 {
    2.0
}

fn default_max_loop_delay_ms() -> u64 {
    30_000
}

/// Full run configuration. Supplied at `init_new_run`; may be hot-swapped via
/// `update_run_config`, applied atomically at the top of the next loop
/// iteration only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(rename = "__version", default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub limits: RunLimits,
    #[serde(default)]
    pub loop_config: LoopConfig,
    #[serde(default)]
    pub on_branch_failure: BranchFailureBehavior,
}

fn default_config_version() -> u32 {
    1
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            version: LATEST_RUN_CONFIG_VERSION,
            limits: RunLimits::default(),
            loop_config: LoopConfig::default(),
            on_branch_failure: BranchFailureBehavior::default(),
        }
    }
}

impl RunConfig {
    /// Migrate an older stored config forward to the latest schema.
    ///
    /// v1 → v2: `current_loop_delay_ms` was introduced; older records resume
    /// from the base delay.
    pub fn migrate(mut self) -> Self {
        if self.version < 2 {
            self.loop_config.current_loop_delay_ms = self.loop_config.loop_delay_ms;
        }
        self.version = LATEST_RUN_CONFIG_VERSION;
        self
    }
}
