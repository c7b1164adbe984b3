//! Sample aggregator - folds one agent's trajectory into training records
//!
//! Steps are buffered until a flush, then walked in reverse to compute generalized
//! advantage estimates per reward component:
//!
//! ```text
//! delta = clip(reward) + gamma * next_value - value
//! gae   = delta + gamma * lambda * gae
//! ```
//!
//! A mid-episode flush holds back the newest step, since its successor's value is not
//! known yet, and carries it into the next chunk. Processed steps are then cut into
//! fixed-length windows. Mid-episode, a tail shorter than a window waits for the next
//! flush; at episode end it borrows already-emitted steps as padding (`mask = 0`)
//! instead of zero-filling.
//!
//! Steps produced by a model older than the freshest one the agent has seen are stale
//! and are kept only with probability `stale_keep_rate`.

use std::collections::VecDeque;

use rand::Rng;
use relay_common::{AggregatorError, Tensor, TrainingRecord};
use serde::{Deserialize, Serialize};

/// Field names written into every record
pub mod fields {
    pub const OBSERVATION: &str = "observation";
    pub const ACTION: &str = "action";
    pub const ACTION_LOG_PROB: &str = "action_log_prob";
    pub const VALUE: &str = "value";
    pub const ADVANTAGE: &str = "advantage";
    pub const RETURN: &str = "return";
    pub const MASK: &str = "mask";
    pub const RECURRENT_STATE: &str = "recurrent_state";
}

/// One decision point of an episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub step_index: u64,
    pub observation: Vec<f32>,
    pub action: Vec<f32>,
    /// One component per sub-objective
    pub reward: Vec<f32>,
    /// Value estimate, same width as `reward`
    pub value: Vec<f32>,
    pub action_log_prob: f32,
    pub done: bool,
    pub recurrent_state: Option<Vec<f32>>,
    /// Training step of the model that chose the action
    #[serde(default)]
    pub model_step: u64,
}

/// Reduction of the per-component advantage to the scalar the policy loss uses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvantageProjection {
    #[default]
    Sum,
    Weighted(Vec<f32>),
    Component(usize),
}

impl AdvantageProjection {
    fn check(&self, components: usize) -> Result<(), AggregatorError> {
        match self {
            AdvantageProjection::Sum => Ok(()),
            AdvantageProjection::Weighted(w) if w.len() == components => Ok(()),
            AdvantageProjection::Weighted(w) => Err(AggregatorError::ShapeMismatch {
                field: "projection weights",
                expected: components,
                actual: w.len(),
            }),
            AdvantageProjection::Component(i) if *i < components => Ok(()),
            AdvantageProjection::Component(i) => Err(AggregatorError::InvalidConfig(format!(
                "projection component {i} out of range for {components} reward components"
            ))),
        }
    }

    pub fn project(&self, advantage: &[f32]) -> f32 {
        match self {
            AdvantageProjection::Sum => advantage.iter().sum(),
            AdvantageProjection::Weighted(w) => advantage.iter().zip(w).map(|(a, w)| a * w).sum(),
            AdvantageProjection::Component(i) => advantage.get(*i).copied().unwrap_or(0.0),
        }
    }
}

/// Aggregator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Discount per reward component; a single entry applies to all
    pub gamma: Vec<f32>,
    /// GAE lambda per reward component; a single entry applies to all
    pub lambda: Vec<f32>,
    /// Rewards are clipped to `[-reward_clip, reward_clip]`
    pub reward_clip: f32,
    /// Steps per record; 1 for non-recurrent policies
    pub window: usize,
    /// Buffered steps that trigger a mid-episode flush
    pub send_sample_size: usize,
    pub projection: AdvantageProjection,
    /// Probability of keeping a step from an outdated model; 0 drops them all
    pub stale_keep_rate: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            gamma: vec![0.997],
            lambda: vec![0.95],
            reward_clip: 100.0,
            window: 1,
            send_sample_size: 128,
            projection: AdvantageProjection::Sum,
            stale_keep_rate: 0.0,
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), AggregatorError> {
        if self.window == 0 {
            return Err(AggregatorError::InvalidConfig("window must be at least 1".into()));
        }
        if self.send_sample_size == 0 {
            return Err(AggregatorError::InvalidConfig(
                "send_sample_size must be at least 1".into(),
            ));
        }
        if self.gamma.is_empty() || self.lambda.is_empty() {
            return Err(AggregatorError::InvalidConfig("gamma and lambda must not be empty".into()));
        }
        if self.reward_clip.is_nan() || self.reward_clip <= 0.0 {
            return Err(AggregatorError::InvalidConfig(format!(
                "reward_clip must be positive, got {}",
                self.reward_clip
            )));
        }
        if !(0.0..=1.0).contains(&self.stale_keep_rate) {
            return Err(AggregatorError::InvalidConfig(format!(
                "stale_keep_rate must be within [0, 1], got {}",
                self.stale_keep_rate
            )));
        }
        Ok(())
    }

    fn per_component(values: &[f32], name: &'static str, components: usize) -> Result<Vec<f32>, AggregatorError> {
        match values.len() {
            1 => Ok(vec![values[0]; components]),
            n if n == components => Ok(values.to_vec()),
            n => Err(AggregatorError::ShapeMismatch {
                field: name,
                expected: components,
                actual: n,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StepShape {
    observation: usize,
    action: usize,
    components: usize,
}

#[derive(Debug, Clone)]
struct ProcessedStep {
    step: TrajectoryStep,
    advantage: f32,
    returns: Vec<f32>,
}

/// Per-agent trajectory buffer and GAE processor
#[derive(Debug)]
pub struct SampleAggregator {
    config: AggregatorConfig,
    shape: Option<StepShape>,
    gamma: Vec<f32>,
    lambda: Vec<f32>,
    pending: Vec<TrajectoryStep>,
    /// Processed steps waiting for enough successors to fill a window
    ready: Vec<ProcessedStep>,
    history: VecDeque<ProcessedStep>,
    last_index: Option<u64>,
    /// Freshest model step seen; older steps are stale
    model_step: u64,
    dropped_steps: u64,
    stale_steps: u64,
    episode_reward: f64,
}

impl SampleAggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self, AggregatorError> {
        config.validate()?;
        Ok(Self {
            config,
            shape: None,
            gamma: Vec::new(),
            lambda: Vec::new(),
            pending: Vec::new(),
            ready: Vec::new(),
            history: VecDeque::new(),
            last_index: None,
            model_step: 0,
            dropped_steps: 0,
            stale_steps: 0,
            episode_reward: 0.0,
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Steps buffered and not yet turned into records
    pub fn pending_len(&self) -> usize {
        self.pending.len() + self.ready.len()
    }

    /// Whether enough steps are buffered for a mid-episode flush
    pub fn should_flush(&self) -> bool {
        self.pending.len() >= self.config.send_sample_size
    }

    /// Steps discarded because no complete window could be formed
    pub fn dropped_steps(&self) -> u64 {
        self.dropped_steps
    }

    /// Steps discarded because an outdated model produced them
    pub fn stale_steps(&self) -> u64 {
        self.stale_steps
    }

    /// Sum of clipped rewards over the current episode
    pub fn episode_reward(&self) -> f64 {
        self.episode_reward
    }

    pub fn model_step(&self) -> u64 {
        self.model_step
    }

    /// Raise the model step below which buffered and future steps are stale
    pub fn observe_model_step(&mut self, step: u64) {
        self.model_step = self.model_step.max(step);
    }

    /// Buffer a step; step indices must strictly increase
    pub fn push(&mut self, mut step: TrajectoryStep) -> Result<(), AggregatorError> {
        if let Some(last) = self.last_index {
            if step.step_index <= last {
                return Err(AggregatorError::OutOfOrder {
                    last,
                    got: step.step_index,
                });
            }
        }
        self.check_shape(&step)?;

        let clip = self.config.reward_clip;
        for r in &mut step.reward {
            *r = r.clamp(-clip, clip);
        }
        self.episode_reward += step.reward.iter().map(|r| *r as f64).sum::<f64>();
        self.last_index = Some(step.step_index);
        self.observe_model_step(step.model_step);
        self.pending.push(step);
        Ok(())
    }

    fn check_shape(&mut self, step: &TrajectoryStep) -> Result<(), AggregatorError> {
        let shape = match self.shape {
            Some(shape) => shape,
            None => {
                let components = step.reward.len();
                if components == 0 {
                    return Err(AggregatorError::ShapeMismatch {
                        field: "reward",
                        expected: 1,
                        actual: 0,
                    });
                }
                self.gamma = AggregatorConfig::per_component(&self.config.gamma, "gamma", components)?;
                self.lambda = AggregatorConfig::per_component(&self.config.lambda, "lambda", components)?;
                self.config.projection.check(components)?;
                let shape = StepShape {
                    observation: step.observation.len(),
                    action: step.action.len(),
                    components,
                };
                self.shape = Some(shape);
                shape
            }
        };

        let checks: [(&'static str, usize, usize); 4] = [
            ("observation", shape.observation, step.observation.len()),
            ("action", shape.action, step.action.len()),
            ("reward", shape.components, step.reward.len()),
            ("value", shape.components, step.value.len()),
        ];
        for (field, expected, actual) in checks {
            if expected != actual {
                return Err(AggregatorError::ShapeMismatch {
                    field,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Mid-episode flush: every buffered step except the newest becomes training data
    pub fn flush(&mut self) -> Result<Vec<TrainingRecord>, AggregatorError> {
        if self.pending.last().is_some_and(|s| s.done) {
            return self.finish();
        }
        if self.pending.len() < 2 {
            return Ok(Vec::new());
        }
        let carried = self.pending.split_off(self.pending.len() - 1);
        let bootstrap = carried[0].value.clone();
        let steps = std::mem::replace(&mut self.pending, carried);
        let steps = self.drop_stale(steps);
        let processed = self.compute_advantages(steps, Some(&bootstrap));
        self.emit(processed, false)
    }

    /// End of episode: every buffered step becomes training data and the
    /// aggregator is ready for the next episode
    pub fn finish(&mut self) -> Result<Vec<TrainingRecord>, AggregatorError> {
        let steps = std::mem::take(&mut self.pending);
        let steps = self.drop_stale(steps);
        let processed = self.compute_advantages(steps, None);
        let records = self.emit(processed, true);
        self.ready.clear();
        self.history.clear();
        self.last_index = None;
        self.episode_reward = 0.0;
        records
    }

    /// Reverse GAE over `steps`; `bootstrap` is the value after the last step, or
    /// `None` when the episode ends there
    fn compute_advantages(&self, steps: Vec<TrajectoryStep>, bootstrap: Option<&[f32]>) -> Vec<ProcessedStep> {
        let components = self.gamma.len();
        let mut gae = vec![0.0f32; components];
        let mut next_value = match bootstrap {
            Some(v) => v.to_vec(),
            None => vec![0.0; components],
        };

        let mut processed: Vec<ProcessedStep> = Vec::with_capacity(steps.len());
        for step in steps.into_iter().rev() {
            if step.done {
                next_value.iter_mut().for_each(|v| *v = 0.0);
                gae.iter_mut().for_each(|g| *g = 0.0);
            }
            let mut returns = Vec::with_capacity(components);
            for c in 0..components {
                let delta = step.reward[c] + self.gamma[c] * next_value[c] - step.value[c];
                gae[c] = delta + self.gamma[c] * self.lambda[c] * gae[c];
                returns.push(gae[c] + step.value[c]);
            }
            let advantage = self.config.projection.project(&gae);
            next_value.copy_from_slice(&step.value);
            processed.push(ProcessedStep {
                step,
                advantage,
                returns,
            });
        }
        processed.reverse();
        processed
    }

    /// Keep fresh steps, and stale ones with probability `stale_keep_rate`
    fn drop_stale(&mut self, steps: Vec<TrajectoryStep>) -> Vec<TrajectoryStep> {
        let before = steps.len();
        let freshest = self.model_step;
        let keep_rate = self.config.stale_keep_rate;
        let mut rng = rand::thread_rng();
        let kept: Vec<TrajectoryStep> = steps
            .into_iter()
            .filter(|s| s.model_step >= freshest || rng.gen::<f64>() < keep_rate)
            .collect();
        self.stale_steps += (before - kept.len()) as u64;
        kept
    }

    /// Cut processed steps into windows. Mid-episode, a short tail is held in `ready`;
    /// at episode end it is padded from history or dropped.
    fn emit(&mut self, processed: Vec<ProcessedStep>, episode_end: bool) -> Result<Vec<TrainingRecord>, AggregatorError> {
        let window = self.config.window;
        let padding = self.history.len();

        let mut combined: Vec<ProcessedStep> = self.history.drain(..).collect();
        combined.append(&mut self.ready);
        combined.extend(processed);

        let mut records = Vec::with_capacity((combined.len() - padding) / window + 1);
        let mut start = padding;
        while start + window <= combined.len() {
            records.push(build_record(&combined[start..start + window], 0)?);
            start += window;
        }

        let tail = combined.len() - start;
        if tail > 0 {
            if !episode_end {
                self.ready = combined.split_off(start);
            } else if combined.len() >= window {
                let begin = combined.len() - window;
                records.push(build_record(&combined[begin..], window - tail)?);
            } else {
                self.dropped_steps += tail as u64;
            }
        }

        let keep = window.saturating_sub(1).min(combined.len());
        self.history.extend(combined.drain(combined.len() - keep..));
        Ok(records)
    }
}

fn rows<'a>(window: &'a [ProcessedStep], f: impl Fn(&'a ProcessedStep) -> &'a [f32]) -> Vec<&'a [f32]> {
    window.iter().map(f).collect()
}

fn column(window: &[ProcessedStep], f: impl Fn(usize, &ProcessedStep) -> f32) -> Tensor {
    Tensor::vector(window.iter().enumerate().map(|(i, p)| f(i, p)).collect())
}

/// Pack a window into a record; the first `padded` steps were already emitted
fn build_record(window: &[ProcessedStep], padded: usize) -> Result<TrainingRecord, AggregatorError> {
    let mut record = TrainingRecord::new()
        .with_field(
            fields::OBSERVATION,
            Tensor::stack(&rows(window, |p| p.step.observation.as_slice()))?,
        )
        .with_field(fields::ACTION, Tensor::stack(&rows(window, |p| p.step.action.as_slice()))?)
        .with_field(fields::VALUE, Tensor::stack(&rows(window, |p| p.step.value.as_slice()))?)
        .with_field(fields::RETURN, Tensor::stack(&rows(window, |p| p.returns.as_slice()))?)
        .with_field(fields::ACTION_LOG_PROB, column(window, |_, p| p.step.action_log_prob))
        .with_field(fields::ADVANTAGE, column(window, |_, p| p.advantage))
        .with_field(fields::MASK, column(window, |i, _| if i < padded { 0.0 } else { 1.0 }))
        .with_row_ids(window.iter().map(|p| p.step.step_index).collect());

    if let Some(state) = window.first().and_then(|p| p.step.recurrent_state.clone()) {
        record.insert(fields::RECURRENT_STATE, Tensor::vector(state));
    }
    Ok(record)
}
