//! Engine configuration.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Every knob the consensus engine recognizes.
///
/// Assembled once at startup from compiled defaults plus operator overrides
/// and never mutated after the engine starts.
#[derive(Debug, Clone)]
pub struct Parameters {
    /// Sample size per poll.
    pub k: usize,

    /// Votes within a sample needed for a successful poll. Must satisfy
    /// `k/2 < alpha <= k`.
    pub alpha: usize,

    /// Consecutive successful polls to finalize a conflict-free item.
    pub beta_virtuous: usize,

    /// Consecutive successful polls to finalize an item with conflicts.
    pub beta_rogue: usize,

    /// Simultaneous outstanding polls per chain.
    pub concurrent_repolls: usize,

    /// Undecided-vertex count above which issuance applies back-pressure.
    pub optimal_processing: usize,

    /// Hard cap on undecided vertices.
    pub max_outstanding_items: usize,

    /// Watchdog interval after which an undecided vertex is logged as stuck.
    pub max_item_processing_time: Duration,

    /// Starting value for the adaptive poll timeout.
    pub poll_timeout: Duration,

    /// Band the adaptive poll timeout is clamped to.
    pub poll_timeout_min: Duration,
    pub poll_timeout_max: Duration,

    /// Connected stake weight required before bootstrap completes.
    pub startup_alpha: u64,

    /// Earliest wall-clock instant at which a stop vertex may be issued.
    pub stop_vertex_activation: DateTime<Utc>,

    /// Consecutive unanswered polls before a validator is benched.
    pub bench_threshold: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 15,
            beta_virtuous: 15,
            beta_rogue: 20,
            concurrent_repolls: 4,
            optimal_processing: 50,
            max_outstanding_items: 1024,
            max_item_processing_time: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(2),
            poll_timeout_min: Duration::from_millis(500),
            poll_timeout_max: Duration::from_secs(10),
            startup_alpha: 0,
            stop_vertex_activation: Utc.timestamp_opt(0, 0).unwrap(),
            bench_threshold: 5,
        }
    }
}

impl Parameters {
    /// Shorthand for tests and small networks: one outstanding poll, the
    /// given thresholds, everything else at the defaults.
    #[must_use]
    pub fn new(k: usize, alpha: usize, beta_virtuous: usize, beta_rogue: usize) -> Self {
        Self {
            k,
            alpha,
            beta_virtuous,
            beta_rogue,
            concurrent_repolls: 1,
            ..Default::default()
        }
    }

    /// Checks the cross-field constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.k == 0 {
            return Err("k must be positive".into());
        }
        if self.alpha <= self.k / 2 {
            return Err(format!(
                "alpha must be a majority of the sample: alpha = {}, k = {}",
                self.alpha, self.k
            ));
        }
        if self.alpha > self.k {
            return Err(format!(
                "alpha cannot exceed the sample size: alpha = {}, k = {}",
                self.alpha, self.k
            ));
        }
        if self.beta_virtuous == 0 {
            return Err("beta_virtuous must be positive".into());
        }
        if self.beta_rogue < self.beta_virtuous {
            return Err(format!(
                "beta_rogue ({}) below beta_virtuous ({})",
                self.beta_rogue, self.beta_virtuous
            ));
        }
        if self.concurrent_repolls == 0 || self.concurrent_repolls > self.beta_rogue {
            return Err(format!(
                "concurrent_repolls ({}) outside [1, beta_rogue = {}]",
                self.concurrent_repolls, self.beta_rogue
            ));
        }
        if self.optimal_processing == 0 || self.max_outstanding_items < self.optimal_processing {
            return Err("processing bounds inverted".into());
        }
        if self.poll_timeout_min > self.poll_timeout_max {
            return Err("poll timeout band inverted".into());
        }
        Ok(())
    }
}
