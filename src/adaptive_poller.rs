//! Interval controller that keeps measured polling latency close to a
//! target, backing off when the BMS is slow/unresponsive and recovering
//! when it is healthy. Ported from the reference `AdaptivePoller` —
//! intentionally pure: no time source, latency is supplied by the caller.

const MIN_LATENCY_TARGET_MS: u32 = 5;
const MIN_INTERVAL_MS: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct AdaptivePollingConfig {
    pub base_interval_ms: u32,
    pub min_interval_ms: u32,
    pub max_interval_ms: u32,
    pub backoff_step_ms: u32,
    pub recovery_step_ms: u32,
    pub latency_target_ms: u32,
    pub latency_slack_ms: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for AdaptivePollingConfig {
    fn default() -> Self {
        AdaptivePollingConfig {
            base_interval_ms: 100,
            min_interval_ms: 50,
            max_interval_ms: 500,
            backoff_step_ms: 50,
            recovery_step_ms: 10,
            latency_target_ms: 50,
            latency_slack_ms: 20,
            failure_threshold: 3,
            success_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PollerState {
    pub interval_ms: u32,
    pub last_latency_ms: u32,
    pub max_latency_ms: u32,
    pub latency_accumulator_ms: u64,
    pub latency_samples: u32,
    pub failure_streak: u32,
    pub success_streak: u32,
}

pub struct AdaptivePoller {
    config: AdaptivePollingConfig,
    state: PollerState,
}

impl AdaptivePoller {
    pub fn new(config: AdaptivePollingConfig) -> Self {
        let mut poller = AdaptivePoller {
            config,
            state: PollerState::default(),
        };
        poller.configure(config);
        poller
    }

    pub fn configure(&mut self, mut config: AdaptivePollingConfig) {
        config.min_interval_ms = config.min_interval_ms.max(MIN_INTERVAL_MS);
        config.max_interval_ms = config.max_interval_ms.max(config.min_interval_ms);
        config.latency_target_ms = config.latency_target_ms.max(MIN_LATENCY_TARGET_MS);
        self.config = config;
        self.state = PollerState {
            interval_ms: config
                .base_interval_ms
                .clamp(config.min_interval_ms, config.max_interval_ms),
            ..Default::default()
        };
    }

    pub fn current_interval_ms(&self) -> u32 {
        self.state.interval_ms
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn average_latency_ms(&self) -> f32 {
        if self.state.latency_samples == 0 {
            0.0
        } else {
            self.state.latency_accumulator_ms as f32 / self.state.latency_samples as f32
        }
    }

    pub fn record_success(&mut self, latency_ms: u32) {
        self.record_sample(latency_ms);
        if self.state.failure_streak > 0 {
            self.state.failure_streak = 0;
        }
        self.state.success_streak += 1;
        self.recover(latency_ms);
        self.clamp_interval();
    }

    pub fn record_failure(&mut self, latency_ms: u32) {
        self.record_sample(latency_ms);
        self.state.success_streak = 0;
        self.state.failure_streak += 1;
        self.backoff(latency_ms);
        self.clamp_interval();
    }

    pub fn record_timeout(&mut self) {
        self.record_failure(self.config.latency_target_ms + self.config.latency_slack_ms);
    }

    fn record_sample(&mut self, latency_ms: u32) {
        self.state.last_latency_ms = latency_ms;
        self.state.max_latency_ms = self.state.max_latency_ms.max(latency_ms);
        self.state.latency_accumulator_ms += latency_ms as u64;
        self.state.latency_samples += 1;
    }

    fn clamp_interval(&mut self) {
        self.state.interval_ms = self
            .state
            .interval_ms
            .clamp(self.config.min_interval_ms, self.config.max_interval_ms);
    }

    fn backoff(&mut self, latency_ms: u32) {
        let slack_target = self.config.latency_target_ms + self.config.latency_slack_ms;
        if latency_ms >= slack_target || self.state.failure_streak >= self.config.failure_threshold {
            let mut delta = self.config.backoff_step_ms;
            if latency_ms > slack_target {
                delta += latency_ms - slack_target;
            }
            self.state.interval_ms =
                (self.state.interval_ms + delta).min(self.config.max_interval_ms);
            self.state.failure_streak = 0;
        }
    }

    fn recover(&mut self, latency_ms: u32) {
        if self.state.interval_ms <= self.config.min_interval_ms {
            return;
        }
        let slack_target = self.config.latency_target_ms + self.config.latency_slack_ms;
        if latency_ms <= slack_target && self.state.success_streak >= self.config.success_threshold
        {
            let mut delta = self.config.recovery_step_ms;
            if latency_ms + self.config.latency_slack_ms < slack_target
                && self.state.interval_ms > self.config.min_interval_ms
            {
                delta += self.config.recovery_step_ms;
            }
            self.state.interval_ms = if self.state.interval_ms > delta {
                self.state.interval_ms - delta
            } else {
                self.config.min_interval_ms
            };
            self.state.success_streak = 0;
        }
    }
}
