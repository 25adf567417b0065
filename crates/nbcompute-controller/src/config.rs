use std::time::Duration;

use nbcompute_control_plane::InstanceSpec;

use crate::poll::{BackoffPolicy, MAX_DEADLINE_SPAN};

const DEFAULT_POLL_BASE_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_POLL_MULTIPLIER: f64 = 2.0;
const DEFAULT_POLL_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_PROVISIONING_DEADLINE: Duration = Duration::from_secs(3600);
const DEFAULT_TEARDOWN_DEADLINE: Duration = Duration::from_secs(600);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);
const DEFAULT_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_PROGRESS_WINDOW: Duration = Duration::from_secs(240);

const MIN_POLL_BASE_DELAY: Duration = Duration::from_millis(10);
const MIN_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub backoff: BackoffPolicy,
    /// Upper bound on create + attach + reachability wait.
    pub provisioning_deadline: Duration,
    /// Upper bound on delete + the wait for the instance to disappear.
    pub teardown_deadline: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy {
                base_delay: DEFAULT_POLL_BASE_DELAY,
                multiplier: DEFAULT_POLL_MULTIPLIER,
                max_delay: DEFAULT_POLL_MAX_DELAY,
            },
            provisioning_deadline: DEFAULT_PROVISIONING_DEADLINE,
            teardown_deadline: DEFAULT_TEARDOWN_DEADLINE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub instance: InstanceSpec,
    pub poll: PollConfig,
    /// Running sessions with no activity for this long are stopped by the sweep.
    pub idle_timeout: Duration,
    pub idle_sweep_interval: Duration,
    /// Span over which waiting-for-reachability progress climbs from 30% to 70%.
    pub progress_window: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instance: InstanceSpec::default(),
            poll: PollConfig::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            idle_sweep_interval: DEFAULT_IDLE_SWEEP_INTERVAL,
            progress_window: DEFAULT_PROGRESS_WINDOW,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `NBCOMPUTE_*` keys resolved through `lookup`; blank or
    /// unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let u64_of = |key: &str| string(key).and_then(|raw| raw.parse::<u64>().ok());
        let secs = |key: &str, default: Duration| {
            u64_of(key).map(Duration::from_secs).unwrap_or(default)
        };
        let millis = |key: &str, default: Duration| {
            u64_of(key).map(Duration::from_millis).unwrap_or(default)
        };

        let defaults = Self::default();
        let instance = InstanceSpec {
            instance_size: string("NBCOMPUTE_INSTANCE_SIZE")
                .unwrap_or(defaults.instance.instance_size),
            image: string("NBCOMPUTE_IMAGE").unwrap_or(defaults.instance.image),
            share_ref: string("NBCOMPUTE_SHARE_REF"),
            assigned_user_id: string("NBCOMPUTE_ASSIGNED_USER_ID"),
        };
        let poll = PollConfig {
            backoff: BackoffPolicy {
                base_delay: millis(
                    "NBCOMPUTE_POLL_BASE_DELAY_MS",
                    defaults.poll.backoff.base_delay,
                ),
                multiplier: string("NBCOMPUTE_POLL_MULTIPLIER")
                    .and_then(|raw| raw.parse::<f64>().ok())
                    .unwrap_or(defaults.poll.backoff.multiplier),
                max_delay: millis(
                    "NBCOMPUTE_POLL_MAX_DELAY_MS",
                    defaults.poll.backoff.max_delay,
                ),
            },
            provisioning_deadline: secs(
                "NBCOMPUTE_PROVISIONING_DEADLINE_SECS",
                defaults.poll.provisioning_deadline,
            ),
            teardown_deadline: secs(
                "NBCOMPUTE_TEARDOWN_DEADLINE_SECS",
                defaults.poll.teardown_deadline,
            ),
        };

        Self {
            instance,
            poll,
            idle_timeout: secs("NBCOMPUTE_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            idle_sweep_interval: secs(
                "NBCOMPUTE_IDLE_SWEEP_INTERVAL_SECS",
                defaults.idle_sweep_interval,
            ),
            progress_window: secs("NBCOMPUTE_PROGRESS_WINDOW_SECS", defaults.progress_window),
        }
        .normalized()
    }

    /// Clamps values that would make polling spin, never back off, or push a
    /// deadline past what an `Instant` can hold.
    pub fn normalized(mut self) -> Self {
        let backoff = &mut self.poll.backoff;
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            backoff.multiplier = 1.0;
        }
        backoff.base_delay = backoff.base_delay.clamp(MIN_POLL_BASE_DELAY, MAX_DEADLINE_SPAN);
        backoff.max_delay = backoff
            .max_delay
            .clamp(backoff.base_delay, MAX_DEADLINE_SPAN);
        self.poll.provisioning_deadline = self.poll.provisioning_deadline.min(MAX_DEADLINE_SPAN);
        self.poll.teardown_deadline = self.poll.teardown_deadline.min(MAX_DEADLINE_SPAN);
        self.idle_timeout = self.idle_timeout.min(MAX_DEADLINE_SPAN);
        self.idle_sweep_interval = self
            .idle_sweep_interval
            .clamp(MIN_IDLE_SWEEP_INTERVAL, MAX_DEADLINE_SPAN);
        self
    }
}
