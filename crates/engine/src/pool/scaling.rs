//! Pool resize planning

use serde::{Deserialize, Serialize};

use super::config::AdaptivePoolConfig;

/// Outcome of one adjustment cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResizeDecision {
    ScaleUp { from: usize, to: usize },
    ScaleDown { from: usize, to: usize },
    Hold { workers: usize },
}

impl ResizeDecision {
    /// Worker count after applying the decision
    pub fn target(&self) -> usize {
        match *self {
            Self::ScaleUp { to, .. } | Self::ScaleDown { to, .. } => to,
            Self::Hold { workers } => workers,
        }
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Hold { .. })
    }
}

/// Decide the next worker count from CPU usage and queue depth
///
/// Grows by `scale_up_factor` (rounded up) when CPU has headroom and work is
/// piling up. Shrinks by `scale_down_factor` (rounded down) when CPU is
/// saturated or the queue is nearly empty. The result always lies in
/// `[min_workers, max_workers]`.
pub fn plan_resize(
    current: usize,
    cpu_usage: f64,
    queue_depth: usize,
    config: &AdaptivePoolConfig,
) -> ResizeDecision {
    let (min, max) = (config.min_workers, config.max_workers.max(config.min_workers));

    if current < min {
        return ResizeDecision::ScaleUp {
            from: current,
            to: min,
        };
    }
    if current > max {
        return ResizeDecision::ScaleDown {
            from: current,
            to: max,
        };
    }

    if cpu_usage < config.cpu_threshold_high && queue_depth > config.queue_threshold_high {
        let to = ((current as f64 * config.scale_up_factor).ceil() as usize).clamp(min, max);
        if to > current {
            return ResizeDecision::ScaleUp { from: current, to };
        }
    } else if cpu_usage > config.cpu_threshold_high || queue_depth < config.queue_threshold_low {
        let to = ((current as f64 * config.scale_down_factor).floor() as usize).clamp(min, max);
        if to < current {
            return ResizeDecision::ScaleDown { from: current, to };
        }
    }

    ResizeDecision::Hold { workers: current }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(min: usize, max: usize) -> AdaptivePoolConfig {
        AdaptivePoolConfig::default().with_workers(min, max)
    }

    #[test]
    fn test_scale_up_rounds_up() {
        let decision = plan_resize(3, 20.0, 50, &config(2, 32));
        assert_eq!(decision, ResizeDecision::ScaleUp { from: 3, to: 5 });
    }

    #[test]
    fn test_scale_up_capped_at_max() {
        let decision = plan_resize(6, 20.0, 50, &config(2, 8));
        assert_eq!(decision, ResizeDecision::ScaleUp { from: 6, to: 8 });
        assert_eq!(
            plan_resize(8, 20.0, 50, &config(2, 8)),
            ResizeDecision::Hold { workers: 8 }
        );
    }

    #[test]
    fn test_scale_down_on_high_cpu() {
        let decision = plan_resize(10, 95.0, 50, &config(2, 32));
        assert_eq!(decision, ResizeDecision::ScaleDown { from: 10, to: 8 });
    }

    #[test]
    fn test_scale_down_on_empty_queue_floors_at_min() {
        let decision = plan_resize(3, 10.0, 0, &config(2, 32));
        assert_eq!(decision, ResizeDecision::ScaleDown { from: 3, to: 2 });
        assert_eq!(
            plan_resize(2, 10.0, 0, &config(2, 32)),
            ResizeDecision::Hold { workers: 2 }
        );
    }

    #[test]
    fn test_hold_in_band() {
        let decision = plan_resize(4, 50.0, 5, &config(2, 32));
        assert_eq!(decision, ResizeDecision::Hold { workers: 4 });
        assert!(!decision.is_change());
        assert_eq!(decision.target(), 4);
    }

    #[test]
    fn test_out_of_range_current_is_clamped() {
        assert_eq!(
            plan_resize(1, 50.0, 5, &config(2, 4)),
            ResizeDecision::ScaleUp { from: 1, to: 2 }
        );
        assert_eq!(
            plan_resize(9, 50.0, 5, &config(2, 4)),
            ResizeDecision::ScaleDown { from: 9, to: 4 }
        );
    }

    proptest! {
        #[test]
        fn resize_stays_within_bounds(
            min in 1usize..16,
            extra in 0usize..48,
            signals in prop::collection::vec((0.0f64..=100.0, 0usize..500), 1..64),
        ) {
            let config = config(min, min + extra);
            let mut workers = min;

            for (cpu, depth) in signals {
                workers = plan_resize(workers, cpu, depth, &config).target();
                prop_assert!(workers >= config.min_workers);
                prop_assert!(workers <= config.max_workers);
            }
        }
    }
}
