use serde::{Deserialize, Serialize};
use std::fmt;

use crate::race::StepInfo;

// =============================================================================
// Reward Tuning Knobs
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub finish_bonus: f64,
    pub collision_penalty: f64,
    pub timeout_penalty: f64,
    /// (minimum fraction of top speed, reward), checked in order.
    pub speed_bands: Vec<(f64, f64)>,
    /// Reward below the lowest speed band.
    pub crawl_penalty: f64,
    pub edge_threshold: f64,
    pub edge_penalty: f64,
    pub time_penalty: f64,
    pub obstacle_penalty: f64,
    pub checkpoint_bonus: f64,
    pub backward_penalty: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            finish_bonus: 100.0,
            collision_penalty: -50.0,
            timeout_penalty: -20.0,
            speed_bands: vec![(0.9, 0.9), (0.7, 1.0), (0.4, 0.7), (0.1, 0.3)],
            crawl_penalty: -0.2,
            edge_threshold: 0.15,
            edge_penalty: -0.5,
            time_penalty: -0.01,
            obstacle_penalty: -5.0,
            checkpoint_bonus: 5.0,
            backward_penalty: -10.0,
        }
    }
}

/// Per-component reward for one tick, or summed over an episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub speed: f64,
    pub edge: f64,
    pub time: f64,
    pub obstacle: f64,
    pub finish: f64,
    pub collision: f64,
    pub timeout: f64,
    pub checkpoint: f64,
    pub total: f64,
}

impl RewardBreakdown {
    pub const KEYS: [&'static str; 9] = [
        "speed",
        "edge",
        "time",
        "obstacle",
        "finish",
        "collision",
        "timeout",
        "checkpoint",
        "total",
    ];

    fn with_total(mut self) -> Self {
        self.total = self.speed
            + self.edge
            + self.time
            + self.obstacle
            + self.finish
            + self.collision
            + self.timeout
            + self.checkpoint;
        self
    }

    /// `(key, value)` pairs in `KEYS` order.
    pub fn entries(&self) -> [(&'static str, f64); 9] {
        [
            ("speed", self.speed),
            ("edge", self.edge),
            ("time", self.time),
            ("obstacle", self.obstacle),
            ("finish", self.finish),
            ("collision", self.collision),
            ("timeout", self.timeout),
            ("checkpoint", self.checkpoint),
            ("total", self.total),
        ]
    }

    pub fn accumulate(&mut self, other: &RewardBreakdown) {
        self.speed += other.speed;
        self.edge += other.edge;
        self.time += other.time;
        self.obstacle += other.obstacle;
        self.finish += other.finish;
        self.collision += other.collision;
        self.timeout += other.timeout;
        self.checkpoint += other.checkpoint;
        self.total += other.total;
    }
}

impl fmt::Display for RewardBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key} {value:+.2}")?;
        }
        Ok(())
    }
}

impl RewardConfig {
    /// Shape one tick of one car. Terminal ticks pay only their terminal term.
    pub fn evaluate(&self, info: &StepInfo) -> RewardBreakdown {
        if info.finished {
            return RewardBreakdown {
                finish: self.finish_bonus,
                ..Default::default()
            }
            .with_total();
        }
        if info.collision {
            return RewardBreakdown {
                collision: self.collision_penalty,
                ..Default::default()
            }
            .with_total();
        }
        if info.timeout {
            return RewardBreakdown {
                timeout: self.timeout_penalty,
                ..Default::default()
            }
            .with_total();
        }

        let mut checkpoint = 0.0;
        if info.checkpoint_forward {
            checkpoint += self.checkpoint_bonus;
        }
        if info.checkpoint_backward {
            checkpoint += self.backward_penalty;
        }

        RewardBreakdown {
            speed: self.speed_reward(info),
            edge: if (info.min_ray as f64) < self.edge_threshold {
                self.edge_penalty
            } else {
                0.0
            },
            time: self.time_penalty,
            obstacle: if info.hit_obstacle {
                self.obstacle_penalty
            } else {
                0.0
            },
            checkpoint,
            ..Default::default()
        }
        .with_total()
    }

    fn speed_reward(&self, info: &StepInfo) -> f64 {
        let ratio = if info.max_velocity > 0.0 {
            (info.velocity / info.max_velocity) as f64
        } else {
            0.0
        };
        self.speed_bands
            .iter()
            .find(|(min_ratio, _)| ratio >= *min_ratio)
            .map_or(self.crawl_penalty, |(_, reward)| *reward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cruising(velocity: f32) -> StepInfo {
        StepInfo {
            velocity,
            max_velocity: 6.0,
            min_ray: 1.0,
            ..StepInfo::default()
        }
    }

    #[test]
    fn speed_bands_follow_velocity_ratio() {
        let rc = RewardConfig::default();
        let speed = |v| rc.evaluate(&cruising(v)).speed;
        assert_eq!(speed(6.0), 0.9);
        assert_eq!(speed(5.0), 1.0);
        assert_eq!(speed(3.0), 0.7);
        assert_eq!(speed(1.0), 0.3);
        assert_eq!(speed(0.2), -0.2);
        assert_eq!(speed(-2.0), -0.2);
    }

    #[test]
    fn components_sum_to_total() {
        let rc = RewardConfig::default();
        let info = StepInfo {
            min_ray: 0.1,
            hit_obstacle: true,
            checkpoint_forward: true,
            ..cruising(4.5)
        };
        let r = rc.evaluate(&info);
        assert_eq!(r.edge, -0.5);
        assert_eq!(r.obstacle, -5.0);
        assert_eq!(r.checkpoint, 5.0);
        assert_eq!(r.time, -0.01);
        let sum: f64 = r.entries()[..8].iter().map(|(_, v)| v).sum();
        assert!((sum - r.total).abs() < 1e-12);
    }

    #[test]
    fn terminal_ticks_pay_only_their_term() {
        let rc = RewardConfig::default();
        let finished = rc.evaluate(&StepInfo {
            finished: true,
            ..cruising(6.0)
        });
        assert_eq!(finished.finish, 100.0);
        assert_eq!(finished.total, 100.0);
        assert_eq!(finished.speed, 0.0);

        let crashed = rc.evaluate(&StepInfo {
            collision: true,
            ..cruising(6.0)
        });
        assert_eq!(crashed.total, -50.0);

        let late = rc.evaluate(&StepInfo {
            timeout: true,
            ..cruising(0.0)
        });
        assert_eq!(late.timeout, -20.0);
        assert_eq!(late.total, -20.0);
    }

    #[test]
    fn accumulate_sums_each_key() {
        let rc = RewardConfig::default();
        let mut totals = RewardBreakdown::default();
        for _ in 0..10 {
            totals.accumulate(&rc.evaluate(&cruising(3.0)));
        }
        assert!((totals.speed - 7.0).abs() < 1e-9);
        assert!((totals.time + 0.1).abs() < 1e-9);
        assert!((totals.total - 6.9).abs() < 1e-9);
    }
}
