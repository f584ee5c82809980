//! Configuration system.
//!
//! Loads renderer configuration from JSON strings/files (file IO left to app).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::ClearColor;

/// Scope of the frame time budget when several displays own interruptible buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// One budget per tick, consumed across displays in registration order.
    /// An interrupted pass stops interruptible rendering on all later displays.
    #[default]
    Global,
    /// Each display starts a fresh budget; interruption only stops its own display.
    PerDisplay,
}

/// Root renderer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Tick rate of the host loop.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Time allowance for interruptible rendering per tick, in microseconds.
    #[serde(default = "default_frame_budget_us")]
    pub frame_budget_us: u64,
    #[serde(default)]
    pub budget_scope: BudgetScope,
    /// When false every buffer is re-rendered every tick.
    #[serde(default = "default_skip_unmodified_buffers")]
    pub skip_unmodified_buffers: bool,
    #[serde(default)]
    pub default_clear_color: ClearColor,
    /// Ticks between loop time reports; 0 disables them.
    #[serde(default)]
    pub loop_time_report_period: u32,
}

fn default_tick_hz() -> u32 {
    60
}

fn default_frame_budget_us() -> u64 {
    10_000
}

fn default_skip_unmodified_buffers() -> bool {
    true
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            tick_hz: default_tick_hz(),
            frame_budget_us: default_frame_budget_us(),
            budget_scope: BudgetScope::default(),
            skip_unmodified_buffers: default_skip_unmodified_buffers(),
            default_clear_color: ClearColor::default(),
            loop_time_report_period: 0,
        }
    }
}

impl RendererConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn frame_budget(&self) -> Duration {
        Duration::from_micros(self.frame_budget_us)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let cfg = RendererConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, RendererConfig::default());
        assert_eq!(cfg.frame_budget(), Duration::from_millis(10));
    }

    #[test]
    fn parses_budget_scope_and_overrides() {
        let cfg = RendererConfig::from_json_str(
            r#"{ "tick_hz": 30, "budget_scope": "per_display", "skip_unmodified_buffers": false,
                 "default_clear_color": { "r": 1.0, "g": 0.0, "b": 0.0, "a": 1.0 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.tick_hz, 30);
        assert_eq!(cfg.budget_scope, BudgetScope::PerDisplay);
        assert!(!cfg.skip_unmodified_buffers);
        assert_eq!(cfg.default_clear_color, ClearColor::rgba(1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn tick_interval_never_divides_by_zero() {
        let cfg = RendererConfig {
            tick_hz: 0,
            ..Default::default()
        };
        assert_eq!(cfg.tick_interval(), Duration::from_secs(1));
    }
}
