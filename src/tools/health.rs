//! 工具健康度：滚动窗口内的全局与单工具错误率

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

/// 计算错误率前窗口内至少需要的样本数
const MIN_SAMPLES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
struct HealthSample {
    tool_name: String,
    success: bool,
    recovered: bool,
}

/// 健康度汇总
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub window_error_rate: f64,
    pub per_tool_error_rate: HashMap<String, f64>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_recovered: u64,
}

/// 滚动窗口健康度
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    window: VecDeque<HealthSample>,
    window_size: usize,
    error_threshold: f64,
    total_calls: u64,
    total_failures: u64,
    total_recovered: u64,
}

impl HealthMetrics {
    pub fn new(window_size: usize, error_threshold: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            error_threshold,
            total_calls: 0,
            total_failures: 0,
            total_recovered: 0,
        }
    }

    pub fn record(&mut self, tool_name: &str, success: bool, recovered: bool) {
        self.total_calls += 1;
        if !success {
            self.total_failures += 1;
        }
        if recovered {
            self.total_recovered += 1;
        }
        self.window.push_back(HealthSample {
            tool_name: tool_name.to_string(),
            success,
            recovered,
        });
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
    }

    /// 窗口内全局错误率
    pub fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|s| !s.success).count();
        failures as f64 / self.window.len() as f64
    }

    pub fn tool_error_rate(&self, tool_name: &str) -> Option<f64> {
        let samples: Vec<&HealthSample> = self
            .window
            .iter()
            .filter(|s| s.tool_name == tool_name)
            .collect();
        if samples.is_empty() {
            return None;
        }
        let failures = samples.iter().filter(|s| !s.success).count();
        Some(failures as f64 / samples.len() as f64)
    }

    /// 错误率超过阈值时的提示文本
    pub fn warning(&self) -> Option<String> {
        if self.window.len() < MIN_SAMPLES {
            return None;
        }
        let rate = self.error_rate();
        (rate > self.error_threshold).then(|| {
            format!(
                "Tool health degraded: {:.0}% of the last {} tool calls failed. \
                 Re-read the current state and simplify the next step.",
                rate * 100.0,
                self.window.len()
            )
        })
    }

    pub fn report(&self) -> HealthReport {
        let mut names: Vec<&str> = self.window.iter().map(|s| s.tool_name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        let per_tool_error_rate = names
            .into_iter()
            .filter_map(|n| self.tool_error_rate(n).map(|r| (n.to_string(), r)))
            .collect();
        HealthReport {
            window_error_rate: self.error_rate(),
            per_tool_error_rate,
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            total_recovered: self.total_recovered,
        }
    }
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::new(20, 0.3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_warning_below_min_samples() {
        let mut h = HealthMetrics::default();
        h.record("a", false, false);
        h.record("a", false, false);
        assert_eq!(h.error_rate(), 1.0);
        assert!(h.warning().is_none());
    }

    #[test]
    fn test_warning_above_threshold() {
        let mut h = HealthMetrics::default();
        for _ in 0..3 {
            h.record("read_instance", true, false);
        }
        for _ in 0..2 {
            h.record("edit_script", false, false);
        }
        assert!((h.error_rate() - 0.4).abs() < f64::EPSILON);
        assert!(h.warning().unwrap().contains("40%"));
        assert_eq!(h.tool_error_rate("edit_script"), Some(1.0));
        assert_eq!(h.tool_error_rate("read_instance"), Some(0.0));
        assert_eq!(h.tool_error_rate("missing"), None);
    }

    #[test]
    fn test_window_rolls_but_totals_accumulate() {
        let mut h = HealthMetrics::new(4, 0.3);
        for _ in 0..4 {
            h.record("a", false, false);
        }
        for _ in 0..4 {
            h.record("a", true, true);
        }
        assert_eq!(h.error_rate(), 0.0);
        let report = h.report();
        assert_eq!(report.total_calls, 8);
        assert_eq!(report.total_failures, 4);
        assert_eq!(report.total_recovered, 4);
    }
}
