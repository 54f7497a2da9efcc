//! Backend priority scaling.

use fleet_core::config::{PriorityScale, RuntimeConfig};

/// Highest logical priority.
pub const MAX_LOGICAL_PRIORITY: u32 = 100;

/// Map a logical priority (0-100) onto the runtime's native priority.
pub fn resolve_priority(logical: u32, runtime: &RuntimeConfig) -> i64 {
    scale_priority(logical, runtime.scale())
}

pub fn scale_priority(logical: u32, scale: PriorityScale) -> i64 {
    let logical = logical.min(MAX_LOGICAL_PRIORITY) as f64;
    match scale {
        PriorityScale::Percentage(p) => (logical * p as f64 / 100.0).round() as i64,
        PriorityScale::Range { min, max } => {
            let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
            (lo as f64 + logical * (hi - lo) as f64 / 100.0).round() as i64
        }
        PriorityScale::Unscaled => logical as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::config::RuntimeType;

    #[test]
    fn test_percentage() {
        assert_eq!(scale_priority(50, PriorityScale::Percentage(40)), 20);
        assert_eq!(scale_priority(33, PriorityScale::Percentage(50)), 17);
        assert_eq!(scale_priority(100, PriorityScale::Percentage(100)), 100);
    }

    #[test]
    fn test_range() {
        let scale = PriorityScale::Range { min: 10, max: 60 };
        assert_eq!(scale_priority(0, scale), 10);
        assert_eq!(scale_priority(50, scale), 35);
        assert_eq!(scale_priority(100, scale), 60);
    }

    #[test]
    fn test_unscaled_and_clamped() {
        assert_eq!(scale_priority(73, PriorityScale::Unscaled), 73);
        assert_eq!(scale_priority(250, PriorityScale::Unscaled), 100);
    }

    #[test]
    fn test_runtime_range_wins_over_percentage() {
        let mut runtime = RuntimeConfig::new("lava", RuntimeType::Lava);
        runtime.priority = Some(10);
        runtime.priority_min = Some(0);
        runtime.priority_max = Some(1000);
        assert_eq!(resolve_priority(50, &runtime), 500);
    }

    #[test]
    fn test_monotonic_and_bounded() {
        let scales = [
            PriorityScale::Percentage(37),
            PriorityScale::Range { min: -20, max: 45 },
            PriorityScale::Range { min: 90, max: 10 },
            PriorityScale::Unscaled,
        ];
        for scale in scales {
            let (lo, hi) = match scale {
                PriorityScale::Range { min, max } => (min.min(max), min.max(max)),
                PriorityScale::Percentage(p) => (0, p as i64),
                PriorityScale::Unscaled => (0, 100),
            };
            let mut previous = i64::MIN;
            for logical in 0..=100 {
                let resolved = scale_priority(logical, scale);
                assert!(resolved >= previous, "{:?} not monotonic at {}", scale, logical);
                assert!((lo..=hi).contains(&resolved), "{:?} out of range at {}", scale, logical);
                previous = resolved;
            }
        }
    }
}
