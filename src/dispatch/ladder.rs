//! Radius escalation for nearest-driver searches

use crate::common::config::DispatchConfig;

/// Sequence of search radii: start, start × growth, ... with the last rung
/// clamped to the maximum. The maximum is never exceeded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusLadder {
    initial_km: f64,
    growth_factor: f64,
    max_km: f64,
}

impl RadiusLadder {
    pub fn new(initial_km: f64, growth_factor: f64, max_km: f64) -> Self {
        Self {
            initial_km: initial_km.min(max_km),
            growth_factor,
            max_km,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            config.initial_radius_km,
            config.growth_factor,
            config.max_radius_km,
        )
    }

    /// Same growth and ceiling, different starting radius
    pub fn starting_at(&self, initial_km: f64) -> Self {
        Self::new(initial_km, self.growth_factor, self.max_km)
    }

    pub fn max_km(&self) -> f64 {
        self.max_km
    }

    pub fn rungs(&self) -> Rungs {
        Rungs {
            next: Some(self.initial_km),
            growth_factor: self.growth_factor,
            max_km: self.max_km,
        }
    }
}

/// Iterator over a ladder's radii
#[derive(Debug, Clone)]
pub struct Rungs {
    next: Option<f64>,
    growth_factor: f64,
    max_km: f64,
}

impl Iterator for Rungs {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        let radius = self.next?;
        let grown = radius * self.growth_factor;
        // a factor <= 1 would never reach the ceiling
        self.next = if radius >= self.max_km || grown <= radius {
            None
        } else {
            Some(grown.min(self.max_km))
        };
        Some(radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ladder() {
        let ladder = RadiusLadder::from_config(&DispatchConfig::default());
        let radii: Vec<f64> = ladder.rungs().collect();
        assert_eq!(radii, vec![5.0, 10.0, 20.0, 40.0]);
    }

    #[test]
    fn test_last_rung_is_clamped() {
        let radii: Vec<f64> = RadiusLadder::new(3.0, 2.0, 20.0).rungs().collect();
        assert_eq!(radii, vec![3.0, 6.0, 12.0, 20.0]);
    }

    #[test]
    fn test_initial_above_max() {
        let radii: Vec<f64> = RadiusLadder::new(100.0, 2.0, 40.0).rungs().collect();
        assert_eq!(radii, vec![40.0]);
    }

    #[test]
    fn test_non_growing_factor_stops() {
        let radii: Vec<f64> = RadiusLadder::new(5.0, 1.0, 40.0).rungs().collect();
        assert_eq!(radii, vec![5.0]);
    }

    #[test]
    fn test_starting_at_keeps_ceiling() {
        let ladder = RadiusLadder::new(5.0, 2.0, 40.0).starting_at(15.0);
        let radii: Vec<f64> = ladder.rungs().collect();
        assert_eq!(radii, vec![15.0, 30.0, 40.0]);
        assert!(radii.iter().all(|r| *r <= ladder.max_km()));
    }
}
