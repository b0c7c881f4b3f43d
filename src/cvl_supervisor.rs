//! State machine over SOC/imbalance plus a proportional cell-overvoltage
//! guard. Ported from the reference `computeCvlLimits()` / cell-protection
//! logic, including the exact guard constants (Kp=150, 3.65V cutoff, 3.50V
//! safety threshold, 3.20V minimum float).

use crate::config::CvlConfig;
use std::time::Instant;

const VCELL_CUTOFF_V: f32 = 3.65;
const VCELL_SAFETY_THRESHOLD_V: f32 = 3.50;
const VCELL_MIN_FLOAT_V: f32 = 3.20;
const KP_GAIN: f32 = 150.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvlState {
    Bulk,
    Transition,
    FloatApproach,
    Float,
    ImbalanceHold,
}

#[derive(Debug, Clone, Copy)]
pub struct CvlInputs {
    pub soc_percent: f32,
    pub cell_imbalance_mv: u16,
    pub base_ccl_a: f32,
    pub base_dcl_a: f32,
    pub max_cell_voltage_v: f32,
    pub series_cell_count: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct ComputedLimits {
    pub state: CvlState,
    pub cvl_v: f32,
    pub ccl_a: f32,
    pub dcl_a: f32,
    pub imbalance_hold_active: bool,
}

const FLOAT_APPROACH_RELAPSE_MARGIN: f32 = 0.25;

pub struct CvlSupervisor {
    state: CvlState,
    state_entered_at: Instant,
}

impl CvlSupervisor {
    pub fn new() -> Self {
        CvlSupervisor {
            state: CvlState::Bulk,
            state_entered_at: Instant::now(),
        }
    }

    pub fn state(&self) -> CvlState {
        self.state
    }

    /// Evaluates one cycle. Returns the computed limits and, if the state
    /// changed, `Some(duration_in_old_state)` for a `CVLStateChanged` event.
    pub fn evaluate(
        &mut self,
        inputs: &CvlInputs,
        config: &CvlConfig,
    ) -> (ComputedLimits, Option<std::time::Duration>) {
        if !config.enabled {
            let limits = ComputedLimits {
                state: CvlState::Bulk,
                cvl_v: config.bulk_target_v.max(0.0),
                ccl_a: inputs.base_ccl_a.max(0.0),
                dcl_a: inputs.base_dcl_a.max(0.0),
                imbalance_hold_active: false,
            };
            return (limits, None);
        }

        let next_state = self.next_state(inputs, config);
        let changed = next_state != self.state;

        let duration = if changed {
            let elapsed = self.state_entered_at.elapsed();
            self.state = next_state;
            self.state_entered_at = Instant::now();
            Some(elapsed)
        } else {
            None
        };

        let bulk_target = config.bulk_target_v.max(0.0);
        let mut float_approach_v =
            (bulk_target - config.float_approach_offset_mv / 1000.0).max(0.0);
        let mut float_v = (bulk_target - config.float_offset_mv / 1000.0).max(0.0);
        if float_v > float_approach_v {
            std::mem::swap(&mut float_v, &mut float_approach_v);
        }

        let v_min_pack = VCELL_MIN_FLOAT_V * inputs.series_cell_count as f32;

        let (state_cvl, ccl, dcl) = match self.state {
            CvlState::Bulk | CvlState::Transition => (bulk_target, inputs.base_ccl_a, inputs.base_dcl_a),
            CvlState::FloatApproach => (float_approach_v, inputs.base_ccl_a, inputs.base_dcl_a),
            CvlState::Float => {
                let ccl = if config.minimum_ccl_in_float_a > 0.0 {
                    inputs.base_ccl_a.min(config.minimum_ccl_in_float_a)
                } else {
                    inputs.base_ccl_a
                };
                (float_v, ccl, inputs.base_dcl_a)
            }
            CvlState::ImbalanceHold => (
                (bulk_target - 1.0).max(v_min_pack),
                inputs.base_ccl_a,
                inputs.base_dcl_a,
            ),
        };

        let protection_cvl = self.protection_cvl(inputs, v_min_pack);
        let final_cvl = state_cvl.min(protection_cvl).max(0.0);

        let limits = ComputedLimits {
            state: self.state,
            cvl_v: final_cvl,
            ccl_a: ccl.max(0.0),
            dcl_a: dcl.max(0.0),
            imbalance_hold_active: self.state == CvlState::ImbalanceHold,
        };

        (limits, duration)
    }

    fn protection_cvl(&self, inputs: &CvlInputs, v_min_pack: f32) -> f32 {
        let v_absmax = VCELL_CUTOFF_V * inputs.series_cell_count as f32;
        let raw = if inputs.max_cell_voltage_v <= VCELL_SAFETY_THRESHOLD_V {
            v_absmax
        } else {
            v_absmax - KP_GAIN * (inputs.max_cell_voltage_v - VCELL_SAFETY_THRESHOLD_V)
        };
        raw.clamp(v_min_pack, v_absmax)
    }

    fn next_state(&self, inputs: &CvlInputs, config: &CvlConfig) -> CvlState {
        // Imbalance override dominates from any state.
        if inputs.cell_imbalance_mv > config.imbalance_hold_threshold_mv {
            return CvlState::ImbalanceHold;
        }

        if self.state == CvlState::ImbalanceHold {
            if inputs.cell_imbalance_mv < config.imbalance_release_threshold_mv {
                return self.soc_driven_state(inputs.soc_percent, config);
            }
            return CvlState::ImbalanceHold;
        }

        let soc_state = self.soc_driven_state(inputs.soc_percent, config);

        if self.state == CvlState::Float && inputs.soc_percent <= config.float_exit_soc {
            return CvlState::FloatApproach;
        }

        // FLOAT_APPROACH is sticky just below transition_soc_threshold (see
        // soc_driven_state); this is the explicit relapse out of it, once SOC
        // has actually fallen past the hysteresis margin rather than merely
        // dipping under the threshold.
        if self.state == CvlState::FloatApproach
            && soc_state == CvlState::FloatApproach
            && inputs.soc_percent + FLOAT_APPROACH_RELAPSE_MARGIN < config.transition_soc_threshold
        {
            return CvlState::Transition;
        }

        soc_state
    }

    /// Non-exhaustive ladder: FLOAT_APPROACH persists (instead of falling
    /// straight through to TRANSITION/BULK) once SOC drops back below
    /// `transition_soc_threshold`, so the caller's relapse check is the only
    /// thing that demotes it. Ground truth in the reference CVL logic keeps
    /// the state sticky for the same reason.
    fn soc_driven_state(&self, soc: f32, config: &CvlConfig) -> CvlState {
        if soc >= config.float_soc_threshold {
            return CvlState::Float;
        }
        if soc >= config.transition_soc_threshold {
            return CvlState::FloatApproach;
        }
        if self.state == CvlState::FloatApproach {
            return CvlState::FloatApproach;
        }
        if soc >= config.bulk_soc_threshold {
            CvlState::Transition
        } else {
            CvlState::Bulk
        }
    }
}

impl Default for CvlSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-slot store the CAN Publisher reads to fill the 0x351 PGN, mirroring
/// the Live-Data Store's single-writer/many-readers contract.
pub struct LimitsStore {
    inner: parking_lot::Mutex<Option<ComputedLimits>>,
}

impl LimitsStore {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(LimitsStore {
            inner: parking_lot::Mutex::new(None),
        })
    }

    pub fn publish(&self, limits: ComputedLimits) {
        *self.inner.lock() = Some(limits);
    }

    pub fn latest(&self) -> Option<ComputedLimits> {
        *self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> CvlConfig {
        CvlConfig::default()
    }

    #[test]
    fn s1_normal_charge_stays_bulk_guard_inactive() {
        let mut sup = CvlSupervisor::new();
        let inputs = CvlInputs {
            soc_percent: 81.5,
            cell_imbalance_mv: 175,
            base_ccl_a: 45.0,
            base_dcl_a: 100.0,
            max_cell_voltage_v: 3.275,
            series_cell_count: 16,
        };
        let (limits, _) = sup.evaluate(&inputs, &default_config());
        assert_eq!(limits.state, CvlState::Bulk);
        assert!((limits.cvl_v - 58.4).abs() < 1e-3);
        assert_eq!(limits.ccl_a, 45.0);
        assert_eq!(limits.dcl_a, 100.0);
    }

    #[test]
    fn s2_float_entry_from_float_approach() {
        let mut sup = CvlSupervisor::new();
        let config = default_config();
        let warm = CvlInputs {
            soc_percent: 96.0,
            cell_imbalance_mv: 10,
            base_ccl_a: 45.0,
            base_dcl_a: 100.0,
            max_cell_voltage_v: 3.30,
            series_cell_count: 16,
        };
        sup.evaluate(&warm, &config); // enters FLOAT_APPROACH
        assert_eq!(sup.state(), CvlState::FloatApproach);

        let inputs = CvlInputs {
            soc_percent: 98.5,
            ..warm
        };
        let (limits, _) = sup.evaluate(&inputs, &config);
        assert_eq!(limits.state, CvlState::Float);
        assert!((limits.cvl_v - 58.3).abs() < 1e-3);
        assert_eq!(limits.ccl_a, 5.0);
    }

    #[test]
    fn s3_imbalance_hold_then_release_to_float_approach() {
        let mut sup = CvlSupervisor::new();
        let config = default_config();
        // Drive into FLOAT first.
        sup.evaluate(
            &CvlInputs {
                soc_percent: 99.0,
                cell_imbalance_mv: 10,
                base_ccl_a: 45.0,
                base_dcl_a: 100.0,
                max_cell_voltage_v: 3.30,
                series_cell_count: 16,
            },
            &config,
        );
        assert_eq!(sup.state(), CvlState::Float);

        let (limits, _) = sup.evaluate(
            &CvlInputs {
                soc_percent: 97.0,
                cell_imbalance_mv: 150,
                base_ccl_a: 45.0,
                base_dcl_a: 100.0,
                max_cell_voltage_v: 3.30,
                series_cell_count: 16,
            },
            &config,
        );
        assert_eq!(limits.state, CvlState::ImbalanceHold);
        assert!((limits.cvl_v - 57.4).abs() < 1e-3);

        let (limits2, _) = sup.evaluate(
            &CvlInputs {
                soc_percent: 97.0,
                cell_imbalance_mv: 30,
                base_ccl_a: 45.0,
                base_dcl_a: 100.0,
                max_cell_voltage_v: 3.30,
                series_cell_count: 16,
            },
            &config,
        );
        assert_eq!(limits2.state, CvlState::FloatApproach);
    }

    #[test]
    fn s4_cell_overvoltage_guard_dominates() {
        let mut sup = CvlSupervisor::new();
        let inputs = CvlInputs {
            soc_percent: 50.0,
            cell_imbalance_mv: 10,
            base_ccl_a: 45.0,
            base_dcl_a: 100.0,
            max_cell_voltage_v: 3.55,
            series_cell_count: 16,
        };
        let (limits, _) = sup.evaluate(&inputs, &default_config());
        assert_eq!(limits.state, CvlState::Bulk);
        assert!((limits.cvl_v - 51.2).abs() < 1e-3);
    }

    #[test]
    fn p4_disabled_config_bypasses_everything() {
        let mut sup = CvlSupervisor::new();
        let mut config = default_config();
        config.enabled = false;
        let inputs = CvlInputs {
            soc_percent: 99.0,
            cell_imbalance_mv: 500,
            base_ccl_a: 45.0,
            base_dcl_a: 100.0,
            max_cell_voltage_v: 3.70,
            series_cell_count: 16,
        };
        let (limits, _) = sup.evaluate(&inputs, &config);
        assert_eq!(limits.state, CvlState::Bulk);
        assert_eq!(limits.cvl_v, config.bulk_target_v);
        assert_eq!(limits.ccl_a, 45.0);
        assert_eq!(limits.dcl_a, 100.0);
        assert!(!limits.imbalance_hold_active);
    }

    #[test]
    fn p10_imbalance_override_wins_regardless_of_soc() {
        let mut sup = CvlSupervisor::new();
        let inputs = CvlInputs {
            soc_percent: 5.0,
            cell_imbalance_mv: 999,
            base_ccl_a: 45.0,
            base_dcl_a: 100.0,
            max_cell_voltage_v: 3.30,
            series_cell_count: 16,
        };
        let (limits, _) = sup.evaluate(&inputs, &default_config());
        assert_eq!(limits.state, CvlState::ImbalanceHold);
    }

    #[test]
    fn float_approach_is_sticky_within_relapse_margin_then_demotes() {
        let mut sup = CvlSupervisor::new();
        let config = default_config();
        let base = CvlInputs {
            soc_percent: 96.0,
            cell_imbalance_mv: 10,
            base_ccl_a: 45.0,
            base_dcl_a: 100.0,
            max_cell_voltage_v: 3.30,
            series_cell_count: 16,
        };
        sup.evaluate(&base, &config); // 96.0 >= transition_soc_threshold(95) -> FLOAT_APPROACH
        assert_eq!(sup.state(), CvlState::FloatApproach);

        // Dips just under the threshold but within the 0.25 margin: stays put.
        let (limits, _) = sup.evaluate(
            &CvlInputs {
                soc_percent: 94.9,
                ..base
            },
            &config,
        );
        assert_eq!(limits.state, CvlState::FloatApproach);

        // Falls past the margin: relapses to TRANSITION.
        let (limits2, _) = sup.evaluate(
            &CvlInputs {
                soc_percent: 94.5,
                ..base
            },
            &config,
        );
        assert_eq!(limits2.state, CvlState::Transition);
    }

    #[test]
    fn p3_guard_bounds_hold_when_active() {
        let mut sup = CvlSupervisor::new();
        let series = 16u8;
        let max_cell_v = 3.60f32;
        let inputs = CvlInputs {
            soc_percent: 50.0,
            cell_imbalance_mv: 0,
            base_ccl_a: 45.0,
            base_dcl_a: 100.0,
            max_cell_voltage_v: max_cell_v,
            series_cell_count: series,
        };
        let (limits, _) = sup.evaluate(&inputs, &default_config());
        let v_absmax = VCELL_CUTOFF_V * series as f32;
        let v_min_pack = VCELL_MIN_FLOAT_V * series as f32;
        let expected_cap = v_absmax - KP_GAIN * (max_cell_v - VCELL_SAFETY_THRESHOLD_V);
        assert!(limits.cvl_v <= expected_cap + 1e-3);
        assert!(limits.cvl_v >= v_min_pack - 1e-3);
    }
}
