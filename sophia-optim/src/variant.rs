use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The four Sophia update rules. They share one kernel and differ only in
/// the [`VariantProfile`] they select.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SophiaVariant {
    #[default]
    Base,
    Rms,
    Og,
    Rmsd,
}

/// Upper bound applied to the `|m| / (rho * bs * h + eps)` ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClampPolicy {
    One,
    /// The floored parameter RMS of the current step.
    ParamRms,
}

/// Magnitude multiplying `sign(m) * ratio`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepScale {
    /// `lr * max(floor, rms(param))`
    LrTimesParamRms,
    /// `lr`
    Lr,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MomentumPolicy {
    /// Sign and ratio read the stored `beta1` EMA.
    Single,
    /// Sign and ratio read `decay * m_prev + weight * g`, which is not stored;
    /// the stored momentum still follows `beta1`.
    Dual { decay: f32, weight: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariantProfile {
    pub clamp: ClampPolicy,
    pub step_floor: f32,
    pub step_scale: StepScale,
    pub momentum: MomentumPolicy,
    /// Keeps the floored parameter RMS in the `rms` state slot. These
    /// variants also keep their step counter as a one-element tensor.
    pub tracks_rms: bool,
}

impl SophiaVariant {
    pub const ALL: [SophiaVariant; 4] = [
        SophiaVariant::Base,
        SophiaVariant::Rms,
        SophiaVariant::Og,
        SophiaVariant::Rmsd,
    ];

    pub const fn profile(self) -> VariantProfile {
        match self {
            SophiaVariant::Base => VariantProfile {
                clamp: ClampPolicy::One,
                step_floor: 1e-3,
                step_scale: StepScale::LrTimesParamRms,
                momentum: MomentumPolicy::Single,
                tracks_rms: false,
            },
            SophiaVariant::Rms => VariantProfile {
                clamp: ClampPolicy::ParamRms,
                step_floor: 1e-5,
                step_scale: StepScale::Lr,
                momentum: MomentumPolicy::Single,
                tracks_rms: true,
            },
            SophiaVariant::Og => VariantProfile {
                clamp: ClampPolicy::One,
                step_floor: 1e-5,
                step_scale: StepScale::Lr,
                momentum: MomentumPolicy::Single,
                tracks_rms: true,
            },
            SophiaVariant::Rmsd => VariantProfile {
                clamp: ClampPolicy::ParamRms,
                step_floor: 1e-5,
                step_scale: StepScale::Lr,
                momentum: MomentumPolicy::Dual {
                    decay: 0.95,
                    weight: 0.05,
                },
                tracks_rms: true,
            },
        }
    }

    pub const fn default_betas(self) -> (f64, f64) {
        match self {
            SophiaVariant::Rmsd => (0.99, 0.99),
            _ => (0.965, 0.99),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SophiaVariant::Base => "base",
            SophiaVariant::Rms => "rms",
            SophiaVariant::Og => "og",
            SophiaVariant::Rmsd => "rmsd",
        }
    }
}

impl fmt::Display for SophiaVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SophiaVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SophiaVariant::ALL
            .into_iter()
            .find(|v| v.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown Sophia variant '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_table() {
        let base = SophiaVariant::Base.profile();
        assert_eq!(base.clamp, ClampPolicy::One);
        assert_eq!(base.step_floor, 1e-3);
        assert!(!base.tracks_rms);

        let og = SophiaVariant::Og.profile();
        assert_eq!(og.clamp, ClampPolicy::One);
        assert_eq!(og.step_floor, 1e-5);
        assert!(og.tracks_rms);

        assert_eq!(SophiaVariant::Rms.profile().clamp, ClampPolicy::ParamRms);
        assert!(matches!(
            SophiaVariant::Rmsd.profile().momentum,
            MomentumPolicy::Dual { .. }
        ));
        assert_eq!(SophiaVariant::Rmsd.default_betas(), (0.99, 0.99));
    }

    #[test]
    fn test_parse_round_trip() {
        for v in SophiaVariant::ALL {
            assert_eq!(v.to_string().parse::<SophiaVariant>().unwrap(), v);
        }
        assert_eq!("RMSD".parse::<SophiaVariant>().unwrap(), SophiaVariant::Rmsd);
        assert!("adam".parse::<SophiaVariant>().is_err());
    }
}
