//! The shared Sophia update kernel.
//!
//! Every variant runs the same sweep; a [`VariantProfile`] picks the clamp
//! bound, the step-size floor and scale, and which momentum feeds the sign
//! and ratio. Hyper-parameters arrive as `f64` and are rounded to `f32`
//! where they meet a buffer.

use crate::{
    config::GroupConfig,
    error::{Result, SophiaError},
    state::ParamState,
    tensor::{ParamId, Tensor},
    variant::{ClampPolicy, MomentumPolicy, StepScale, VariantProfile},
};
use ndarray::Zip;

/// Keeps the ratio finite when the hessian estimate is zero.
pub const RATIO_EPS: f32 = 1e-15;

/// `h <- beta2 * h + (1 - beta2) * g^2`, elementwise over the real view.
///
/// Panics if the layouts differ; the optimizer checks them beforehand.
pub fn hessian_ema(hessian: &mut Tensor, grad: &Tensor, beta2: f64) {
    let decay = beta2 as f32;
    let weight = (1.0 - beta2) as f32;
    Zip::from(hessian.real_view_mut())
        .and(&grad.real_view())
        .for_each(|h, &g| *h = *h * decay + weight * g * g);
}

/// `sign(0) = 0`; NaN stays NaN.
#[inline]
pub fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        x
    }
}

/// Upper clamp that lets NaN through instead of replacing it with the bound.
#[inline]
fn clamp_max(x: f32, bound: f32) -> f32 {
    if x > bound {
        bound
    } else {
        x
    }
}

/// Scalars of one step for one parameter, after the variant has been applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepPlan {
    /// Signed multiplier of `sign(m) * ratio`; always `<= 0`.
    pub step_size_neg: f32,
    pub clamp_bound: f32,
    /// Floored parameter RMS, reported for variants that track it.
    pub step_size_rel: f32,
}

impl StepPlan {
    pub fn new(param_rms: f32, lr: f64, profile: &VariantProfile) -> Self {
        let step_size_rel = param_rms.max(profile.step_floor);
        let step_size_neg = match profile.step_scale {
            StepScale::LrTimesParamRms => -(lr as f32) * step_size_rel,
            StepScale::Lr => -(lr as f32),
        };
        let clamp_bound = match profile.clamp {
            ClampPolicy::One => 1.0,
            ClampPolicy::ParamRms => step_size_rel,
        };
        Self {
            step_size_neg,
            clamp_bound,
            step_size_rel,
        }
    }
}

/// Applies one optimizer step to `param` in place.
///
/// Placement is checked before any buffer is touched, so a parameter that
/// fails here is left exactly as it was.
pub fn sophia_update(
    id: ParamId,
    param: &mut Tensor,
    grad: &Tensor,
    state: &mut ParamState,
    cfg: &GroupConfig,
    profile: &VariantProfile,
    bs: f64,
) -> Result<()> {
    check_layout(id, param, grad)?;
    check_layout(id, param, &state.momentum)?;
    if let Some(hessian) = &state.hessian {
        check_layout(id, param, hessian)?;
    }
    if cfg.capturable {
        check_capturable(id, param, grad, state)?;
    }

    let ParamState {
        step,
        momentum,
        hessian,
        rms,
    } = state;
    let hessian = hessian.get_or_insert_with(|| Tensor::zeros_like(param));

    step.increment();

    // decoupled weight decay
    let decay = (1.0 - cfg.lr * cfg.weight_decay) as f32;
    param.real_view_mut().mapv_inplace(|p| p * decay);

    let plan = StepPlan::new(param.rms(), cfg.lr, profile);
    if rms.is_some() || profile.tracks_rms {
        *rms = Some(plan.step_size_rel);
    }

    let (beta1, _) = cfg.betas;
    let m_decay = beta1 as f32;
    let m_weight = (1.0 - beta1) as f32;
    let denom_scale = (cfg.rho * bs) as f32;
    let maximize = cfg.maximize;
    let momentum_policy = profile.momentum;
    let StepPlan {
        step_size_neg,
        clamp_bound,
        ..
    } = plan;

    Zip::from(param.real_view_mut())
        .and(momentum.real_view_mut())
        .and(&hessian.real_view())
        .and(&grad.real_view())
        .for_each(|p, m, &h, &g| {
            let g = if maximize { -g } else { g };
            let m_prev = *m;
            *m = m_prev * m_decay + m_weight * g;
            let direction = match momentum_policy {
                MomentumPolicy::Single => *m,
                MomentumPolicy::Dual { decay, weight } => m_prev * decay + weight * g,
            };
            let ratio = clamp_max(direction.abs() / (denom_scale * h + RATIO_EPS), clamp_bound);
            *p += step_size_neg * sign(direction) * ratio;
        });

    Ok(())
}

fn check_layout(id: ParamId, param: &Tensor, other: &Tensor) -> Result<()> {
    if other.same_layout(param) {
        Ok(())
    } else {
        Err(SophiaError::ShapeMismatch {
            param: id.index(),
            expected: param.real_shape().to_vec(),
            actual: other.real_shape().to_vec(),
        })
    }
}

/// Capturable placement of a parameter and its gradient: both on the same
/// accelerator. Needs no state, so it can run before state is allocated.
pub fn check_placement(id: ParamId, param: &Tensor, grad: &Tensor) -> Result<()> {
    let device = param.device();
    if !device.is_accelerator() {
        return Err(placement_error(
            id,
            format!(
                "capturable mode needs the parameter on an accelerator, found {:?}",
                device
            ),
        ));
    }
    if grad.device() != device {
        return Err(placement_error(
            id,
            format!("gradient on {:?} but parameter on {:?}", grad.device(), device),
        ));
    }
    Ok(())
}

fn check_capturable(id: ParamId, param: &Tensor, grad: &Tensor, state: &ParamState) -> Result<()> {
    check_placement(id, param, grad)?;
    let device = param.device();
    if !state.step.is_tensor() || state.step.device() != device {
        return Err(placement_error(
            id,
            format!(
                "step counter on {:?} but parameter on {:?}",
                state.step.device(),
                device
            ),
        ));
    }
    Ok(())
}

fn placement_error(id: ParamId, reason: String) -> SophiaError {
    SophiaError::DevicePlacement {
        param: id.index(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        state::{StateLayout, StepCounter},
        tensor::Device,
        variant::SophiaVariant,
    };
    use approx::assert_relative_eq;

    fn scalar_state(param: &Tensor, tracks_rms: bool) -> ParamState {
        ParamState::zeros(
            param,
            StateLayout {
                step_on_device: tracks_rms,
                tracks_rms,
            },
        )
    }

    #[test]
    fn test_sign_of_zero_is_zero() {
        assert_eq!(sign(0.0), 0.0);
        assert_eq!(sign(3.5), 1.0);
        assert_eq!(sign(-1e-30), -1.0);
        assert!(sign(f32::NAN).is_nan());
    }

    #[test]
    fn test_clamp_max_keeps_nan() {
        assert_eq!(clamp_max(2.0, 1.0), 1.0);
        assert_eq!(clamp_max(0.5, 1.0), 0.5);
        assert!(clamp_max(f32::NAN, 1.0).is_nan());
    }

    #[test]
    fn test_hessian_ema_single_step() {
        let mut h = Tensor::from_vec(&[2], vec![0.0, 1.0]).unwrap();
        let g = Tensor::from_vec(&[2], vec![0.1, 2.0]).unwrap();
        hessian_ema(&mut h, &g, 0.99);
        let h = h.to_vec();
        assert_relative_eq!(h[0], 0.0001, max_relative = 1e-5);
        assert_relative_eq!(h[1], 0.99 + 0.01 * 4.0, max_relative = 1e-6);
    }

    #[test]
    fn test_step_plan_per_variant() {
        let base = StepPlan::new(0.5, 1e-2, &SophiaVariant::Base.profile());
        assert_relative_eq!(base.step_size_neg, -5e-3);
        assert_eq!(base.clamp_bound, 1.0);

        let floored = StepPlan::new(0.0, 1e-2, &SophiaVariant::Base.profile());
        assert_relative_eq!(floored.step_size_neg, -1e-5, max_relative = 1e-6);

        let rms = StepPlan::new(0.5, 1e-2, &SophiaVariant::Rms.profile());
        assert_relative_eq!(rms.step_size_neg, -1e-2);
        assert_eq!(rms.clamp_bound, 0.5);

        let og = StepPlan::new(1e-9, 1e-2, &SophiaVariant::Og.profile());
        assert_eq!(og.clamp_bound, 1.0);
        assert_eq!(og.step_size_rel, 1e-5);
    }

    #[test]
    fn test_zero_hessian_clamps_to_one() {
        let mut p = Tensor::from_vec(&[1], vec![1.0]).unwrap();
        let g = Tensor::from_vec(&[1], vec![0.1]).unwrap();
        let mut state = scalar_state(&p, false);
        let cfg = GroupConfig::default().with_weight_decay(0.0);

        sophia_update(ParamId(0), &mut p, &g, &mut state, &cfg, &SophiaVariant::Base.profile(), 5120.0)
            .unwrap();

        // ratio = 0.0035 / 1e-15 clamps to 1, step = lr * max(1e-3, 1.0)
        assert_relative_eq!(p.to_vec()[0], 1.0 - 1e-4, max_relative = 1e-7);
        assert_eq!(state.step, StepCounter::Scalar(1.0));
    }

    #[test]
    fn test_capturable_rejects_host_param() {
        let mut p = Tensor::from_vec(&[1], vec![1.0]).unwrap();
        let g = Tensor::from_vec(&[1], vec![0.1]).unwrap();
        let mut state = scalar_state(&p, true);
        let before = state.clone();
        let cfg = GroupConfig::default().with_capturable(true);

        let err = sophia_update(ParamId(7), &mut p, &g, &mut state, &cfg, &SophiaVariant::Rms.profile(), 5120.0)
            .unwrap_err();
        assert!(matches!(err, SophiaError::DevicePlacement { param: 7, .. }));
        assert_eq!(state, before);
        assert_eq!(p.to_vec(), vec![1.0]);
    }

    #[test]
    fn test_capturable_accepts_colocated_tensors() {
        let device = Device::Accelerator(0);
        let mut p = Tensor::from_vec(&[1], vec![1.0]).unwrap().on(device);
        let g = Tensor::from_vec(&[1], vec![0.1]).unwrap().on(device);
        let mut state = scalar_state(&p, true);
        let cfg = GroupConfig::default().with_capturable(true);

        sophia_update(ParamId(0), &mut p, &g, &mut state, &cfg, &SophiaVariant::Rms.profile(), 5120.0)
            .unwrap();
        assert_eq!(state.step.value(), 1.0);
        assert_eq!(state.step.device(), device);
    }
}
