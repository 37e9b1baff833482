use sophia_optim::{
    Device, GroupConfig, GroupSpec, Parameter, Sophia, SophiaError, SophiaVariant, StateDict,
    StepCounter, Tensor, DEFAULT_BATCH_SIZE,
};

/// Quadratic pull towards `target` so the gradient stream depends on the
/// trajectory.
fn set_grads(params: &mut [Parameter], target: f32) {
    for p in params.iter_mut() {
        let g: Vec<f32> = p.data.to_vec().iter().map(|x| 2.0 * (x - target)).collect();
        let shape = p.data.shape().to_vec();
        p.set_grad(Tensor::from_vec(&shape, g).unwrap());
    }
}

fn run(opt: &mut Sophia, params: &mut [Parameter], steps: usize) {
    for _ in 0..steps {
        set_grads(params, 0.25);
        opt.update_hessian(params).unwrap();
        opt.step(params, None, DEFAULT_BATCH_SIZE).unwrap();
    }
}

fn make_params() -> Vec<Parameter> {
    vec![
        Parameter::new(Tensor::from_vec(&[2, 2], vec![1.0, -2.0, 0.5, 3.0]).unwrap()),
        Parameter::new(Tensor::from_vec(&[3], vec![0.1, 0.2, -0.3]).unwrap()),
    ]
}

#[test]
fn test_resume_matches_uninterrupted_run() {
    for variant in SophiaVariant::ALL {
        for compress in [false, true] {
            let cfg = GroupConfig::defaults_for(variant).with_lr(1e-2);

            let mut full = Sophia::new(variant, [0usize, 1], cfg).unwrap();
            let mut full_params = make_params();
            run(&mut full, &mut full_params, 7);

            let mut first = Sophia::new(variant, [0usize, 1], cfg).unwrap();
            let mut params = make_params();
            run(&mut first, &mut params, 3);
            let bytes = first.state_dict().to_bytes(compress).unwrap();

            let mut resumed = Sophia::new(variant, [0usize, 1], cfg).unwrap();
            resumed
                .load_state_dict(StateDict::from_bytes(&bytes).unwrap())
                .unwrap();
            run(&mut resumed, &mut params, 4);

            assert_eq!(params, full_params, "{} compress={}", variant, compress);
            assert_eq!(resumed.state_dict(), full.state_dict());
        }
    }
}

#[test]
fn test_state_is_keyed_by_packed_position() {
    let mut opt = Sophia::with_groups(
        SophiaVariant::Rms,
        vec![GroupSpec::new([2usize, 0]), GroupSpec::new([1usize])],
        GroupConfig::default(),
    )
    .unwrap();
    let mut params = vec![
        Parameter::new(Tensor::from_vec(&[1], vec![1.0]).unwrap()),
        Parameter::new(Tensor::from_vec(&[2], vec![1.0, 1.0]).unwrap()),
        Parameter::new(Tensor::from_vec(&[3], vec![1.0; 3]).unwrap()),
    ];
    set_grads(&mut params, 0.0);
    opt.step(&mut params, None, DEFAULT_BATCH_SIZE).unwrap();

    let dict = opt.state_dict();
    assert_eq!(dict.param_groups[0].params, vec![0, 1]);
    assert_eq!(dict.param_groups[1].params, vec![2]);
    // packed 0 is parameter 2, packed 2 is parameter 1
    assert_eq!(dict.state[&0].exp_avg.shape, vec![3]);
    assert_eq!(dict.state[&1].exp_avg.shape, vec![1]);
    assert_eq!(dict.state[&2].exp_avg.shape, vec![2]);
    assert_eq!(dict.state[&0].step.to_counter().unwrap().value(), 1.0);
    assert!(dict.state[&0].rms.is_some());
}

#[test]
fn test_legacy_state_restores() {
    let json = r#"{
        "state": {"0": {"step": 4, "exp_avg": {"shape": [2], "data": [0.01, -0.02]}}},
        "param_groups": [{"params": [0], "lr": 0.001, "betas": [0.965, 0.99], "rho": 0.04, "weight_decay": 0.1}]
    }"#;
    let mut opt = Sophia::new(SophiaVariant::Base, [0usize], GroupConfig::default()).unwrap();
    opt.load_state_dict(StateDict::from_json(json).unwrap()).unwrap();

    let state = opt.state_of(0usize).unwrap();
    assert_eq!(state.step, StepCounter::Scalar(4.0));
    assert!(state.hessian.is_none());
    let group = &opt.param_groups()[0].config;
    assert_eq!(group.lr, 1e-3);
    assert!(!group.maximize);
    assert!(!group.capturable);

    let mut params = vec![Parameter::new(Tensor::from_vec(&[2], vec![1.0, 1.0]).unwrap())];
    set_grads(&mut params, 0.0);
    opt.step(&mut params, None, DEFAULT_BATCH_SIZE).unwrap();

    let state = opt.state_of(0usize).unwrap();
    assert_eq!(state.step.value(), 5.0);
    // backfilled hessian is zero, so the ratio clamped and the hessian stayed zero
    assert_eq!(state.hessian.as_ref().unwrap().to_vec(), vec![0.0, 0.0]);
}

#[test]
fn test_device_step_round_trips() {
    let device = Device::Accelerator(3);
    let cfg = GroupConfig::default().with_capturable(true);
    let mut opt = Sophia::new(SophiaVariant::Og, [0usize], cfg).unwrap();
    let mut params = vec![Parameter::new(Tensor::from_vec(&[1], vec![1.0]).unwrap().on(device))
        .with_grad(Tensor::from_vec(&[1], vec![0.5]).unwrap().on(device))];
    opt.step(&mut params, None, DEFAULT_BATCH_SIZE).unwrap();

    let json = opt.state_dict().to_json().unwrap();
    let mut restored = Sophia::new(SophiaVariant::Og, [0usize], cfg).unwrap();
    restored.load_state_dict(StateDict::from_json(&json).unwrap()).unwrap();

    let state = restored.state_of(0usize).unwrap();
    assert!(state.step.is_tensor());
    assert_eq!(state.step.device(), device);
    assert_eq!(state.momentum.device(), device);
    assert!(restored.param_groups()[0].config.capturable);
    restored.step(&mut params, None, DEFAULT_BATCH_SIZE).unwrap();
}

#[test]
fn test_layout_mismatch_is_rejected_without_changes() {
    let mut source = Sophia::with_groups(
        SophiaVariant::Base,
        vec![GroupSpec::new([0usize]), GroupSpec::new([1usize])],
        GroupConfig::default(),
    )
    .unwrap();
    let mut params = make_params();
    set_grads(&mut params, 0.0);
    source.step(&mut params, None, DEFAULT_BATCH_SIZE).unwrap();
    let two_groups = source.state_dict();

    let mut target = Sophia::new(SophiaVariant::Base, [0usize, 1], GroupConfig::default().with_lr(5e-3)).unwrap();
    let before = target.state_dict();
    assert!(matches!(
        target.load_state_dict(two_groups),
        Err(SophiaError::StateDict(_))
    ));
    assert_eq!(target.state_dict(), before);

    let mut sized = before.clone();
    sized.param_groups[0].params.push(2);
    assert!(matches!(
        target.load_state_dict(sized),
        Err(SophiaError::StateDict(_))
    ));

    let mut invalid = before.clone();
    invalid.param_groups[0].rho = -1.0;
    assert!(matches!(
        target.load_state_dict(invalid),
        Err(SophiaError::InvalidConfig(_))
    ));
    assert_eq!(target.state_dict(), before);
}
