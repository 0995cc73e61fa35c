use mixedmc_core::graph::Shape;
use mixedmc_core::{
    Backend, BuildPhase, Error, GroupingFactor, Model, PriorArg, PriorSpec, SamplerConfig,
    SigmaSpec, Term,
};
use ndarray::{Array2, Array3};

fn idx_to_f64(idx: usize) -> f64 {
    f64::from(u32::try_from(idx).unwrap_or(u32::MAX))
}

/// Intercept plus slope, and a 3-group indicator design.
fn sample_model(n: usize) -> Model {
    let fixed = Array2::from_shape_fn((n, 2), |(row, col)| {
        if col == 0 {
            1.0
        } else {
            idx_to_f64(row % 7) / 7.0
        }
    });
    let groups = Array2::from_shape_fn((n, 3), |(row, col)| if row % 3 == col { 1.0 } else { 0.0 });
    let y: Vec<f64> = (0..n)
        .map(|row| 0.5 + 1.5 * idx_to_f64(row % 7) / 7.0 + [-0.4, 0.1, 0.3][row % 3])
        .collect();

    let slope_prior = PriorSpec::new("Normal").arg("mu", 0.0).arg("sd", 10.0);
    let group_prior = PriorSpec::new("Normal").arg("mu", 0.0);
    Model::new(y)
        .with_term(Term::fixed("x", fixed, slope_prior))
        .and_then(|m| m.with_term(Term::random("group", groups, group_prior)))
        .expect("labels are distinct")
}

#[test]
fn fixed_and_random_terms_sample_requested_draws() {
    let model = sample_model(30);
    let mut backend = Backend::new();
    backend.build(&model, true).expect("build should succeed");

    let labels: Vec<&str> = backend.dists().keys().map(String::as_str).collect();
    assert_eq!(labels, vec!["b_x", "sigma", "sigma_group", "u_group"]);
    assert_eq!(backend.dist("b_x").unwrap().shape, Shape::Vector(2));
    assert_eq!(backend.dist("u_group").unwrap().shape, Shape::Vector(3));

    let config = SamplerConfig {
        num_draws: 500,
        num_warmup: 300,
        num_chains: 2,
        seed: 11,
        ..SamplerConfig::default()
    };
    let trace = backend.run(&config).expect("sampling should succeed");
    assert_eq!(trace.len(), 500);
    for name in ["b_x", "sigma", "sigma_group", "u_group"] {
        let var = trace.get(name).expect("every registered variable is traced");
        let (chains, draws, _) = var.draws.dim();
        assert_eq!((chains, draws), (2, 500));
    }
    assert!(trace.get("y_pred").is_none());
    assert!(trace.get("sigma").unwrap().draws.iter().all(|&s| s > 0.0));
    assert!(backend.trace().is_some());
}

#[test]
fn unknown_family_leaves_backend_unusable_until_reset() {
    let prior = PriorSpec::new("NotARealDistribution");
    let bad = Model::new(vec![0.0, 1.0])
        .with_term(Term::fixed("x", Array2::<f64>::ones((2, 1)), prior))
        .expect("single term");
    let mut backend = Backend::new();

    let err = backend.build(&bad, true).unwrap_err();
    assert!(matches!(
        err,
        Error::UnknownDistribution { ref name } if name == "NotARealDistribution"
    ));
    assert_eq!(backend.phase(), BuildPhase::Failed);
    assert!(matches!(backend.run(&SamplerConfig::default()), Err(Error::InvalidState)));
    assert!(matches!(backend.build(&sample_model(6), false), Err(Error::InvalidState)));

    backend.build(&sample_model(6), true).expect("a reset build recovers");
    assert_eq!(backend.phase(), BuildPhase::Built);
}

#[test]
fn second_reset_build_discards_first() {
    let mut backend = Backend::new();
    backend.build(&sample_model(9), true).expect("first build");

    let other = Model::new(vec![1.0, 2.0, 3.0])
        .with_term(Term::fixed("z", Array2::<f64>::ones((3, 1)), PriorSpec::new("Normal")))
        .expect("single term");
    backend.build(&other, true).expect("second build");

    let labels: Vec<&str> = backend.dists().keys().map(String::as_str).collect();
    assert_eq!(labels, vec!["b_z", "sigma"]);
    assert!(backend.scope().variable("u_group").is_none());
}

#[test]
fn missing_or_partial_sigma_uses_half_cauchy_default() {
    let partial = SigmaSpec {
        name: Some("HalfNormal".into()),
        args: None,
    };
    for prior in [PriorSpec::new("Normal"), PriorSpec::new("Normal").with_sigma(partial)] {
        let model = Model::new(vec![0.0, 1.0])
            .with_term(Term::random("g", Array2::<f64>::eye(2), prior))
            .expect("single term");
        let mut backend = Backend::new();
        backend.build(&model, true).expect("build should succeed");

        let sigma = backend.dist("sigma_g").expect("group sigma is registered");
        assert_eq!(sigma.family, "HalfCauchy");
        assert_eq!(sigma.param("beta"), Some(PriorArg::Value(10.0)));
    }
}

#[test]
fn unreadable_sigma_in_json_prior_uses_default() {
    let prior: PriorSpec = serde_json::from_str(
        r#"{"name": "Normal", "args": {}, "sigma": {"name": 5, "args": {"beta": 2.0}}}"#,
    )
    .expect("the prior itself is well formed");
    let model = Model::new(vec![0.0, 1.0])
        .with_term(Term::random("g", Array2::<f64>::eye(2), prior))
        .expect("single term");
    let mut backend = Backend::new();
    backend.build(&model, true).expect("build should succeed");

    let sigma = backend.dist("sigma_g").expect("group sigma is registered");
    assert_eq!(sigma.family, "HalfCauchy");
    assert_eq!(sigma.param("beta"), Some(PriorArg::Value(10.0)));
}

#[test]
fn split_level_without_active_columns_gets_empty_effect() {
    // Levels: a uses column 0, b nothing, c columns 1 and 2.
    let mut values = Array3::<f64>::zeros((6, 3, 3));
    for row in 0..6 {
        values[[row, 0, 0]] = 1.0;
        values[[row, 1 + row % 2, 2]] = 1.0;
    }
    let term = Term::random("g", values, PriorSpec::new("Normal"))
        .split_by(GroupingFactor::new(["a", "b", "c"]));
    let model = Model::new(vec![0.2, -0.1, 0.4, 0.0, 0.3, -0.2])
        .with_term(term)
        .expect("single term");
    let mut backend = Backend::new();
    backend.build(&model, true).expect("zero-size levels are legal");

    assert_eq!(backend.dist("u_g_a").unwrap().shape, Shape::Vector(1));
    assert_eq!(backend.dist("u_g_b").unwrap().shape, Shape::Vector(0));
    assert_eq!(backend.dist("u_g_c").unwrap().shape, Shape::Vector(2));
    for level in ["a", "b", "c"] {
        assert!(backend.dist(&format!("sigma_g_{level}")).is_some());
    }
    assert_eq!(backend.scope().shape(backend.mu()), Shape::Vector(6));

    let config = SamplerConfig {
        num_draws: 100,
        num_warmup: 100,
        num_chains: 1,
        ..SamplerConfig::default()
    };
    let trace = backend.run(&config).expect("sampling should succeed");
    assert_eq!(trace.get("u_g_b").unwrap().draws.dim(), (1, 100, 0));
}

#[test]
fn hmc_method_runs_through_backend() {
    let mut backend = Backend::new();
    backend.build(&sample_model(12), true).expect("build should succeed");
    let json = r#"{"method": "hmc", "samples": 50, "tune": 50, "chains": 1,
                   "num_leapfrog_steps": 10}"#;
    let config = SamplerConfig::from_json(json).expect("valid config");
    let trace = backend.run(&config).expect("sampling should succeed");
    assert_eq!(trace.num_draws, 50);
    assert_eq!(trace.get("u_group").unwrap().mean().len(), 3);
}
