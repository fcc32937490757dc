use burn::backend::{Autodiff, NdArray};
use ndarray::{Array2, array};
use podnn::regression::{BayesianNeuralNetwork, BnnConfig};
use podnn::training::FitOptions;

type TestBackend = Autodiff<NdArray<f32>>;

fn line_data() -> (Array2<f64>, Array2<f64>) {
    let x = Array2::from_shape_fn((100, 1), |(i, _)| i as f64 / 99.0);
    let v = x.mapv(|x| 2.0 * x);
    (x, v)
}

fn config() -> BnnConfig {
    BnnConfig {
        layers: vec![1, 20, 20, 1],
        lr: 1e-2,
        klw: 1e-3,
        soft_0: 1.0,
        ..BnnConfig::default()
    }
}

#[test]
fn learns_a_line_and_becomes_more_certain() {
    let device = Default::default();
    let mut bnn = BayesianNeuralNetwork::<TestBackend>::new(config(), &device).unwrap();
    let (x, v) = line_data();
    let x_mid = array![[0.5]];

    let options = FitOptions {
        epochs: 500,
        batch_size: 0,
        log_frequency: 100,
    };
    let mut stds = Vec::new();
    bnn.fit(&x, &v, &options, |model, _| {
        let (_, var) = model.predict(&x_mid, 200)?;
        stds.push(var[[0, 0]].sqrt());
        Ok(())
    })
    .unwrap();

    let (mean, var) = bnn.predict(&x_mid, 200).unwrap();
    assert!((mean[[0, 0]] - 1.0).abs() < 0.1, "prediction {}", mean[[0, 0]]);
    assert!(var[[0, 0]] >= 0.0);

    // 予測は毎回同じ乱数系列で評価される
    assert_eq!(stds.len(), 5);
    assert!(
        stds.windows(2).all(|w| w[1] <= w[0] * 1.02 + 1e-3),
        "std did not shrink: {stds:?}"
    );
    assert!(stds[4] < stds[0], "std did not shrink: {stds:?}");
}

#[test]
fn save_and_load_reproduce_predictions() {
    let device = Default::default();
    let mut bnn = BayesianNeuralNetwork::<TestBackend>::new(config(), &device).unwrap();
    let (x, v) = line_data();
    let options = FitOptions {
        epochs: 20,
        batch_size: 32,
        log_frequency: 10,
    };
    bnn.fit(&x, &v, &options, |_, _| Ok(())).unwrap();

    let dir = tempfile::tempdir().unwrap();
    bnn.save(dir.path()).unwrap();
    let loaded = BayesianNeuralNetwork::<TestBackend>::load(dir.path(), &device).unwrap();
    assert_eq!(loaded.config(), bnn.config());
    assert_eq!(loaded.norm_bounds(), bnn.norm_bounds());

    let (m1, v1) = bnn.predict(&x, 30).unwrap();
    let (m2, v2) = loaded.predict(&x, 30).unwrap();
    for (a, b) in m1.iter().zip(m2.iter()).chain(v1.iter().zip(v2.iter())) {
        assert!((a - b).abs() < 1e-5, "{a} != {b}");
    }
}
