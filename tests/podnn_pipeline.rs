use approx::assert_abs_diff_eq;
use burn::backend::{Autodiff, NdArray};
use ndarray::Axis;
use podnn::dataset::{DatasetConfig, Sampling};
use podnn::metrics::re_s;
use podnn::regression::BnnConfig;
use podnn::snapshots::{Burgers1d, create_linear_mesh};
use podnn::training::FitOptions;
use podnn::{PodnnError, PodnnModel};

type TestBackend = Autodiff<NdArray<f32>>;

const N_X: usize = 32;
const N_T: usize = 6;

fn dataset_config() -> DatasetConfig {
    DatasetConfig {
        t_min: 1.0,
        t_max: 3.0,
        mu_min: vec![0.005],
        mu_max: vec![0.01],
        n_s: 8,
        train_val_ratio: 0.5,
        eps: 1e-6,
        n_l: None,
        sampling: Sampling::Lhs,
        seed: 1111,
    }
}

fn trained_model() -> (PodnnModel<TestBackend>, podnn::dataset::Dataset, Vec<f64>) {
    let device = Default::default();
    let mesh = create_linear_mesh(0.0, 1.5, N_X);
    let mut model = PodnnModel::<TestBackend>::new(1, mesh, vec![N_X], N_T, &device)
        .unwrap()
        .with_samples(20)
        .unwrap();
    let data = model.generate_dataset(&Burgers1d, &dataset_config()).unwrap();

    let bnn = BnnConfig {
        klw: 1e-3,
        soft_0: 1.0,
        ..BnnConfig::default()
    };
    let options = FitOptions {
        epochs: 40,
        batch_size: 0,
        log_frequency: 20,
    };
    let u_val = data.u_val.clone();
    let x_v_val = data.x_v_val.clone();
    let history = model
        .train(&data.x_v_train, &data.v_train, &[16, 16], &bnn, &options, |predictor| {
            let u_pred = predictor.predict(&x_v_val)?;
            Ok(re_s(&u_val, &u_pred, true))
        })
        .unwrap();
    let errors = history.iter().map(|(_, e)| *e).collect();
    (model, data, errors)
}

#[test]
fn validation_errors_are_reported_at_log_frequency() {
    let (_, _, errors) = trained_model();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.is_finite() && *e >= 0.0));
}

#[test]
fn predictive_variance_adds_pod_truncation() {
    let (model, data, _) = trained_model();
    let (u_mean, u_sigma) = model.predict_var(&data.x_v_val).unwrap();
    assert_eq!(u_mean.dim(), data.u_val.dim());
    assert!(u_sigma.iter().all(|s| *s >= 0.0));

    let pod = model.pod().unwrap();
    let (_, v_var) = model.predict_v(&data.x_v_val).unwrap();
    let mut expected = pod.lift_variance(&v_var.t().to_owned()).unwrap();
    expected += &pod.pod_variance().view().insert_axis(Axis(1));
    for (s, e) in u_sigma.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(s * s, e.max(0.0), epsilon = 1e-9);
    }
}

#[test]
fn checkpoint_round_trip_keeps_predictions() {
    let (model, data, _) = trained_model();
    let dir = tempfile::tempdir().unwrap();
    model.save(dir.path()).unwrap();
    model.save_train_data(dir.path(), &data).unwrap();

    let device = Default::default();
    let loaded = PodnnModel::<TestBackend>::load(dir.path(), &device).unwrap();
    let cached = PodnnModel::<TestBackend>::load_train_data(dir.path()).unwrap();
    assert_eq!(cached.val_idx, data.val_idx);
    assert_eq!(cached.x_v_val, data.x_v_val);

    let before = model.predict(&data.x_v_val).unwrap();
    let after = loaded.predict(&cached.x_v_val).unwrap();
    for (a, b) in before.iter().zip(after.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-5);
    }

    let structured = loaded.restruct(&after).unwrap();
    assert_eq!(structured.shape(), &[1, N_X, N_T, data.val_idx.len()]);
}

#[test]
fn loading_a_partial_checkpoint_reports_the_missing_artifact() {
    let (model, _, _) = trained_model();
    let dir = tempfile::tempdir().unwrap();
    model.save(dir.path()).unwrap();
    std::fs::remove_file(dir.path().join(podnn::BNN_WEIGHTS_FILENAME)).unwrap();

    let device = Default::default();
    match PodnnModel::<TestBackend>::load(dir.path(), &device) {
        Err(PodnnError::CheckpointMissing { path, .. }) => {
            assert!(path.ends_with(podnn::BNN_WEIGHTS_FILENAME))
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("load should fail"),
    }
}
