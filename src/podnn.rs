//! # POD-BNN モデル
//!
//! データセット生成、POD による縮約、ベイズニューラルネットワークの学習、
//! 物理空間への復元と不確かさの合成、チェックポイントの保存・読み込みをまとめます。

use crate::dataset::{
    Dataset, DatasetConfig, DatasetShape, assemble_snapshots, destruct, restruct,
    sample_parameters, split_samples, time_grid,
};
use crate::error::{PodnnError, PodnnResult};
use crate::inference::DEFAULT_SAMPLES;
use crate::pod::PodBasis;
use crate::regression::{BayesianNeuralNetwork, BnnConfig};
use crate::snapshots::SnapshotSource;
use crate::training::{EpochStats, FitOptions};
use crate::{PODNN_FILENAME, TRAIN_DATA_FILENAME, write_atomic};
use burn::tensor::backend::AutodiffBackend;
use ndarray::{Array2, ArrayD, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// POD 基底と回帰モデルを使って予測するための読み取り専用ビュー。
///
/// 学習中の検証コールバックにも渡されます。
pub struct Predictor<'a, B: AutodiffBackend> {
    pod: &'a PodBasis,
    regnn: &'a BayesianNeuralNetwork<B>,
    samples: usize,
}

impl<B: AutodiffBackend> Predictor<'_, B> {
    /// 縮約空間での予測平均と分散 `(rows, n_L)`
    pub fn predict_v(&self, x: &Array2<f64>) -> PodnnResult<(Array2<f64>, Array2<f64>)> {
        self.regnn.predict(x, self.samples)
    }

    /// 物理空間での予測 `(n_h, rows)`
    pub fn predict(&self, x: &Array2<f64>) -> PodnnResult<Array2<f64>> {
        let (v_mean, _) = self.predict_v(x)?;
        self.pod.lift(&v_mean.t().to_owned())
    }

    /// 物理空間での予測平均と標準偏差。
    ///
    /// 分散は回帰モデルの分散を基底で持ち上げたものに POD の打ち切り分散を加えたものです。
    pub fn predict_var(&self, x: &Array2<f64>) -> PodnnResult<(Array2<f64>, Array2<f64>)> {
        let (v_mean, v_var) = self.predict_v(x)?;
        let u_mean = self.pod.lift(&v_mean.t().to_owned())?;
        let mut u_var = self.pod.lift_variance(&v_var.t().to_owned())?;
        let pod_var = self.pod.pod_variance().view().insert_axis(Axis(1));
        u_var += &pod_var;
        Ok((u_mean, u_var.mapv(|v| v.max(0.0).sqrt())))
    }
}

/// 保存される POD 側の状態
#[derive(Debug, Serialize, Deserialize)]
struct PodnnCheckpoint {
    n_v: usize,
    space: Vec<usize>,
    n_t: usize,
    x_mesh: Array2<f64>,
    samples: usize,
    pod: Option<PodBasis>,
}

/// POD-BNN の縮約モデル全体。
pub struct PodnnModel<B: AutodiffBackend> {
    n_v: usize,
    space: Vec<usize>,
    n_t: usize,
    x_mesh: Array2<f64>,
    samples: usize,
    pod: Option<PodBasis>,
    regnn: Option<BayesianNeuralNetwork<B>>,
    device: B::Device,
}

impl<B: AutodiffBackend> PodnnModel<B> {
    /// メッシュ `(n_space, d)` と空間形状 (`[n_x]` または `[n_x, n_y]`) から空のモデルを作ります。
    pub fn new(
        n_v: usize,
        x_mesh: Array2<f64>,
        space: Vec<usize>,
        n_t: usize,
        device: &B::Device,
    ) -> PodnnResult<Self> {
        if n_v == 0 || space.is_empty() || space.iter().product::<usize>() != x_mesh.nrows() {
            return Err(PodnnError::config(format!(
                "空間形状 {space:?} がメッシュの点数 {} と一致しません",
                x_mesh.nrows()
            )));
        }
        Ok(Self {
            n_v,
            space,
            n_t,
            x_mesh,
            samples: DEFAULT_SAMPLES,
            pod: None,
            regnn: None,
            device: device.clone(),
        })
    }

    /// 予測時のサンプル数を設定します。
    pub fn with_samples(mut self, samples: usize) -> PodnnResult<Self> {
        if samples == 0 {
            return Err(PodnnError::config("予測のサンプル数は 1 以上である必要があります"));
        }
        self.samples = samples;
        Ok(self)
    }

    pub fn pod(&self) -> Option<&PodBasis> {
        self.pod.as_ref()
    }

    pub fn regnn(&self) -> Option<&BayesianNeuralNetwork<B>> {
        self.regnn.as_ref()
    }

    pub fn x_mesh(&self) -> &Array2<f64> {
        &self.x_mesh
    }

    pub fn n_h(&self) -> usize {
        self.n_v * self.space.iter().product::<usize>()
    }

    /// パラメータをサンプリングしてスナップショットを生成し、POD で縮約した学習/検証データを返します。
    pub fn generate_dataset<S: SnapshotSource + ?Sized>(
        &mut self,
        source: &S,
        config: &DatasetConfig,
    ) -> PodnnResult<Dataset> {
        if source.n_v() != self.n_v {
            return Err(PodnnError::config(format!(
                "スナップショットの物理量数 {} がモデルの n_v {} と一致しません",
                source.n_v(),
                self.n_v
            )));
        }
        if config.mu_min.len() != source.n_params() {
            return Err(PodnnError::config(format!(
                "パラメータ次元 {} が供給元の次元 {} と一致しません",
                config.mu_min.len(),
                source.n_params()
            )));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mu = sample_parameters(
            config.sampling,
            config.n_s,
            &config.mu_min,
            &config.mu_max,
            &mut rng,
        )?;
        let (train_idx, val_idx) = split_samples(config.n_s, config.train_val_ratio, &mut rng)?;
        let times = time_grid(config.t_min, config.t_max, self.n_t);

        let (u_train, x_v_train) = assemble_snapshots(source, &self.x_mesh, &times, &mu, &train_idx)?;
        let (u_val, x_v_val) = assemble_snapshots(source, &self.x_mesh, &times, &mu, &val_idx)?;
        tracing::info!(
            n_s = config.n_s,
            n_train = train_idx.len(),
            n_val = val_idx.len(),
            n_h = u_train.nrows(),
            "スナップショットを生成しました"
        );

        let pod = match config.n_l {
            Some(n_l) if n_l > u_train.ncols() => {
                return Err(PodnnError::config(format!(
                    "要求された POD ランク {n_l} が学習スナップショット数 {} を超えています",
                    u_train.ncols()
                )));
            }
            Some(n_l) => PodBasis::fit_rank(&u_train, n_l)?,
            None => PodBasis::fit(&u_train, config.eps)?,
        };
        let v_train = pod.project(&u_train)?.reversed_axes();
        let v_val = pod.project(&u_val)?.reversed_axes();
        self.pod = Some(pod);

        Ok(Dataset {
            x_v_train,
            v_train,
            x_v_val,
            v_val,
            u_train,
            u_val,
            mu,
            train_idx,
            val_idx,
        })
    }

    /// 縮約データで回帰モデルを学習します。
    ///
    /// 層構成は `[x_v_train の列数, h_layers..., n_L]` になり、`config.layers` は使われません。
    /// `error_val` は `log_frequency` エポックごとに呼ばれ、返した検証誤差がログに出力されます。
    pub fn train<F>(
        &mut self,
        x_v_train: &Array2<f64>,
        v_train: &Array2<f64>,
        h_layers: &[usize],
        config: &BnnConfig,
        options: &FitOptions,
        mut error_val: F,
    ) -> PodnnResult<Vec<(EpochStats, f64)>>
    where
        F: FnMut(&Predictor<'_, B>) -> PodnnResult<f64>,
    {
        let pod = self.pod.as_ref().ok_or(PodnnError::ModelNotFitted)?;
        if h_layers.is_empty() {
            return Err(PodnnError::config("隠れ層が指定されていません"));
        }
        if v_train.ncols() != pod.n_l() {
            return Err(PodnnError::config(format!(
                "縮約係数の列数 {} が POD ランク {} と一致しません",
                v_train.ncols(),
                pod.n_l()
            )));
        }

        let mut layers = Vec::with_capacity(h_layers.len() + 2);
        layers.push(x_v_train.ncols());
        layers.extend_from_slice(h_layers);
        layers.push(pod.n_l());
        let full_config = BnnConfig {
            layers,
            ..config.clone()
        };

        let samples = self.samples;
        let mut regnn = BayesianNeuralNetwork::new(full_config, &self.device)?;
        let mut history = Vec::new();
        regnn.fit(x_v_train, v_train, options, |bnn, stats| {
            let predictor = Predictor {
                pod,
                regnn: bnn,
                samples,
            };
            let err = error_val(&predictor)?;
            tracing::info!(epoch = stats.epoch, loss = stats.loss, error_val = err, "検証誤差");
            history.push((*stats, err));
            Ok(())
        })?;
        self.regnn = Some(regnn);
        Ok(history)
    }

    pub fn predictor(&self) -> PodnnResult<Predictor<'_, B>> {
        match (&self.pod, &self.regnn) {
            (Some(pod), Some(regnn)) => Ok(Predictor {
                pod,
                regnn,
                samples: self.samples,
            }),
            _ => Err(PodnnError::ModelNotFitted),
        }
    }

    /// 物理空間での予測 `(n_h, rows)`
    pub fn predict(&self, x: &Array2<f64>) -> PodnnResult<Array2<f64>> {
        self.predictor()?.predict(x)
    }

    /// 物理空間での予測平均と標準偏差
    pub fn predict_var(&self, x: &Array2<f64>) -> PodnnResult<(Array2<f64>, Array2<f64>)> {
        self.predictor()?.predict_var(x)
    }

    /// 縮約空間での予測平均と分散
    pub fn predict_v(&self, x: &Array2<f64>) -> PodnnResult<(Array2<f64>, Array2<f64>)> {
        self.predictor()?.predict_v(x)
    }

    /// 列数からサンプル数を推定した形状
    pub fn shape_for(&self, n_cols: usize) -> PodnnResult<DatasetShape> {
        let steps = self.n_t.max(1);
        if n_cols == 0 || n_cols % steps != 0 {
            return Err(PodnnError::config(format!(
                "列数 {n_cols} は時間ステップ数 {steps} の倍数ではありません"
            )));
        }
        Ok(DatasetShape {
            n_v: self.n_v,
            space: self.space.clone(),
            n_t: self.n_t,
            n_s: n_cols / steps,
        })
    }

    /// 平坦な `(n_h, n_t * n_s)` 行列を `(n_v, n_x[, n_y], n_t, n_s)` に戻します。
    pub fn restruct(&self, flat: &Array2<f64>) -> PodnnResult<ArrayD<f64>> {
        restruct(&self.shape_for(flat.ncols())?, flat)
    }

    pub fn destruct(&self, structured: &ArrayD<f64>) -> PodnnResult<Array2<f64>> {
        let n_s = structured.shape().last().copied().unwrap_or(0);
        let shape = self.shape_for(n_s * self.n_t.max(1))?;
        destruct(&shape, structured)
    }

    /// モデル全体をディレクトリに保存します。
    pub fn save(&self, dir: &Path) -> PodnnResult<()> {
        let regnn = self.regnn.as_ref().ok_or(PodnnError::ModelNotFitted)?;
        fs::create_dir_all(dir)?;
        let checkpoint = PodnnCheckpoint {
            n_v: self.n_v,
            space: self.space.clone(),
            n_t: self.n_t,
            x_mesh: self.x_mesh.clone(),
            samples: self.samples,
            pod: self.pod.clone(),
        };
        write_atomic(
            &dir.join(PODNN_FILENAME),
            serde_json::to_string(&checkpoint)?.as_bytes(),
        )?;
        regnn.save(dir)?;
        tracing::info!(dir = %dir.display(), "POD-BNN モデルを保存しました");
        Ok(())
    }

    /// 保存済みのモデルを読み込みます。
    pub fn load(dir: &Path, device: &B::Device) -> PodnnResult<Self> {
        let path = dir.join(PODNN_FILENAME);
        if !path.exists() {
            return Err(PodnnError::CheckpointMissing {
                artifact: "POD 基底と形状情報",
                path,
            });
        }
        let checkpoint: PodnnCheckpoint = serde_json::from_str(&fs::read_to_string(&path)?)?;
        let regnn = BayesianNeuralNetwork::load(dir, device)?;
        let mut model = Self::new(
            checkpoint.n_v,
            checkpoint.x_mesh,
            checkpoint.space,
            checkpoint.n_t,
            device,
        )?
        .with_samples(checkpoint.samples)?;
        model.pod = checkpoint.pod;
        model.regnn = Some(regnn);
        Ok(model)
    }

    /// 生成したデータセットと分割インデックスをキャッシュします。
    pub fn save_train_data(&self, dir: &Path, dataset: &Dataset) -> PodnnResult<()> {
        fs::create_dir_all(dir)?;
        write_atomic(
            &dir.join(TRAIN_DATA_FILENAME),
            serde_json::to_string(dataset)?.as_bytes(),
        )
    }

    pub fn load_train_data(dir: &Path) -> PodnnResult<Dataset> {
        let path = dir.join(TRAIN_DATA_FILENAME);
        if !path.exists() {
            return Err(PodnnError::CheckpointMissing {
                artifact: "学習データのキャッシュ",
                path,
            });
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sampling;
    use crate::snapshots::create_linear_mesh;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    /// `u = mu x + t x^2` の2モードのスナップショット
    struct TwoModes;

    impl SnapshotSource for TwoModes {
        fn n_v(&self) -> usize {
            1
        }

        fn n_params(&self) -> usize {
            1
        }

        fn solution(&self, x_mesh: &Array2<f64>, t: f64, mu: &[f64]) -> Array2<f64> {
            Array2::from_shape_fn((1, x_mesh.nrows()), |(_, i)| {
                let x = x_mesh[[i, 0]];
                mu[0] * x + t * x * x
            })
        }
    }

    fn config(n_s: usize) -> DatasetConfig {
        DatasetConfig {
            t_min: 0.0,
            t_max: 1.0,
            mu_min: vec![1.0],
            mu_max: vec![2.0],
            n_s,
            train_val_ratio: 0.5,
            eps: 1e-10,
            n_l: None,
            sampling: Sampling::Lhs,
            seed: 7,
        }
    }

    fn model(n_t: usize) -> PodnnModel<TestBackend> {
        let device = Default::default();
        PodnnModel::new(1, create_linear_mesh(0.0, 1.0, 12), vec![12], n_t, &device).unwrap()
    }

    #[test]
    fn dataset_is_split_by_sample_and_reduced() {
        let mut podnn = model(5);
        let data = podnn.generate_dataset(&TwoModes, &config(10)).unwrap();
        assert_eq!(podnn.pod().unwrap().n_l(), 2);
        assert_eq!(data.train_idx.len(), 5);
        assert_eq!(data.val_idx.len(), 5);
        assert!(data.train_idx.iter().all(|i| !data.val_idx.contains(i)));
        assert_eq!(data.x_v_train.dim(), (25, 2));
        assert_eq!(data.v_train.dim(), (25, 2));
        assert_eq!(data.u_val.dim(), (12, 25));
        // 入力は [t, mu]
        assert_eq!(data.x_v_train[[4, 0]], 1.0);
    }

    #[test]
    fn fixed_rank_larger_than_training_columns_is_rejected() {
        let mut podnn = model(0);
        let cfg = DatasetConfig {
            n_l: Some(4),
            ..config(6)
        };
        assert!(matches!(
            podnn.generate_dataset(&TwoModes, &cfg),
            Err(PodnnError::Configuration(_))
        ));
    }

    #[test]
    fn predicting_or_saving_before_training_fails() {
        let mut podnn = model(3);
        let x = Array2::zeros((2, 2));
        assert!(matches!(podnn.predict(&x), Err(PodnnError::ModelNotFitted)));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(podnn.save(dir.path()), Err(PodnnError::ModelNotFitted)));

        let data = podnn.generate_dataset(&TwoModes, &config(4)).unwrap();
        let result = podnn.train(
            &data.x_v_train,
            &data.v_train,
            &[],
            &BnnConfig::default(),
            &FitOptions::default(),
            |_| Ok(0.0),
        );
        assert!(matches!(result, Err(PodnnError::Configuration(_))));
    }

    #[test]
    fn layer_widths_come_from_data_and_hidden_layers() {
        let mut podnn = model(3);
        let data = podnn.generate_dataset(&TwoModes, &config(4)).unwrap();
        let options = FitOptions {
            epochs: 2,
            batch_size: 0,
            log_frequency: 1,
        };
        let history = podnn
            .train(
                &data.x_v_train,
                &data.v_train,
                &[6, 5],
                &BnnConfig::default(),
                &options,
                |_| Ok(0.0),
            )
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(podnn.regnn().unwrap().config().layers, vec![2, 6, 5, 2]);
    }

    #[test]
    fn restruct_infers_sample_count() {
        let podnn = model(3);
        let flat = Array2::from_shape_fn((12, 6), |(i, j)| (i * 10 + j) as f64);
        let structured = podnn.restruct(&flat).unwrap();
        assert_eq!(structured.shape(), &[1, 12, 3, 2]);
        assert_eq!(structured[[0, 4, 1, 1]], flat[[4, 4]]);
        assert_eq!(podnn.destruct(&structured).unwrap(), flat);
        assert!(podnn.restruct(&Array2::zeros((12, 5))).is_err());
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        assert!(matches!(
            PodnnModel::<TestBackend>::load(dir.path(), &device),
            Err(PodnnError::CheckpointMissing { .. })
        ));
        assert!(matches!(
            PodnnModel::<TestBackend>::load_train_data(dir.path()),
            Err(PodnnError::CheckpointMissing { .. })
        ));
    }
}
