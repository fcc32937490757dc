//! # ベイズニューラルネットワークによる回帰
//!
//! ハイパーパラメータ ([`BnnConfig`]) と学習済みパラメータを1つのハンドルにまとめ、
//! 学習 ([`training`](crate::training))、予測 ([`inference`](crate::inference))、
//! 保存・読み込みを提供します。

use crate::error::{PodnnError, PodnnResult};
use crate::model::{Activation, BnnArchitecture, BnnModel};
use crate::norm::{NormBounds, NormPolicy};
use crate::variational::{Prior, UNIT_SIGMA_RHO};
use crate::{BNN_PARAMS_FILENAME, BNN_WEIGHTS_FILENAME, write_atomic};
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 回帰モデルのハイパーパラメータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BnnConfig {
    /// `[n_in, h_1, ..., h_k, n_out]`
    pub layers: Vec<usize>,
    pub lr: f64,
    /// KL 項の重み
    pub klw: f64,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub prior: Prior,
    /// 出力標準偏差の softplus 前のスケール
    pub soft_0: f64,
    /// 敵対的摂動の大きさ。`None` で無効
    #[serde(default)]
    pub adv_eps: Option<f64>,
    /// Adam の重み減衰 (L2 正則化)
    #[serde(default)]
    pub weight_decay: Option<f64>,
    #[serde(default)]
    pub norm: NormPolicy,
    /// 事後分布の `rho` の初期値 (`sigma = softplus(rho)`)
    pub rho_0: f64,
    pub seed: u64,
}

impl Default for BnnConfig {
    fn default() -> Self {
        Self {
            layers: vec![2, 40, 40, 1],
            lr: 1e-2,
            klw: 1e-2,
            activation: Activation::Relu,
            prior: Prior::default(),
            soft_0: 0.01,
            adv_eps: None,
            weight_decay: None,
            norm: NormPolicy::MinMax,
            rho_0: UNIT_SIGMA_RHO,
            seed: 1111,
        }
    }
}

impl BnnConfig {
    pub fn validate(&self) -> PodnnResult<()> {
        if self.layers.len() < 2 {
            return Err(PodnnError::config(format!(
                "層構成には入力と出力の幅が必要です: {:?}",
                self.layers
            )));
        }
        if self.layers.contains(&0) {
            return Err(PodnnError::config(format!(
                "層の幅に 0 が含まれています: {:?}",
                self.layers
            )));
        }
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(PodnnError::config(format!("学習率が不正です: {}", self.lr)));
        }
        if !(self.klw >= 0.0 && self.klw.is_finite()) {
            return Err(PodnnError::config(format!("KL 重みが不正です: {}", self.klw)));
        }
        if !(self.soft_0 > 0.0 && self.soft_0.is_finite()) {
            return Err(PodnnError::config(format!("soft_0 が不正です: {}", self.soft_0)));
        }
        if let Some(eps) = self.adv_eps {
            if !(eps > 0.0 && eps.is_finite()) {
                return Err(PodnnError::config(format!("adv_eps が不正です: {eps}")));
            }
        }
        if let Some(decay) = self.weight_decay {
            if !(decay >= 0.0 && decay.is_finite()) {
                return Err(PodnnError::config(format!("重み減衰が不正です: {decay}")));
            }
        }
        if let Prior::Mixture {
            pi,
            sigma_1,
            sigma_2,
        } = self.prior
        {
            if !(pi > 0.0 && pi < 1.0) || !(sigma_1 > 0.0) || !(sigma_2 > 0.0) {
                return Err(PodnnError::config(format!(
                    "混合事前分布のパラメータが不正です: pi={pi}, sigma_1={sigma_1}, sigma_2={sigma_2}"
                )));
            }
        }
        Ok(())
    }

    pub fn n_in(&self) -> usize {
        self.layers[0]
    }

    pub fn n_out(&self) -> usize {
        self.layers[self.layers.len() - 1]
    }

    fn architecture(&self) -> BnnArchitecture<'_> {
        BnnArchitecture {
            layers: &self.layers,
            activation: self.activation,
            prior: self.prior,
            kl_weight: self.klw,
            soft_0: self.soft_0,
            rho_0: self.rho_0,
        }
    }
}

/// 学習の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitState {
    Initialized,
    Fitting,
    Fitted,
}

/// 保存されるハイパーパラメータと正規化境界
#[derive(Debug, Serialize, Deserialize)]
struct BnnCheckpoint {
    config: BnnConfig,
    norm_bounds: Option<NormBounds>,
}

/// 学習済みパラメータを保持する回帰モデルのハンドル。
#[derive(Debug)]
pub struct BayesianNeuralNetwork<B: AutodiffBackend> {
    pub(crate) config: BnnConfig,
    pub(crate) model: BnnModel<B>,
    pub(crate) norm_bounds: Option<NormBounds>,
    pub(crate) state: FitState,
    pub(crate) device: B::Device,
}

impl<B: AutodiffBackend> BayesianNeuralNetwork<B> {
    /// 設定を検証し、乱数シードから重みを初期化します。
    pub fn new(config: BnnConfig, device: &B::Device) -> PodnnResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let model = BnnModel::new(&config.architecture(), device, &mut rng);
        Ok(Self {
            config,
            model,
            norm_bounds: None,
            state: FitState::Initialized,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &BnnConfig {
        &self.config
    }

    pub fn state(&self) -> FitState {
        self.state
    }

    pub fn norm_bounds(&self) -> Option<&NormBounds> {
        self.norm_bounds.as_ref()
    }

    pub fn model(&self) -> &BnnModel<B> {
        &self.model
    }

    /// 学習済みモデルをディレクトリに保存します。
    pub fn save(&self, dir: &Path) -> PodnnResult<()> {
        if self.state == FitState::Initialized {
            return Err(PodnnError::ModelNotFitted);
        }
        fs::create_dir_all(dir)?;

        let checkpoint = BnnCheckpoint {
            config: self.config.clone(),
            norm_bounds: self.norm_bounds.clone(),
        };
        write_atomic(
            &dir.join(BNN_PARAMS_FILENAME),
            serde_json::to_string_pretty(&checkpoint)?.as_bytes(),
        )?;

        let weights = dir.join(BNN_WEIGHTS_FILENAME);
        let staging = weights.with_extension("tmp.mpk");
        self.model
            .clone()
            .save_file(&staging, &NamedMpkFileRecorder::<FullPrecisionSettings>::new())?;
        fs::rename(&staging, &weights)?;
        tracing::info!(dir = %dir.display(), "回帰モデルを保存しました");
        Ok(())
    }

    /// 保存済みのモデルを読み込みます。
    pub fn load(dir: &Path, device: &B::Device) -> PodnnResult<Self> {
        let params = dir.join(BNN_PARAMS_FILENAME);
        if !params.exists() {
            return Err(PodnnError::CheckpointMissing {
                artifact: "回帰モデルのハイパーパラメータ",
                path: params,
            });
        }
        let weights = dir.join(BNN_WEIGHTS_FILENAME);
        if !weights.exists() {
            return Err(PodnnError::CheckpointMissing {
                artifact: "回帰モデルの重み",
                path: weights,
            });
        }

        let checkpoint: BnnCheckpoint = serde_json::from_str(&fs::read_to_string(&params)?)?;
        let mut bnn = Self::new(checkpoint.config, device)?;
        bnn.model = bnn.model.load_file(
            &weights,
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )?;
        bnn.norm_bounds = checkpoint.norm_bounds;
        bnn.state = FitState::Fitted;
        tracing::info!(dir = %dir.display(), "回帰モデルを読み込みました");
        Ok(bnn)
    }
}
