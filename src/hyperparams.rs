//! # ハイパーパラメータ
//!
//! 実験全体の設定を JSON ファイルから読み込みます。省略した項目は
//! 1次元 Burgers 方程式の実験の既定値になります。

use crate::dataset::{DatasetConfig, Sampling};
use crate::error::{PodnnError, PodnnResult};
use crate::inference::DEFAULT_SAMPLES;
use crate::model::Activation;
use crate::norm::NormPolicy;
use crate::regression::BnnConfig;
use crate::training::FitOptions;
use crate::variational::{Prior, UNIT_SIGMA_RHO};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperParams {
    // --- 空間・時間 ---
    pub n_v: usize,
    pub x_min: f64,
    pub x_max: f64,
    pub n_x: usize,
    pub n_t: usize,
    pub t_min: f64,
    pub t_max: f64,

    // --- パラメータ空間とデータセット ---
    pub mu_min: Vec<f64>,
    pub mu_max: Vec<f64>,
    pub n_s: usize,
    pub train_val_ratio: f64,
    pub eps: f64,
    pub n_l: Option<usize>,
    pub sampling: Sampling,

    // --- 回帰モデル ---
    pub h_layers: Vec<usize>,
    pub lr: f64,
    pub klw: f64,
    pub activation: Activation,
    pub prior: Prior,
    pub soft_0: f64,
    pub rho_0: f64,
    pub adv_eps: Option<f64>,
    /// L2 正則化の係数
    pub lambda: Option<f64>,
    pub norm: NormPolicy,

    // --- 学習ループ ---
    pub epochs: usize,
    pub batch_size: usize,
    pub log_frequency: usize,

    // --- 予測と出力 ---
    pub samples: usize,
    pub seed: u64,
    pub cache_dir: PathBuf,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            n_v: 1,
            x_min: 0.0,
            x_max: 1.5,
            n_x: 256,
            n_t: 100,
            t_min: 1.0,
            t_max: 5.0,
            mu_min: vec![0.001],
            mu_max: vec![0.0100],
            n_s: 100,
            train_val_ratio: 0.5,
            eps: 1e-10,
            n_l: None,
            sampling: Sampling::Lhs,
            h_layers: vec![40, 40],
            lr: 1e-2,
            klw: 1e-2,
            activation: Activation::Relu,
            prior: Prior::default(),
            soft_0: 0.01,
            rho_0: UNIT_SIGMA_RHO,
            adv_eps: None,
            lambda: None,
            norm: NormPolicy::MinMax,
            epochs: 5000,
            batch_size: 0,
            log_frequency: 500,
            samples: DEFAULT_SAMPLES,
            seed: 1111,
            cache_dir: PathBuf::from("cache"),
        }
    }
}

impl HyperParams {
    /// JSON ファイルから読み込みます。
    pub fn from_file(path: &Path) -> PodnnResult<Self> {
        let text = fs::read_to_string(path)?;
        let hp: Self = serde_json::from_str(&text)?;
        tracing::info!(path = %path.display(), "ハイパーパラメータを読み込みました");
        Ok(hp)
    }

    pub fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig {
            t_min: self.t_min,
            t_max: self.t_max,
            mu_min: self.mu_min.clone(),
            mu_max: self.mu_max.clone(),
            n_s: self.n_s,
            train_val_ratio: self.train_val_ratio,
            eps: self.eps,
            n_l: self.n_l,
            sampling: self.sampling,
            seed: self.seed,
        }
    }

    /// 回帰モデルの設定。層構成は学習時に `h_layers` とデータから決まるため空にしておきます。
    pub fn bnn_config(&self) -> BnnConfig {
        BnnConfig {
            layers: Vec::new(),
            lr: self.lr,
            klw: self.klw,
            activation: self.activation,
            prior: self.prior,
            soft_0: self.soft_0,
            adv_eps: self.adv_eps,
            weight_decay: self.lambda,
            norm: self.norm,
            rho_0: self.rho_0,
            seed: self.seed,
        }
    }

    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            epochs: self.epochs,
            batch_size: self.batch_size,
            log_frequency: self.log_frequency,
        }
    }

    /// 1次元メッシュの実験に必要な値を確認します。
    pub fn validate(&self) -> PodnnResult<()> {
        if self.n_x == 0 || !(self.x_max > self.x_min) {
            return Err(PodnnError::config(format!(
                "空間メッシュの設定が不正です: [{}, {}] x {}",
                self.x_min, self.x_max, self.n_x
            )));
        }
        if self.n_t > 0 && !(self.t_max >= self.t_min) {
            return Err(PodnnError::config(format!(
                "時間区間が不正です: [{}, {}]",
                self.t_min, self.t_max
            )));
        }
        if self.samples == 0 {
            return Err(PodnnError::config("予測のサンプル数は 1 以上である必要があります"));
        }
        Ok(())
    }
}
