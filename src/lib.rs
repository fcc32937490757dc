//! # POD-BNN 縮約モデルライブラリ
//!
//! 固有直交分解 (POD) で高次元のスナップショットを縮約し、
//! `burn` フレームワークで構築したベイズニューラルネットワークで
//! パラメータから縮約係数への写像を学習する、不確かさ付きの代理モデルを提供します。

pub mod cli;
pub mod dataset;
pub mod error;
pub mod hyperparams;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod norm;
pub mod plot;
pub mod pod;
pub mod podnn;
pub mod regression;
pub mod snapshots;
pub mod training;
pub mod variational;

use std::fs;
use std::path::Path;

pub use error::{PodnnError, PodnnResult};
pub use pod::PodBasis;
pub use podnn::{PodnnModel, Predictor};
pub use regression::{BayesianNeuralNetwork, BnnConfig};

/// POD 基底と形状情報を保存するファイル名
pub const PODNN_FILENAME: &str = "podnn.json";
/// 回帰モデルのハイパーパラメータと正規化境界を保存するファイル名
pub const BNN_PARAMS_FILENAME: &str = "bnn_params.json";
/// 回帰モデルの重みを保存するファイル名
pub const BNN_WEIGHTS_FILENAME: &str = "bnn_weights.mpk";
/// 学習データのキャッシュを保存するファイル名
pub const TRAIN_DATA_FILENAME: &str = "train_data.json";

/// 一時ファイルに書き込んでから置き換えます。途中で失敗しても既存のファイルは壊れません。
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> PodnnResult<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    fs::write(&staging, bytes)?;
    fs::rename(&staging, path)?;
    Ok(())
}
