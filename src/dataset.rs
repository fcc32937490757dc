//! # データセットの再構成
//!
//! 学習に使う平坦な行列 `(n_h, n_t * n_s)` と、プロットや誤差評価に使う構造化配列
//! `(n_v, n_x[, n_y], n_t, n_s)` の相互変換、パラメータのサンプリング、
//! サンプル単位での学習/検証分割を提供します。

use crate::error::{PodnnError, PodnnResult};
use crate::snapshots::{SnapshotSource, linspace};
use ndarray::{Array2, ArrayD, Dimension, IxDyn};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// 構造化配列の形状。`n_t == 0` は時間軸を持たないデータを表します。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetShape {
    pub n_v: usize,
    pub space: Vec<usize>,
    pub n_t: usize,
    pub n_s: usize,
}

impl DatasetShape {
    pub fn n_space(&self) -> usize {
        self.space.iter().product()
    }

    /// 平坦化後の行数 `n_v * n_space`
    pub fn n_h(&self) -> usize {
        self.n_v * self.n_space()
    }

    /// 1サンプルあたりの時間ステップ数（時間軸なしでは 1）
    pub fn steps(&self) -> usize {
        self.n_t.max(1)
    }

    /// 平坦化後の列数
    pub fn n_cols(&self) -> usize {
        self.steps() * self.n_s
    }

    /// 構造化配列の次元
    pub fn dims(&self) -> Vec<usize> {
        let mut dims = Vec::with_capacity(self.space.len() + 3);
        dims.push(self.n_v);
        dims.extend_from_slice(&self.space);
        if self.n_t > 0 {
            dims.push(self.n_t);
        }
        dims.push(self.n_s);
        dims
    }

    fn validate(&self) -> PodnnResult<()> {
        if self.n_v == 0 || self.space.is_empty() || self.n_space() == 0 || self.n_s == 0 {
            return Err(PodnnError::config(format!("不正なデータ形状です: {self:?}")));
        }
        Ok(())
    }

    // 構造化配列のインデックス -> 平坦化行列の (行, 列)
    fn flat_index(&self, idx: &[usize]) -> (usize, usize) {
        let n_dims = self.space.len();
        let mut x = 0;
        for (d, &n) in self.space.iter().enumerate() {
            x = x * n + idx[1 + d];
        }
        let (t, s) = if self.n_t > 0 {
            (idx[1 + n_dims], idx[2 + n_dims])
        } else {
            (0, idx[1 + n_dims])
        };
        (idx[0] * self.n_space() + x, s * self.steps() + t)
    }
}

/// 構造化配列を平坦な `(n_h, n_t * n_s)` 行列に変換します。
pub fn destruct(shape: &DatasetShape, structured: &ArrayD<f64>) -> PodnnResult<Array2<f64>> {
    shape.validate()?;
    if structured.shape() != shape.dims().as_slice() {
        return Err(PodnnError::config(format!(
            "構造化配列の形状 {:?} が期待値 {:?} と一致しません",
            structured.shape(),
            shape.dims()
        )));
    }
    let mut flat = Array2::zeros((shape.n_h(), shape.n_cols()));
    for (idx, &value) in structured.indexed_iter() {
        flat[shape.flat_index(idx.slice())] = value;
    }
    Ok(flat)
}

/// 平坦な行列を構造化配列に戻します。[`destruct`] の逆変換です。
pub fn restruct(shape: &DatasetShape, flat: &Array2<f64>) -> PodnnResult<ArrayD<f64>> {
    shape.validate()?;
    if flat.dim() != (shape.n_h(), shape.n_cols()) {
        return Err(PodnnError::config(format!(
            "平坦化行列の形状 {:?} が期待値 {:?} と一致しません",
            flat.dim(),
            (shape.n_h(), shape.n_cols())
        )));
    }
    let mut structured = ArrayD::zeros(IxDyn(&shape.dims()));
    for (idx, value) in structured.indexed_iter_mut() {
        *value = flat[shape.flat_index(idx.slice())];
    }
    Ok(structured)
}

/// サンプル単位で学習/検証に分割します。
///
/// 学習側のサンプル数は `round(ratio * n_s)` を `[1, n_s - 1]` に収めた値です。
pub fn split_samples<R: Rng>(
    n_s: usize,
    train_val_ratio: f64,
    rng: &mut R,
) -> PodnnResult<(Vec<usize>, Vec<usize>)> {
    if n_s < 2 {
        return Err(PodnnError::config(format!(
            "学習/検証分割には 2 サンプル以上が必要です (n_s = {n_s})"
        )));
    }
    if !(train_val_ratio > 0.0 && train_val_ratio < 1.0) {
        return Err(PodnnError::config(format!(
            "train_val_ratio は (0, 1) の範囲である必要があります: {train_val_ratio}"
        )));
    }
    let n_train = ((train_val_ratio * n_s as f64).round() as usize).clamp(1, n_s - 1);
    let mut idx: Vec<usize> = (0..n_s).collect();
    idx.shuffle(rng);
    let mut val = idx.split_off(n_train);
    idx.sort_unstable();
    val.sort_unstable();
    Ok((idx, val))
}

/// パラメータ空間のサンプリング方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sampling {
    #[default]
    Lhs,
    Uniform,
}

/// `[mu_min, mu_max]` の箱から `n_s` 個のパラメータを抽出し `(n_s, n_p)` で返します。
pub fn sample_parameters<R: Rng>(
    sampling: Sampling,
    n_s: usize,
    mu_min: &[f64],
    mu_max: &[f64],
    rng: &mut R,
) -> PodnnResult<Array2<f64>> {
    if mu_min.len() != mu_max.len() || mu_min.is_empty() {
        return Err(PodnnError::config(
            "mu_min と mu_max は同じ長さの非空ベクトルである必要があります",
        ));
    }
    let n_p = mu_min.len();
    let mut unit = Array2::<f64>::zeros((n_s, n_p));
    match sampling {
        Sampling::Uniform => unit.mapv_inplace(|_| rng.random::<f64>()),
        Sampling::Lhs => {
            // 各次元で n_s 個の層を1つずつ使う
            for mut col in unit.columns_mut() {
                let mut strata: Vec<usize> = (0..n_s).collect();
                strata.shuffle(rng);
                for (v, k) in col.iter_mut().zip(strata) {
                    *v = (k as f64 + rng.random::<f64>()) / n_s as f64;
                }
            }
        }
    }
    Ok(Array2::from_shape_fn((n_s, n_p), |(i, j)| {
        mu_min[j] + (mu_max[j] - mu_min[j]) * unit[[i, j]]
    }))
}

/// 時間格子。`n_t == 0` では空です。
pub fn time_grid(t_min: f64, t_max: f64, n_t: usize) -> Vec<f64> {
    linspace(t_min, t_max, n_t)
}

/// 選択したサンプルのスナップショット行列 `(n_h, steps * n)` と入力特徴量
/// `(steps * n, [1 +] n_p)` を組み立てます。
pub fn assemble_snapshots<S: SnapshotSource + ?Sized>(
    source: &S,
    x_mesh: &Array2<f64>,
    times: &[f64],
    mu: &Array2<f64>,
    samples: &[usize],
) -> PodnnResult<(Array2<f64>, Array2<f64>)> {
    let n_v = source.n_v();
    let n_space = x_mesh.nrows();
    let n_p = mu.ncols();
    let steps = times.len().max(1);
    let n_d = n_p + usize::from(!times.is_empty());

    let mut u = Array2::zeros((n_v * n_space, steps * samples.len()));
    let mut x_v = Array2::zeros((steps * samples.len(), n_d));
    for (k, &s) in samples.iter().enumerate() {
        let mu_s = mu.row(s).to_vec();
        for step in 0..steps {
            let col = k * steps + step;
            let t = times.get(step).copied().unwrap_or(0.0);
            let snapshot = source.solution(x_mesh, t, &mu_s);
            if snapshot.dim() != (n_v, n_space) {
                return Err(PodnnError::config(format!(
                    "スナップショットの形状 {:?} が期待値 {:?} と一致しません",
                    snapshot.dim(),
                    (n_v, n_space)
                )));
            }
            for ((v, x), &value) in snapshot.indexed_iter() {
                u[[v * n_space + x, col]] = value;
            }
            let mut row = x_v.row_mut(col);
            let offset = if times.is_empty() {
                0
            } else {
                row[0] = t;
                1
            };
            for j in 0..n_p {
                row[offset + j] = mu_s[j];
            }
        }
    }
    Ok((u, x_v))
}

/// 生成されたデータセット。`u_val` は誤差評価専用で、回帰モデルには渡しません。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub x_v_train: Array2<f64>,
    pub v_train: Array2<f64>,
    pub x_v_val: Array2<f64>,
    pub v_val: Array2<f64>,
    pub u_train: Array2<f64>,
    pub u_val: Array2<f64>,
    pub mu: Array2<f64>,
    pub train_idx: Vec<usize>,
    pub val_idx: Vec<usize>,
}

/// データセット生成の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub t_min: f64,
    pub t_max: f64,
    pub mu_min: Vec<f64>,
    pub mu_max: Vec<f64>,
    pub n_s: usize,
    pub train_val_ratio: f64,
    /// POD の打ち切り許容誤差
    pub eps: f64,
    /// 指定した場合は POD ランクを固定します
    #[serde(default)]
    pub n_l: Option<usize>,
    #[serde(default)]
    pub sampling: Sampling,
    pub seed: u64,
}
