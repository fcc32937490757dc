//! 入力特徴量の正規化
//!
//! 境界値は最初の学習時に一度だけ計算され、以後の学習・予測で同じものを使います。

use crate::error::{PodnnError, PodnnResult};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// 正規化の方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormPolicy {
    #[default]
    None,
    /// `(x - lb) - (ub - lb) / 2`
    Center,
    /// `(x - lb) / (ub - lb)`
    MinMax,
    /// `(x - mean) / std`
    MeanStd,
}

/// 特徴量ごとの境界値。`MeanStd` では `lb` が平均、`ub` が標準偏差です。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormBounds {
    pub policy: NormPolicy,
    pub lb: Vec<f64>,
    pub ub: Vec<f64>,
}

impl NormBounds {
    /// 学習入力から境界値を計算します。`NormPolicy::None` では `None` を返します。
    pub fn fit(policy: NormPolicy, x: &Array2<f64>) -> PodnnResult<Option<Self>> {
        if x.nrows() == 0 {
            return Err(PodnnError::config("正規化対象の入力が空です"));
        }
        let (lb, ub) = match policy {
            NormPolicy::None => return Ok(None),
            NormPolicy::Center | NormPolicy::MinMax => {
                let lb = x.fold_axis(Axis(0), f64::INFINITY, |a, &b| a.min(b));
                let ub = x.fold_axis(Axis(0), f64::NEG_INFINITY, |a, &b| a.max(b));
                (lb.to_vec(), ub.to_vec())
            }
            NormPolicy::MeanStd => {
                let mean = x
                    .mean_axis(Axis(0))
                    .ok_or_else(|| PodnnError::config("正規化対象の入力が空です"))?;
                let std = x.std_axis(Axis(0), 0.0);
                (mean.to_vec(), std.to_vec())
            }
        };
        Ok(Some(Self { policy, lb, ub }))
    }

    /// 保存された境界値で入力を変換します。入力自体は変更しません。
    pub fn apply(&self, x: &Array2<f64>) -> PodnnResult<Array2<f64>> {
        if x.ncols() != self.lb.len() {
            return Err(PodnnError::config(format!(
                "入力の列数 {} が正規化境界の次元 {} と一致しません",
                x.ncols(),
                self.lb.len()
            )));
        }
        let mut out = x.to_owned();
        for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (lb, ub) = (self.lb[j], self.ub[j]);
            match self.policy {
                NormPolicy::None => {}
                NormPolicy::Center => col.mapv_inplace(|v| (v - lb) - 0.5 * (ub - lb)),
                NormPolicy::MinMax => {
                    let range = nonzero(ub - lb);
                    col.mapv_inplace(|v| (v - lb) / range);
                }
                NormPolicy::MeanStd => {
                    let std = nonzero(ub);
                    col.mapv_inplace(|v| (v - lb) / std);
                }
            }
        }
        Ok(out)
    }
}

// 定数の特徴量は 1 で割る
fn nonzero(w: f64) -> f64 {
    if w.abs() > f64::EPSILON { w } else { 1.0 }
}
