//! # 固有直交分解 (POD)
//!
//! スナップショット行列を特異値分解し、エネルギー基準で打ち切った正規直交基底を
//! 求めます。打ち切りによって失われる分散は `pod_variance` として保持され、
//! 予測の不確かさに加算されます。

use crate::error::{PodnnError, PodnnResult};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// 特異値をゼロとみなす相対閾値
const SINGULAR_TOL: f64 = 1e-12;

/// 学習済みの POD 基底。
///
/// 一度求めた基底は変更されません。再学習する場合は値ごと置き換えます。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodBasis {
    basis: Array2<f64>,
    singular_values: Vec<f64>,
    pod_variance: Array1<f64>,
}

impl PodBasis {
    /// 打ち切られるエネルギー比が `eps` 以下になる最小ランクで基底を求めます。
    pub fn fit(u: &Array2<f64>, eps: f64) -> PodnnResult<Self> {
        if !eps.is_finite() || eps < 0.0 {
            return Err(PodnnError::config(format!(
                "POD 許容誤差 eps は非負の有限値である必要があります: {eps}"
            )));
        }
        let (left, sigma) = decompose(u)?;
        let energy: Vec<f64> = sigma.iter().map(|s| s * s).collect();
        let total: f64 = energy.iter().sum();

        // 末尾から累積した「捨てるエネルギー」で判定し、桁落ちを避ける
        let mut tail = vec![0.0; energy.len() + 1];
        for i in (0..energy.len()).rev() {
            tail[i] = tail[i + 1] + energy[i];
        }
        let n_l = (1..=energy.len())
            .find(|&n| tail[n] / total <= eps)
            .ok_or_else(|| {
                PodnnError::InsufficientRank(format!(
                    "{} 個の特異値では eps = {eps} を満たせません",
                    energy.len()
                ))
            })?;

        Self::truncate(u, &left, sigma, n_l)
    }

    /// ランクを `n_l` に固定して基底を求めます。
    pub fn fit_rank(u: &Array2<f64>, n_l: usize) -> PodnnResult<Self> {
        let max_rank = u.nrows().min(u.ncols());
        if n_l == 0 || n_l > max_rank {
            return Err(PodnnError::config(format!(
                "POD ランク {n_l} は 1..={max_rank} の範囲外です"
            )));
        }
        let (left, sigma) = decompose(u)?;
        let significant = sigma
            .iter()
            .filter(|&&s| s > SINGULAR_TOL * sigma[0])
            .count();
        if significant < n_l {
            return Err(PodnnError::InsufficientRank(format!(
                "有意な特異値は {significant} 個しかなく、ランク {n_l} を構成できません"
            )));
        }
        Self::truncate(u, &left, sigma, n_l)
    }

    fn truncate(
        u: &Array2<f64>,
        left: &DMatrix<f64>,
        sigma: Vec<f64>,
        n_l: usize,
    ) -> PodnnResult<Self> {
        let basis = Array2::from_shape_fn((left.nrows(), n_l), |(i, j)| left[(i, j)]);

        // 打ち切り残差 U - V V^T U の座標ごとの平均二乗
        let residual = u - &basis.dot(&basis.t().dot(u));
        let pod_variance = residual
            .mapv(|r| r * r)
            .mean_axis(Axis(1))
            .ok_or_else(|| PodnnError::config("スナップショットが空です"))?;

        tracing::info!(
            n_l,
            n_h = basis.nrows(),
            n_cols = u.ncols(),
            "POD 基底を構成しました"
        );
        Ok(Self {
            basis,
            singular_values: sigma,
            pod_variance,
        })
    }

    /// 物理空間から縮約空間へ射影します (`V^T U`)。
    pub fn project(&self, u: &Array2<f64>) -> PodnnResult<Array2<f64>> {
        if u.nrows() != self.n_h() {
            return Err(PodnnError::config(format!(
                "射影する行列の行数 {} が基底の行数 {} と一致しません",
                u.nrows(),
                self.n_h()
            )));
        }
        Ok(self.basis.t().dot(u))
    }

    /// 縮約係数から物理空間の場を復元します (`V v`)。
    pub fn lift(&self, v: &Array2<f64>) -> PodnnResult<Array2<f64>> {
        if v.nrows() != self.n_l() {
            return Err(PodnnError::config(format!(
                "縮約係数の行数 {} がランク {} と一致しません",
                v.nrows(),
                self.n_l()
            )));
        }
        Ok(self.basis.dot(v))
    }

    /// 縮約係数の分散を物理空間の分散に変換します。
    ///
    /// 係数が独立であると仮定し `(V∘V) v_var` を返します。打ち切り分散は含みません。
    pub fn lift_variance(&self, v_var: &Array2<f64>) -> PodnnResult<Array2<f64>> {
        if v_var.nrows() != self.n_l() {
            return Err(PodnnError::config(format!(
                "分散の行数 {} がランク {} と一致しません",
                v_var.nrows(),
                self.n_l()
            )));
        }
        Ok(self.basis.mapv(|x| x * x).dot(v_var))
    }

    pub fn basis(&self) -> &Array2<f64> {
        &self.basis
    }

    pub fn n_l(&self) -> usize {
        self.basis.ncols()
    }

    pub fn n_h(&self) -> usize {
        self.basis.nrows()
    }

    pub fn singular_values(&self) -> &[f64] {
        &self.singular_values
    }

    /// 座標ごとの打ち切り分散
    pub fn pod_variance(&self) -> &Array1<f64> {
        &self.pod_variance
    }

    /// 打ち切り分散のスカラー要約 (`sqrt(mean(pod_variance))`)
    pub fn pod_sigma(&self) -> f64 {
        self.pod_variance.mean().unwrap_or(0.0).sqrt()
    }

    /// 保持したエネルギーの割合
    pub fn energy_ratio(&self) -> f64 {
        let total: f64 = self.singular_values.iter().map(|s| s * s).sum();
        let kept: f64 = self.singular_values[..self.n_l()]
            .iter()
            .map(|s| s * s)
            .sum();
        kept / total
    }
}

/// 特異値分解を行い、降順に並べた左特異ベクトルと特異値を返します。
fn decompose(u: &Array2<f64>) -> PodnnResult<(DMatrix<f64>, Vec<f64>)> {
    if u.is_empty() {
        return Err(PodnnError::config("スナップショット行列が空です"));
    }
    if let Some(bad) = u.iter().find(|x| !x.is_finite()) {
        return Err(PodnnError::NumericInstability {
            context: "スナップショット行列",
            epoch: None,
            value: *bad,
        });
    }

    let m = DMatrix::from_fn(u.nrows(), u.ncols(), |i, j| u[[i, j]]);
    let svd = m.svd(true, false);
    let left = svd
        .u
        .ok_or_else(|| PodnnError::Tensor("SVD の左特異ベクトルが計算されませんでした".into()))?;

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
    let sigma: Vec<f64> = order.iter().map(|&i| svd.singular_values[i]).collect();
    let left = DMatrix::from_fn(left.nrows(), order.len(), |i, j| left[(i, order[j])]);

    let scale = u.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));
    if sigma[0] <= SINGULAR_TOL * scale.max(f64::MIN_POSITIVE) || sigma[0] == 0.0 {
        return Err(PodnnError::InsufficientRank(
            "スナップショットに変動がありません（全ての特異値がほぼ 0）".into(),
        ));
    }
    Ok((left, sigma))
}
