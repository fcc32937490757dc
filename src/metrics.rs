//! 相対誤差と NaN を無視する集約。
//!
//! 集約で NaN を除外した場合でも、`count_non_finite` で不安定さを検出できます。

use ndarray::{Array, ArrayD, Axis, Dimension, RemoveAxis};

/// フロベニウスノルムによる相対誤差 `||u - u_pred|| / ||u||`
pub fn re<D: Dimension>(u: &Array<f64, D>, u_pred: &Array<f64, D>) -> f64 {
    let num: f64 = u
        .iter()
        .zip(u_pred.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum();
    let den: f64 = u.iter().map(|a| a * a).sum();
    (num / den).sqrt()
}

/// 列 (サンプル) ごとの相対誤差の平均。
///
/// `div_max` が真のときは分母を `sqrt(n_h) * max|u|` とし、値がほぼ 0 の列でも発散しません。
pub fn re_s(u: &ndarray::Array2<f64>, u_pred: &ndarray::Array2<f64>, div_max: bool) -> f64 {
    let max_abs = u.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));
    let scale = (u.nrows() as f64).sqrt() * max_abs;
    let errors: Vec<f64> = u
        .columns()
        .into_iter()
        .zip(u_pred.columns())
        .map(|(a, b)| {
            let num = a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f64>()
                .sqrt();
            let den = if div_max {
                scale
            } else {
                a.iter().map(|x| x * x).sum::<f64>().sqrt()
            };
            num / den
        })
        .collect();
    errors.iter().sum::<f64>() / errors.len() as f64
}

/// NaN を除いた平均。全要素が NaN の位置は NaN になります。
pub fn nan_mean_axis<D: RemoveAxis>(a: &Array<f64, D>, axis: Axis) -> Array<f64, D::Smaller> {
    a.map_axis(axis, |lane| {
        let (sum, n) = lane
            .iter()
            .filter(|x| x.is_finite())
            .fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
        if n == 0 { f64::NAN } else { sum / n as f64 }
    })
}

/// NaN を除いた母標準偏差
pub fn nan_std_axis<D: RemoveAxis>(a: &Array<f64, D>, axis: Axis) -> Array<f64, D::Smaller> {
    a.map_axis(axis, |lane| {
        let finite: Vec<f64> = lane.iter().copied().filter(|x| x.is_finite()).collect();
        if finite.is_empty() {
            return f64::NAN;
        }
        let mean = finite.iter().sum::<f64>() / finite.len() as f64;
        (finite.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / finite.len() as f64).sqrt()
    })
}

pub fn count_non_finite<D: Dimension>(a: &Array<f64, D>) -> usize {
    a.iter().filter(|x| !x.is_finite()).count()
}

/// 構造化配列のサンプル軸 (最後の軸) に沿った平均場と標準偏差場の相対誤差を返します。
pub fn re_mean_std(u: &ArrayD<f64>, u_pred: &ArrayD<f64>) -> (f64, f64) {
    let axis = Axis(u.ndim() - 1);
    let unstable = count_non_finite(u_pred);
    if unstable > 0 {
        tracing::warn!(unstable, "予測に有限でない値が含まれています");
    }
    let err_mean = re(&nan_mean_axis(u, axis), &nan_mean_axis(u_pred, axis));
    let err_std = re(&nan_std_axis(u, axis), &nan_std_axis(u_pred, axis));
    (err_mean, err_std)
}
