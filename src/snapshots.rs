//! # 高精度スナップショットの供給元
//!
//! 解析解や事前計算済みデータから `u(x, t, mu)` を評価するためのインターフェースと、
//! 簡単なメッシュ生成、1次元 Burgers 方程式の解析解を提供します。

use ndarray::Array2;

/// スナップショットの供給元。
///
/// 同じ `(x_mesh, t, mu)` に対しては常に同じ値を返す必要があります。
pub trait SnapshotSource {
    /// 物理量の数 `n_v`
    fn n_v(&self) -> usize;

    /// パラメータ `mu` の次元
    fn n_params(&self) -> usize;

    /// メッシュ上の解を `(n_v, n_space)` の形で返します。
    fn solution(&self, x_mesh: &Array2<f64>, t: f64, mu: &[f64]) -> Array2<f64>;
}

/// 等間隔の1次元メッシュ `(n_x, 1)` を作成します。
pub fn create_linear_mesh(x_min: f64, x_max: f64, n_x: usize) -> Array2<f64> {
    let x = linspace(x_min, x_max, n_x);
    Array2::from_shape_fn((n_x, 1), |(i, _)| x[i])
}

/// 等間隔の2次元格子メッシュ `(n_x * n_y, 2)` を作成します。x 方向が最も速く変化します。
pub fn create_grid_mesh(
    (x_min, x_max, n_x): (f64, f64, usize),
    (y_min, y_max, n_y): (f64, f64, usize),
) -> Array2<f64> {
    let x = linspace(x_min, x_max, n_x);
    let y = linspace(y_min, y_max, n_y);
    Array2::from_shape_fn((n_x * n_y, 2), |(k, d)| match d {
        0 => x[k % n_x],
        _ => y[k / n_x],
    })
}

/// `[start, end]` を `n` 点で等分します。
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// 粘性 Burgers 方程式の解析解。
///
/// `u = (x/t) / (1 + sqrt(t/t0) * exp(x^2 / (4 mu t)))`, `t0 = exp(1 / (8 mu))`
#[derive(Debug, Clone, Copy, Default)]
pub struct Burgers1d;

impl Burgers1d {
    pub fn u(x: f64, t: f64, mu: f64) -> f64 {
        let t0 = (1.0 / (8.0 * mu)).exp();
        (x / t) / (1.0 + (t / t0).sqrt() * (x * x / (4.0 * mu * t)).exp())
    }
}

impl SnapshotSource for Burgers1d {
    fn n_v(&self) -> usize {
        1
    }

    fn n_params(&self) -> usize {
        1
    }

    fn solution(&self, x_mesh: &Array2<f64>, t: f64, mu: &[f64]) -> Array2<f64> {
        let n = x_mesh.nrows();
        Array2::from_shape_fn((1, n), |(_, i)| Self::u(x_mesh[[i, 0]], t, mu[0]))
    }
}
