//! # 結果の描画
//!
//! `plotters` で学習履歴と1次元の予測断面をPNGに描画します。

use crate::training::EpochStats;
use plotters::prelude::*;
use std::path::Path;

/// 損失と検証誤差の履歴を左右2つのグラフに描画します。
pub fn plot_history(path: &Path, history: &[(EpochStats, f64)]) -> Result<(), Box<dyn std::error::Error>> {
    if history.is_empty() {
        return Err("描画する履歴がありません".into());
    }
    let root = BitMapBackend::new(path, (1200, 500)).into_drawing_area();
    root.fill(&WHITE)?;
    let (left, right) = root.split_horizontally(600);

    let last_epoch = history[history.len() - 1].0.epoch;
    let (loss_min, loss_max) = bounds(history.iter().map(|(s, _)| s.loss));
    let mut chart = ChartBuilder::on(&left)
        .caption("Loss History", ("sans-serif", 30).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0..last_epoch, loss_min..loss_max)?;
    chart.configure_mesh().y_desc("Loss").x_desc("Epochs").draw()?;
    chart.draw_series(LineSeries::new(
        history.iter().map(|(s, _)| (s.epoch, s.loss)),
        &RED,
    ))?;

    // 検証誤差は正なので対数で描く
    let (err_min, err_max) = bounds(history.iter().map(|(_, e)| e.max(f64::MIN_POSITIVE).log10()));
    let mut chart = ChartBuilder::on(&right)
        .caption("Validation Error", ("sans-serif", 30).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0..last_epoch, err_min..err_max)?;
    chart
        .configure_mesh()
        .y_desc("RE (log10 scale)")
        .x_desc("Epochs")
        .draw()?;
    chart.draw_series(LineSeries::new(
        history
            .iter()
            .map(|(s, e)| (s.epoch, e.max(f64::MIN_POSITIVE).log10())),
        &BLUE,
    ))?;

    root.present()?;
    Ok(())
}

/// 1つの断面について真値、予測平均、±2σ の帯を描画します。
pub fn plot_slice(
    path: &Path,
    title: &str,
    x: &[f64],
    truth: &[f64],
    mean: &[f64],
    sigma: &[f64],
) -> Result<(), Box<dyn std::error::Error>> {
    if x.is_empty() || truth.len() != x.len() || mean.len() != x.len() || sigma.len() != x.len() {
        return Err("断面データの長さが一致しません".into());
    }
    let lower: Vec<f64> = mean.iter().zip(sigma).map(|(m, s)| m - 2.0 * s).collect();
    let upper: Vec<f64> = mean.iter().zip(sigma).map(|(m, s)| m + 2.0 * s).collect();
    let (x_min, x_max) = bounds(x.iter().copied());
    let (y_min, y_max) = bounds(truth.iter().chain(&lower).chain(&upper).copied());

    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 30).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)?;
    chart.configure_mesh().x_desc("x").y_desc("u").draw()?;

    let band: Vec<(f64, f64)> = x
        .iter()
        .zip(&upper)
        .map(|(&a, &b)| (a, b))
        .chain(x.iter().zip(&lower).rev().map(|(&a, &b)| (a, b)))
        .collect();
    chart
        .draw_series(std::iter::once(Polygon::new(band, BLUE.mix(0.2).filled())))?
        .label("±2σ")
        .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 20, y + 5)], BLUE.mix(0.2).filled()));
    chart
        .draw_series(LineSeries::new(x.iter().copied().zip(truth.iter().copied()), &BLACK))?
        .label("Truth")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLACK));
    chart
        .draw_series(LineSeries::new(x.iter().copied().zip(mean.iter().copied()), &BLUE))?
        .label("Prediction")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

/// 有限値の最小・最大。範囲が潰れる場合は少し広げます。
fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((hi - lo) * 0.05).max(1e-6);
    (lo - pad, hi + pad)
}
