use crate::error::{PodnnError, PodnnResult};
use crate::regression::{BayesianNeuralNetwork, FitState};
use crate::training::to_tensor;
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Tensor, TensorData};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// 予測時の既定のサンプル数
pub const DEFAULT_SAMPLES: usize = 200;

impl<B: AutodiffBackend> BayesianNeuralNetwork<B> {
    /// 入力 `x` に対する予測平均と予測分散を返します。
    ///
    /// 乱数は設定のシードから毎回同じ系列で生成されるため、同じ入力には同じ予測を返します。
    pub fn predict(
        &self,
        x: &Array2<f64>,
        samples: usize,
    ) -> PodnnResult<(Array2<f64>, Array2<f64>)> {
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(2));
        self.predict_with_rng(x, samples, &mut rng)
    }

    /// 呼び出し側の乱数生成器で `samples` 回の順伝播を行い、予測を合成します。
    ///
    /// 平均は各サンプルの平均の平均、分散は全分散の公式
    /// `mean(var_i + mean_i^2) - mean^2` で求めます。
    /// 有限でないサンプルは要素ごとに除外し、その数を警告として記録します。
    pub fn predict_with_rng(
        &self,
        x: &Array2<f64>,
        samples: usize,
        rng: &mut StdRng,
    ) -> PodnnResult<(Array2<f64>, Array2<f64>)> {
        if self.state == FitState::Initialized {
            return Err(PodnnError::ModelNotFitted);
        }
        if samples == 0 {
            return Err(PodnnError::config("予測のサンプル数は 1 以上である必要があります"));
        }
        if x.ncols() != self.config.n_in() {
            return Err(PodnnError::config(format!(
                "入力の列数 {} が層構成の入力幅 {} と一致しません",
                x.ncols(),
                self.config.n_in()
            )));
        }

        let x_norm = match &self.norm_bounds {
            Some(bounds) => bounds.apply(x)?,
            None => x.to_owned(),
        };
        let model = self.model.valid();
        let input = to_tensor::<B::InnerBackend>(&x_norm, &model.device());

        let shape = (x.nrows(), self.config.n_out());
        let mut sum_mean = Array2::<f64>::zeros(shape);
        let mut sum_second = Array2::<f64>::zeros(shape);
        let mut counts = Array2::<usize>::zeros(shape);
        let mut unstable_draws = 0;

        for _ in 0..samples {
            let out = model.forward(input.clone(), rng, false);
            let mean = to_host(out.mean, shape)?;
            let scale = to_host(out.scale, shape)?;
            let mut unstable = false;
            for ((i, j), &m) in mean.indexed_iter() {
                let var = scale[[i, j]] * scale[[i, j]];
                if m.is_finite() && var.is_finite() {
                    sum_mean[[i, j]] += m;
                    sum_second[[i, j]] += var + m * m;
                    counts[[i, j]] += 1;
                } else {
                    unstable = true;
                }
            }
            unstable_draws += usize::from(unstable);
        }

        if let Some(((i, j), _)) = counts.indexed_iter().find(|&(_, &c)| c == 0) {
            tracing::error!(row = i, col = j, "全サンプルが有限値ではありません");
            return Err(PodnnError::NumericInstability {
                context: "予測",
                epoch: None,
                value: f64::NAN,
            });
        }
        if unstable_draws > 0 {
            tracing::warn!(unstable_draws, samples, "有限でない予測サンプルを除外しました");
        }

        let n = counts.mapv(|c| c as f64);
        let mean = &sum_mean / &n;
        let var = (&sum_second / &n - mean.mapv(|m| m * m)).mapv(|v| v.max(0.0));
        Ok((mean, var))
    }
}

fn to_host<B: burn::prelude::Backend>(
    t: Tensor<B, 2>,
    shape: (usize, usize),
) -> PodnnResult<Array2<f64>> {
    let data: TensorData = t.into_data();
    let values = data
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| PodnnError::Tensor(format!("{e:?}")))?;
    Ok(Array2::from_shape_vec(shape, values.into_iter().map(f64::from).collect())?)
}
