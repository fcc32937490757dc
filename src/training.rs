use crate::error::{PodnnError, PodnnResult};
use crate::model::{BnnModel, gaussian_nll};
use crate::norm::NormBounds;
use crate::regression::{BayesianNeuralNetwork, FitState};
use crate::variational::WeightSample;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// 学習ループの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOptions {
    pub epochs: usize,
    /// 0 でフルバッチ
    pub batch_size: usize,
    /// ログ出力とコールバック呼び出しの間隔 (エポック数)
    pub log_frequency: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 1000,
            batch_size: 0,
            log_frequency: 100,
        }
    }
}

/// ログ出力時点のエポックの要約
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f64,
}

impl<B: AutodiffBackend> BayesianNeuralNetwork<B> {
    /// 入力 `x` `(rows, n_in)` と目的変数 `v` `(rows, n_out)` でモデルを学習します。
    ///
    /// `log_frequency` エポックごとに `on_log` が現在のモデルを参照して呼ばれます。
    /// 入力は変更しません。正規化境界は最初の学習時にだけ計算されます。
    pub fn fit<F>(
        &mut self,
        x: &Array2<f64>,
        v: &Array2<f64>,
        options: &FitOptions,
        mut on_log: F,
    ) -> PodnnResult<Vec<EpochStats>>
    where
        F: FnMut(&Self, &EpochStats) -> PodnnResult<()>,
    {
        self.check_training_data(x, v, options)?;

        // --- 正規化 ---
        if self.norm_bounds.is_none() {
            self.norm_bounds = NormBounds::fit(self.config.norm, x)?;
        }
        let x_norm = match &self.norm_bounds {
            Some(bounds) => bounds.apply(x)?,
            None => x.to_owned(),
        };

        // --- オプティマイザの初期化 ---
        let mut adam = AdamConfig::new();
        if let Some(penalty) = self.config.weight_decay {
            adam = adam.with_weight_decay(Some(WeightDecayConfig::new(penalty as f32)));
        }
        let mut optim = adam.init();
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));

        let rows = x.nrows();
        let batch_size = match options.batch_size {
            0 => rows,
            n => n.min(rows),
        };
        let full_batch = (batch_size == rows).then(|| {
            (
                to_tensor::<B>(&x_norm, &self.device),
                to_tensor::<B>(v, &self.device),
            )
        });
        let mut order: Vec<usize> = (0..rows).collect();

        let prior_state = self.state;
        self.state = FitState::Fitting;
        let mut history = Vec::new();
        let training_start = Instant::now();
        tracing::info!(
            epochs = options.epochs,
            rows,
            batch_size,
            "学習を開始します"
        );

        // --- 学習ループ ---
        for epoch in 1..=options.epochs {
            let mut epoch_loss = 0.0;
            let batches: Vec<(Tensor<B, 2>, Tensor<B, 2>)> = match &full_batch {
                Some((xb, vb)) => vec![(xb.clone(), vb.clone())],
                None => {
                    order.shuffle(&mut rng);
                    order
                        .chunks(batch_size)
                        .map(|idx| {
                            (
                                to_tensor::<B>(&x_norm.select(Axis(0), idx), &self.device),
                                to_tensor::<B>(&v.select(Axis(0), idx), &self.device),
                            )
                        })
                        .collect()
                }
            };

            for (xb, vb) in batches {
                let kl_scale = xb.dims()[0] as f64 / rows as f64;
                let loss = step_loss(&self.model, xb, vb, kl_scale, self.config.adv_eps, &mut rng);
                let loss_val = loss.clone().into_scalar().elem::<f64>();
                if !loss_val.is_finite() {
                    self.state = prior_state;
                    tracing::error!(epoch, loss = loss_val, "損失が有限値ではありません");
                    return Err(PodnnError::NumericInstability {
                        context: "学習時の損失",
                        epoch: Some(epoch),
                        value: loss_val,
                    });
                }
                epoch_loss += loss_val;

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &self.model);
                self.model = optim.step(self.config.lr, self.model.clone(), grads);
            }

            if epoch % options.log_frequency == 0 || epoch == options.epochs {
                let stats = EpochStats {
                    epoch,
                    loss: epoch_loss,
                };
                tracing::info!(epoch, loss = epoch_loss, "学習中");
                if let Err(e) = on_log(self, &stats) {
                    self.state = prior_state;
                    tracing::error!(epoch, error = %e, "コールバックが失敗したため学習を中断します");
                    return Err(e);
                }
                history.push(stats);
            }
        }

        self.state = FitState::Fitted;
        tracing::info!(elapsed = ?training_start.elapsed(), "学習が完了しました");
        Ok(history)
    }

    fn check_training_data(
        &self,
        x: &Array2<f64>,
        v: &Array2<f64>,
        options: &FitOptions,
    ) -> PodnnResult<()> {
        if options.epochs == 0 {
            return Err(PodnnError::config("エポック数は 1 以上である必要があります"));
        }
        if options.log_frequency == 0 {
            return Err(PodnnError::config("log_frequency は 1 以上である必要があります"));
        }
        if x.nrows() == 0 || x.nrows() != v.nrows() {
            return Err(PodnnError::config(format!(
                "入力 {} 行と目的変数 {} 行が一致しないか空です",
                x.nrows(),
                v.nrows()
            )));
        }
        if x.ncols() != self.config.n_in() || v.ncols() != self.config.n_out() {
            return Err(PodnnError::config(format!(
                "データの列数 ({}, {}) が層構成の入出力幅 ({}, {}) と一致しません",
                x.ncols(),
                v.ncols(),
                self.config.n_in(),
                self.config.n_out()
            )));
        }
        Ok(())
    }
}

/// 1ステップ分の損失 (負の対数尤度 + KL 項 [+ 敵対的摂動の負の対数尤度]) を計算します。
///
/// KL 項はバッチの行数の割合 `kl_scale` 倍され、1エポック分の合計が1回分の KL 項になります。
/// 重みのサンプルは1ステップにつき1回だけ引き、敵対的摂動の計算にも同じものを使います。
fn step_loss<B: AutodiffBackend>(
    model: &BnnModel<B>,
    x: Tensor<B, 2>,
    v: Tensor<B, 2>,
    kl_scale: f64,
    adv_eps: Option<f64>,
    rng: &mut StdRng,
) -> Tensor<B, 1> {
    let draws = model.sample_weights(rng);
    let out = model.forward_with(x.clone(), &draws, true);
    let mut loss = gaussian_nll(out.mean, out.scale, v.clone());
    if let Some(kl) = out.kl {
        loss = loss + kl.mul_scalar(kl_scale);
    }

    if let Some(eps) = adv_eps {
        let x_adv = adversarial_input(model, x, v.clone(), &draws, eps);
        let adv = model.forward_with(x_adv, &draws, false);
        loss = loss + gaussian_nll(adv.mean, adv.scale, v);
    }
    loss
}

/// 入力に関する損失の勾配の符号方向へ `eps` だけ摂動させた入力を返します。
///
/// KL 項は入力に依存しないので、勾配は同じ重みでの負の対数尤度から求めます。
fn adversarial_input<B: AutodiffBackend>(
    model: &BnnModel<B>,
    x: Tensor<B, 2>,
    v: Tensor<B, 2>,
    draws: &[WeightSample<B>],
    eps: f64,
) -> Tensor<B, 2> {
    let fixed: Vec<WeightSample<B>> = draws.iter().map(WeightSample::detached).collect();
    let x_leaf = x.clone().detach().require_grad();
    let out = model.forward_with(x_leaf.clone(), &fixed, false);
    let grads = gaussian_nll(out.mean, out.scale, v.detach()).backward();
    match x_leaf.grad(&grads) {
        Some(grad_x) => x + Tensor::<B, 2>::from_inner(grad_x.sign().mul_scalar(eps)),
        None => x,
    }
}

/// ホスト側の行列をテンソルに変換します。
pub(crate) fn to_tensor<B: burn::prelude::Backend>(
    a: &Array2<f64>,
    device: &B::Device,
) -> Tensor<B, 2> {
    let values: Vec<f32> = a.iter().map(|&x| x as f32).collect();
    Tensor::from_data(TensorData::new(values, [a.nrows(), a.ncols()]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::BnnConfig;
    use burn::backend::{Autodiff, NdArray};
    use rand::Rng;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn small_config() -> BnnConfig {
        BnnConfig {
            layers: vec![1, 8, 1],
            lr: 1e-2,
            klw: 1e-3,
            soft_0: 1.0,
            ..BnnConfig::default()
        }
    }

    fn line(n: usize) -> (Array2<f64>, Array2<f64>) {
        let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64 / (n - 1) as f64);
        let v = x.mapv(|x| 2.0 * x);
        (x, v)
    }

    #[test]
    fn fit_rejects_bad_options_and_shapes() {
        let device = Default::default();
        let mut bnn = BayesianNeuralNetwork::<TestBackend>::new(small_config(), &device).unwrap();
        let (x, v) = line(8);
        let zero_epochs = FitOptions {
            epochs: 0,
            ..FitOptions::default()
        };
        assert!(matches!(
            bnn.fit(&x, &v, &zero_epochs, |_, _| Ok(())),
            Err(PodnnError::Configuration(_))
        ));
        let wide = Array2::zeros((8, 2));
        assert!(matches!(
            bnn.fit(&wide, &v, &FitOptions::default(), |_, _| Ok(())),
            Err(PodnnError::Configuration(_))
        ));
        assert_eq!(bnn.state(), FitState::Initialized);
    }

    #[test]
    fn fit_calls_observer_at_log_frequency_and_keeps_inputs() {
        let device = Default::default();
        let mut bnn = BayesianNeuralNetwork::<TestBackend>::new(small_config(), &device).unwrap();
        let (x, v) = line(16);
        let (x_before, v_before) = (x.clone(), v.clone());
        let options = FitOptions {
            epochs: 30,
            batch_size: 5,
            log_frequency: 10,
        };
        let mut seen = Vec::new();
        let history = bnn
            .fit(&x, &v, &options, |model, stats| {
                assert_eq!(model.state(), FitState::Fitting);
                seen.push(stats.epoch);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![10, 20, 30]);
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|s| s.loss.is_finite()));
        assert_eq!(x, x_before);
        assert_eq!(v, v_before);
        assert_eq!(bnn.state(), FitState::Fitted);
    }

    #[test]
    fn adversarial_term_trains() {
        let device = Default::default();
        let config = BnnConfig {
            adv_eps: Some(1e-3),
            ..small_config()
        };
        let mut bnn = BayesianNeuralNetwork::<TestBackend>::new(config, &device).unwrap();
        let (x, v) = line(10);
        let options = FitOptions {
            epochs: 5,
            batch_size: 0,
            log_frequency: 5,
        };
        let history = bnn.fit(&x, &v, &options, |_, _| Ok(())).unwrap();
        assert!(history[0].loss.is_finite());
    }

    #[test]
    fn failed_callback_leaves_model_unfitted() {
        let device = Default::default();
        let mut bnn = BayesianNeuralNetwork::<TestBackend>::new(small_config(), &device).unwrap();
        let (x, v) = line(8);
        let options = FitOptions {
            epochs: 4,
            batch_size: 0,
            log_frequency: 2,
        };
        let result = bnn.fit(&x, &v, &options, |_, _| {
            Err(PodnnError::Tensor("検証に失敗".to_string()))
        });
        assert!(matches!(result, Err(PodnnError::Tensor(_))));
        assert_eq!(bnn.state(), FitState::Initialized);
        assert!(matches!(bnn.predict(&x, 5), Err(PodnnError::ModelNotFitted)));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(bnn.save(dir.path()), Err(PodnnError::ModelNotFitted)));
    }

    #[test]
    fn kl_term_is_scaled_by_batch_fraction() {
        let device = Default::default();
        let config = BnnConfig {
            klw: 1.0,
            ..small_config()
        };
        let bnn = BayesianNeuralNetwork::<TestBackend>::new(config, &device).unwrap();
        let (x, v) = line(6);
        let (xt, vt) = (to_tensor::<TestBackend>(&x, &device), to_tensor::<TestBackend>(&v, &device));
        let loss_at = |kl_scale: f64| {
            let mut rng = StdRng::seed_from_u64(21);
            step_loss(bnn.model(), xt.clone(), vt.clone(), kl_scale, None, &mut rng)
                .into_scalar()
                .elem::<f64>()
        };
        let mut rng = StdRng::seed_from_u64(21);
        let kl = bnn
            .model()
            .forward(xt.clone(), &mut rng, true)
            .kl
            .unwrap()
            .into_scalar()
            .elem::<f64>();

        let full = loss_at(1.0);
        let half = loss_at(0.5);
        assert!((full - half - 0.5 * kl).abs() < 1e-4 * (1.0 + full.abs() + kl.abs()));
    }

    #[test]
    fn adversarial_step_reuses_the_weight_draw() {
        let device = Default::default();
        let bnn = BayesianNeuralNetwork::<TestBackend>::new(small_config(), &device).unwrap();
        let (x, v) = line(6);
        let (xt, vt) = (to_tensor::<TestBackend>(&x, &device), to_tensor::<TestBackend>(&v, &device));

        let mut with_adv = StdRng::seed_from_u64(8);
        let loss = step_loss(bnn.model(), xt, vt, 1.0, Some(1e-2), &mut with_adv);
        assert!(loss.into_scalar().elem::<f64>().is_finite());

        // 1ステップで引く重みのサンプルは1回分だけ
        let mut single_draw = StdRng::seed_from_u64(8);
        let _ = bnn.model().sample_weights(&mut single_draw);
        assert_eq!(with_adv.random::<u64>(), single_draw.random::<u64>());
    }

    #[test]
    fn bounds_are_fit_once() {
        let device = Default::default();
        let mut bnn = BayesianNeuralNetwork::<TestBackend>::new(small_config(), &device).unwrap();
        let (x, v) = line(6);
        let options = FitOptions {
            epochs: 2,
            batch_size: 0,
            log_frequency: 1,
        };
        bnn.fit(&x, &v, &options, |_, _| Ok(())).unwrap();
        let first = bnn.norm_bounds().cloned();

        let shifted = x.mapv(|x| x + 10.0);
        bnn.fit(&shifted, &v, &options, |_, _| Ok(())).unwrap();
        assert_eq!(bnn.norm_bounds().cloned(), first);
    }
}
