//! # 変分ベイズ全結合層
//!
//! 各重みを平均場ガウス事後分布 `N(mu, sigma^2)`, `sigma = 1e-5 + softplus(rho)` として持ち、
//! 順伝播ごとに再パラメータ化トリックで重みをサンプリングします。
//! KL 項は `log q(w) - log p(w)` のモンテカルロ推定で、事前分布の種類ごとに実装が分かれます。

use burn::module::{Module, Param};
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// 事後分布の標準偏差の下限
const SIGMA_FLOOR: f64 = 1e-5;

/// `softplus(rho) = 1` となる `rho` (`ln(e - 1)`)
pub const UNIT_SIGMA_RHO: f64 = 0.541_324_854_612_918_1;

/// 事前分布の設定
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Prior {
    /// 固定の2成分混合ガウス `pi * N(0, sigma_1^2) + (1 - pi) * N(0, sigma_2^2)`
    Mixture { pi: f64, sigma_1: f64, sigma_2: f64 },
    /// 層ごとに1つの学習可能なスケールを持つ `N(0, s^2)`
    Trainable,
}

impl Prior {
    /// 事後分布の平均の初期化に使う標準偏差。事前分布全体の標準偏差に一致させます。
    pub fn init_scale(&self) -> f64 {
        match *self {
            Self::Mixture {
                pi,
                sigma_1,
                sigma_2,
            } => (pi * sigma_1 * sigma_1 + (1.0 - pi) * sigma_2 * sigma_2).sqrt(),
            Self::Trainable => 1.0,
        }
    }
}

impl Default for Prior {
    fn default() -> Self {
        Self::Mixture {
            pi: 0.5,
            sigma_1: 1.5,
            sigma_2: 0.1,
        }
    }
}

/// 1回の順伝播で使う重みのサンプル
#[derive(Debug, Clone)]
pub struct GaussianSample<B: Backend, const D: usize> {
    pub value: Tensor<B, D>,
    pub mu: Tensor<B, D>,
    pub sigma: Tensor<B, D>,
}

impl<B: Backend, const D: usize> GaussianSample<B, D> {
    /// 事後分布でのサンプルの対数密度の総和 `Σ log q(w)`
    fn log_posterior(&self) -> Tensor<B, 1> {
        let z = (self.value.clone() - self.mu.clone()) / self.sigma.clone();
        let n = self.value.shape().num_elements() as f64;
        (z.powf_scalar(2.0).mul_scalar(0.5) + self.sigma.clone().log())
            .sum()
            .neg()
            .sub_scalar(0.5 * LN_2PI * n)
    }

    fn detached(&self) -> Self {
        Self {
            value: self.value.clone().detach(),
            mu: self.mu.clone().detach(),
            sigma: self.sigma.clone().detach(),
        }
    }
}

/// カーネルとバイアスのサンプル
#[derive(Debug, Clone)]
pub struct WeightSample<B: Backend> {
    pub kernel: GaussianSample<B, 2>,
    pub bias: GaussianSample<B, 1>,
}

impl<B: Backend> WeightSample<B> {
    /// 同じ値を持ち、計算グラフから切り離したサンプル
    pub fn detached(&self) -> Self {
        Self {
            kernel: self.kernel.detached(),
            bias: self.bias.detached(),
        }
    }
}

/// 変分層の共通インターフェース。
///
/// 重みのサンプリング、サンプルを使ったアフィン変換、KL 項の計算を分けておくことで、
/// 予測時には KL 計算を省略できます。
pub trait VariationalLayer<B: Backend> {
    fn posterior(&self) -> &Posterior<B>;

    /// KL 項の重み
    fn kl_weight(&self) -> f64;

    /// `Σ log p(w)`
    fn log_prior(&self, sample: &WeightSample<B>) -> Tensor<B, 1>;

    fn sample_weights<R: Rng>(&self, rng: &mut R) -> WeightSample<B> {
        self.posterior().sample(rng)
    }

    fn apply(&self, input: Tensor<B, 2>, sample: &WeightSample<B>) -> Tensor<B, 2> {
        input.matmul(sample.kernel.value.clone()) + sample.bias.value.clone().unsqueeze()
    }

    /// `klw * Σ (log q(w) - log p(w))`
    fn kl_divergence(&self, sample: &WeightSample<B>) -> Tensor<B, 1> {
        let log_q = sample.kernel.log_posterior() + sample.bias.log_posterior();
        (log_q - self.log_prior(sample)).mul_scalar(self.kl_weight())
    }
}

/// 平均場ガウス事後分布のパラメータ
#[derive(Module, Debug)]
pub struct Posterior<B: Backend> {
    kernel_mu: Param<Tensor<B, 2>>,
    kernel_rho: Param<Tensor<B, 2>>,
    bias_mu: Param<Tensor<B, 1>>,
    bias_rho: Param<Tensor<B, 1>>,
}

impl<B: Backend> Posterior<B> {
    /// 平均は `N(0, init_scale^2)`、`rho` は定数 `rho_0` で初期化します。
    pub fn new<R: Rng>(
        d_in: usize,
        d_out: usize,
        init_scale: f64,
        rho_0: f64,
        device: &B::Device,
        rng: &mut R,
    ) -> Self {
        let std = init_scale;
        let kernel_mu = normal_tensor::<B, 2, R>([d_in, d_out], std, device, rng);
        let bias_mu = normal_tensor::<B, 1, R>([d_out], std, device, rng);
        Self {
            kernel_mu: Param::from_tensor(kernel_mu),
            kernel_rho: Param::from_tensor(Tensor::full([d_in, d_out], rho_0, device)),
            bias_mu: Param::from_tensor(bias_mu),
            bias_rho: Param::from_tensor(Tensor::full([d_out], rho_0, device)),
        }
    }

    pub fn device(&self) -> B::Device {
        self.kernel_mu.val().device()
    }

    pub fn dims(&self) -> [usize; 2] {
        self.kernel_mu.val().dims()
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> WeightSample<B> {
        let device = self.device();
        let [d_in, d_out] = self.dims();
        let kernel = reparameterize(
            self.kernel_mu.val(),
            self.kernel_rho.val(),
            normal_tensor::<B, 2, R>([d_in, d_out], 1.0, &device, rng),
        );
        let bias = reparameterize(
            self.bias_mu.val(),
            self.bias_rho.val(),
            normal_tensor::<B, 1, R>([d_out], 1.0, &device, rng),
        );
        WeightSample { kernel, bias }
    }
}

fn reparameterize<B: Backend, const D: usize>(
    mu: Tensor<B, D>,
    rho: Tensor<B, D>,
    noise: Tensor<B, D>,
) -> GaussianSample<B, D> {
    let sigma = softplus(rho).add_scalar(SIGMA_FLOOR);
    GaussianSample {
        value: mu.clone() + sigma.clone() * noise,
        mu,
        sigma,
    }
}

/// 固定の混合ガウス事前分布を持つ変分層
#[derive(Module, Debug)]
pub struct MixturePriorDense<B: Backend> {
    posterior: Posterior<B>,
    kl_weight: f64,
    pi: f64,
    sigma_1: f64,
    sigma_2: f64,
}

impl<B: Backend> MixturePriorDense<B> {
    pub fn new(posterior: Posterior<B>, kl_weight: f64, pi: f64, sigma_1: f64, sigma_2: f64) -> Self {
        Self {
            posterior,
            kl_weight,
            pi,
            sigma_1,
            sigma_2,
        }
    }

    fn mixture_log_prob<const D: usize>(&self, w: Tensor<B, D>) -> Tensor<B, 1> {
        // logsumexp で2成分を合成する
        let w2 = w.powf_scalar(2.0);
        let a = w2
            .clone()
            .mul_scalar(-0.5 / (self.sigma_1 * self.sigma_1))
            .add_scalar(self.pi.ln() - self.sigma_1.ln());
        let b = w2
            .mul_scalar(-0.5 / (self.sigma_2 * self.sigma_2))
            .add_scalar((1.0 - self.pi).ln() - self.sigma_2.ln());
        let m = a.clone().max_pair(b.clone());
        let lse = m.clone() + ((a - m.clone()).exp() + (b - m).exp()).log();
        let n = lse.shape().num_elements() as f64;
        lse.sum().sub_scalar(0.5 * LN_2PI * n)
    }
}

impl<B: Backend> VariationalLayer<B> for MixturePriorDense<B> {
    fn posterior(&self) -> &Posterior<B> {
        &self.posterior
    }

    fn kl_weight(&self) -> f64 {
        self.kl_weight
    }

    fn log_prior(&self, sample: &WeightSample<B>) -> Tensor<B, 1> {
        self.mixture_log_prob(sample.kernel.value.clone())
            + self.mixture_log_prob(sample.bias.value.clone())
    }
}

/// 学習可能なスケールを持つ事前分布の変分層
#[derive(Module, Debug)]
pub struct TrainablePriorDense<B: Backend> {
    posterior: Posterior<B>,
    kl_weight: f64,
    prior_rho: Param<Tensor<B, 1>>,
}

impl<B: Backend> TrainablePriorDense<B> {
    /// 事前分布のスケールは 1 から始まります。
    pub fn new(posterior: Posterior<B>, kl_weight: f64) -> Self {
        let device = posterior.device();
        Self {
            posterior,
            kl_weight,
            prior_rho: Param::from_tensor(Tensor::full([1], UNIT_SIGMA_RHO, &device)),
        }
    }

    /// 現在の事前分布のスケール
    pub fn prior_scale(&self) -> Tensor<B, 1> {
        softplus(self.prior_rho.val()).add_scalar(SIGMA_FLOOR)
    }

    fn normal_log_prob<const D: usize>(&self, w: Tensor<B, D>) -> Tensor<B, 1> {
        let scale = self.prior_scale().unsqueeze::<D>();
        let n = w.shape().num_elements() as f64;
        let z2 = (w / scale.clone()).powf_scalar(2.0).mul_scalar(0.5);
        (z2 + scale.log()).sum().neg().sub_scalar(0.5 * LN_2PI * n)
    }
}

impl<B: Backend> VariationalLayer<B> for TrainablePriorDense<B> {
    fn posterior(&self) -> &Posterior<B> {
        &self.posterior
    }

    fn kl_weight(&self) -> f64 {
        self.kl_weight
    }

    fn log_prior(&self, sample: &WeightSample<B>) -> Tensor<B, 1> {
        self.normal_log_prob(sample.kernel.value.clone())
            + self.normal_log_prob(sample.bias.value.clone())
    }
}

/// ネットワークに並べる変分層。事前分布の種類で実装を切り替えます。
#[derive(Module, Debug)]
pub enum DenseVariational<B: Backend> {
    Mixture(MixturePriorDense<B>),
    Trainable(TrainablePriorDense<B>),
}

impl<B: Backend> DenseVariational<B> {
    pub fn new<R: Rng>(
        d_in: usize,
        d_out: usize,
        prior: Prior,
        kl_weight: f64,
        rho_0: f64,
        device: &B::Device,
        rng: &mut R,
    ) -> Self {
        let posterior = Posterior::new(d_in, d_out, prior.init_scale(), rho_0, device, rng);
        match prior {
            Prior::Mixture {
                pi,
                sigma_1,
                sigma_2,
            } => Self::Mixture(MixturePriorDense::new(posterior, kl_weight, pi, sigma_1, sigma_2)),
            Prior::Trainable => Self::Trainable(TrainablePriorDense::new(posterior, kl_weight)),
        }
    }

    pub fn sample_weights<R: Rng>(&self, rng: &mut R) -> WeightSample<B> {
        match self {
            Self::Mixture(layer) => layer.sample_weights(rng),
            Self::Trainable(layer) => layer.sample_weights(rng),
        }
    }

    pub fn apply(&self, input: Tensor<B, 2>, sample: &WeightSample<B>) -> Tensor<B, 2> {
        match self {
            Self::Mixture(layer) => layer.apply(input, sample),
            Self::Trainable(layer) => layer.apply(input, sample),
        }
    }

    pub fn kl_divergence(&self, sample: &WeightSample<B>) -> Tensor<B, 1> {
        match self {
            Self::Mixture(layer) => layer.kl_divergence(sample),
            Self::Trainable(layer) => layer.kl_divergence(sample),
        }
    }

    pub fn device(&self) -> B::Device {
        match self {
            Self::Mixture(layer) => layer.posterior.device(),
            Self::Trainable(layer) => layer.posterior.device(),
        }
    }
}

/// 数値的に安定な `softplus(x) = max(x, 0) + log(1 + exp(-|x|))`
pub fn softplus<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone().clamp_min(0.0) + x.abs().neg().exp().log1p()
}

/// ホスト側の乱数生成器から標準正規ノイズを作り、`std` 倍したテンソルを返します。
pub fn normal_tensor<B: Backend, const D: usize, R: Rng>(
    shape: [usize; D],
    std: f64,
    device: &B::Device,
    rng: &mut R,
) -> Tensor<B, D> {
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n)
        .map(|_| rng.sample::<f32, _>(StandardNormal) * std as f32)
        .collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    type TestBackend = NdArray<f32>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f64 {
        t.into_scalar().elem::<f64>()
    }

    #[test]
    fn softplus_is_stable_and_positive() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-100.0, 0.0, 100.0], &device);
        let y: Vec<f32> = softplus(x).into_data().to_vec().unwrap();
        assert!(y[0] >= 0.0 && y[0] < 1e-6);
        assert!((y[1] - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((y[2] - 100.0).abs() < 1e-4);
    }

    #[test]
    fn sampled_weights_follow_posterior_shape() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(1);
        let layer =
            DenseVariational::<TestBackend>::new(3, 4, Prior::default(), 1.0, -5.0, &device, &mut rng);
        let sample = layer.sample_weights(&mut rng);
        assert_eq!(sample.kernel.value.dims(), [3, 4]);
        assert_eq!(sample.bias.value.dims(), [4]);

        let out = layer.apply(Tensor::ones([2, 3], &device), &sample);
        assert_eq!(out.dims(), [2, 4]);
    }

    #[test]
    fn kl_weight_scales_divergence() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(2);
        let posterior = Posterior::<TestBackend>::new(2, 2, 1.0, -3.0, &device, &mut rng);
        let light = TrainablePriorDense::new(posterior.clone(), 0.5);
        let heavy = TrainablePriorDense::new(posterior, 1.0);
        let sample = light.sample_weights(&mut rng);
        let kl_light = scalar(light.kl_divergence(&sample));
        let kl_heavy = scalar(heavy.kl_divergence(&sample));
        assert!((2.0 * kl_light - kl_heavy).abs() < 1e-4 * kl_heavy.abs().max(1.0));
        assert!(kl_heavy.is_finite());
    }

    #[test]
    fn mixture_log_prior_matches_closed_form() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(4);
        let posterior = Posterior::<TestBackend>::new(1, 1, 1.0, -3.0, &device, &mut rng);
        let layer = MixturePriorDense::new(posterior, 1.0, 0.25, 1.0, 0.5);
        let w = Tensor::<TestBackend, 1>::from_floats([0.3], &device);
        let got = scalar(layer.mixture_log_prob(w));

        let pdf = |x: f64, s: f64| (-(x * x) / (2.0 * s * s)).exp() / (s * (2.0 * std::f64::consts::PI).sqrt());
        let expected = (0.25 * pdf(0.3, 1.0) + 0.75 * pdf(0.3, 0.5)).ln();
        assert!((got - expected).abs() < 1e-5);
    }

    #[test]
    fn posterior_starts_at_unit_sigma_with_prior_spread() {
        assert!((softplus_f64(UNIT_SIGMA_RHO) - 1.0).abs() < 1e-12);
        let mixture = Prior::default().init_scale();
        assert!((mixture - (0.5_f64 * 1.5 * 1.5 + 0.5 * 0.1 * 0.1).sqrt()).abs() < 1e-12);
        assert_eq!(Prior::Trainable.init_scale(), 1.0);

        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(5);
        let posterior =
            Posterior::<TestBackend>::new(40, 50, mixture, UNIT_SIGMA_RHO, &device, &mut rng);
        let mu: Vec<f32> = posterior.kernel_mu.val().into_data().to_vec().unwrap();
        let n = mu.len() as f64;
        let var = mu.iter().map(|&m| (m as f64).powi(2)).sum::<f64>() / n;
        assert!((var.sqrt() - mixture).abs() < 0.1 * mixture);

        let sample = posterior.sample(&mut rng);
        let sigma: Vec<f32> = sample.kernel.sigma.into_data().to_vec().unwrap();
        assert!(sigma.iter().all(|&s| (s - 1.0).abs() < 1e-4));
    }

    fn softplus_f64(x: f64) -> f64 {
        x.max(0.0) + (-x.abs()).exp().ln_1p()
    }
}
