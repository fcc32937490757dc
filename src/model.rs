use crate::variational::{DenseVariational, Prior, WeightSample, softplus};
use burn::module::{Ignored, Module};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// 隠れ層の活性化関数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Tanh,
    Linear,
}

impl Activation {
    fn forward<B: Backend>(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Self::Relu => activation::relu(x),
            Self::Tanh => activation::tanh(x),
            Self::Linear => x,
        }
    }
}

/// 予測分布の下限となる標準偏差
const SCALE_FLOOR: f64 = 1e-4;

/// 1回の順伝播の結果。
pub struct BnnOutput<B: Backend> {
    /// 予測平均 `(rows, n_out)`
    pub mean: Tensor<B, 2>,
    /// 予測標準偏差 `(rows, n_out)`
    pub scale: Tensor<B, 2>,
    /// 全層の KL 項の和。予測時は `None` です。
    pub kl: Option<Tensor<B, 1>>,
}

/// POD 係数を回帰するベイズニューラルネットワーク。
///
/// 入力 `(t, mu)` から、最終層で `2 * n_out` 個の値を出力し、前半を平均、
/// 後半を softplus で正にした標準偏差として解釈します。
#[derive(Module, Debug)]
pub struct BnnModel<B: Backend> {
    layers: Vec<DenseVariational<B>>,
    activation: Ignored<Activation>,
    n_out: usize,
    soft_0: f64,
}

/// ネットワーク構成
#[derive(Debug, Clone)]
pub struct BnnArchitecture<'a> {
    /// `[n_in, h_1, ..., h_k, n_out]`
    pub layers: &'a [usize],
    pub activation: Activation,
    pub prior: Prior,
    pub kl_weight: f64,
    pub soft_0: f64,
    pub rho_0: f64,
}

impl<B: Backend> BnnModel<B> {
    /// 新しいモデルを初期化します。重みの初期値は `rng` から決まります。
    pub fn new<R: Rng>(arch: &BnnArchitecture<'_>, device: &B::Device, rng: &mut R) -> Self {
        let widths = arch.layers;
        let n_out = widths[widths.len() - 1];
        let mut layers = Vec::with_capacity(widths.len() - 1);
        for pair in widths[..widths.len() - 1].windows(2) {
            layers.push(DenseVariational::new(
                pair[0],
                pair[1],
                arch.prior,
                arch.kl_weight,
                arch.rho_0,
                device,
                rng,
            ));
        }
        let last_in = widths[widths.len() - 2];
        layers.push(DenseVariational::new(
            last_in,
            2 * n_out,
            arch.prior,
            arch.kl_weight,
            arch.rho_0,
            device,
            rng,
        ));
        Self {
            layers,
            activation: Ignored(arch.activation),
            n_out,
            soft_0: arch.soft_0,
        }
    }

    /// 重みを1回サンプリングして順伝播を実行します。
    ///
    /// `with_kl` が真のとき、サンプルした重みでの KL 項も合わせて計算します。
    pub fn forward<R: Rng>(&self, input: Tensor<B, 2>, rng: &mut R, with_kl: bool) -> BnnOutput<B> {
        let draws = self.sample_weights(rng);
        self.forward_with(input, &draws, with_kl)
    }

    /// 全層の重みを1回ずつサンプリングします。
    pub fn sample_weights<R: Rng>(&self, rng: &mut R) -> Vec<WeightSample<B>> {
        self.layers.iter().map(|layer| layer.sample_weights(rng)).collect()
    }

    /// サンプル済みの重みで順伝播を実行します。
    pub fn forward_with(
        &self,
        input: Tensor<B, 2>,
        draws: &[WeightSample<B>],
        with_kl: bool,
    ) -> BnnOutput<B> {
        let mut x = input;
        let mut kl: Option<Tensor<B, 1>> = None;
        let last = self.layers.len() - 1;
        for (i, (layer, sample)) in self.layers.iter().zip(draws).enumerate() {
            x = layer.apply(x, sample);
            if i < last {
                x = self.activation.0.forward(x);
            }
            if with_kl {
                let term = layer.kl_divergence(sample);
                kl = Some(match kl {
                    Some(acc) => acc + term,
                    None => term,
                });
            }
        }

        let rows = x.dims()[0];
        let mean = x.clone().slice([0..rows, 0..self.n_out]);
        let raw_scale = x.slice([0..rows, self.n_out..2 * self.n_out]);
        let scale = softplus(raw_scale.mul_scalar(self.soft_0)).add_scalar(SCALE_FLOOR);
        BnnOutput { mean, scale, kl }
    }

    pub fn n_out(&self) -> usize {
        self.n_out
    }

    pub fn device(&self) -> B::Device {
        self.layers[0].device()
    }
}

/// ガウス分布の負の対数尤度 (全要素の和)。
pub fn gaussian_nll<B: Backend>(
    mean: Tensor<B, 2>,
    scale: Tensor<B, 2>,
    target: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let n = target.shape().num_elements() as f64;
    let z = (target - mean) / scale.clone();
    (z.powf_scalar(2.0).mul_scalar(0.5) + scale.log())
        .sum()
        .add_scalar(0.5 * (2.0 * std::f64::consts::PI).ln() * n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    type TestBackend = NdArray<f32>;

    fn arch(layers: &[usize]) -> BnnArchitecture<'_> {
        BnnArchitecture {
            layers,
            activation: Activation::Tanh,
            prior: Prior::default(),
            kl_weight: 1e-3,
            soft_0: 1.0,
            rho_0: -5.0,
        }
    }

    #[test]
    fn output_halves_have_target_width() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        let model = BnnModel::<TestBackend>::new(&arch(&[2, 8, 3]), &device, &mut rng);
        let out = model.forward(Tensor::zeros([5, 2], &device), &mut rng, true);
        assert_eq!(out.mean.dims(), [5, 3]);
        assert_eq!(out.scale.dims(), [5, 3]);
        let scale: Vec<f32> = out.scale.into_data().to_vec().unwrap();
        assert!(scale.iter().all(|&s| s > 0.0));
        assert!(out.kl.is_some());

        let out = model.forward(Tensor::zeros([1, 2], &device), &mut rng, false);
        assert!(out.kl.is_none());
    }

    #[test]
    fn same_seed_gives_same_draw() {
        let device = Default::default();
        let model = BnnModel::<TestBackend>::new(&arch(&[1, 4, 1]), &device, &mut StdRng::seed_from_u64(9));
        let x = Tensor::<TestBackend, 2>::ones([3, 1], &device);
        let a: Vec<f32> = model
            .forward(x.clone(), &mut StdRng::seed_from_u64(5), false)
            .mean
            .into_data()
            .to_vec()
            .unwrap();
        let b: Vec<f32> = model
            .forward(x, &mut StdRng::seed_from_u64(5), false)
            .mean
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn nll_of_standard_normal_at_mean() {
        let device = Default::default();
        let zeros = Tensor::<TestBackend, 2>::zeros([1, 1], &device);
        let ones = Tensor::<TestBackend, 2>::ones([1, 1], &device);
        let nll = gaussian_nll(zeros.clone(), ones, zeros).into_scalar().elem::<f64>();
        assert!((nll - 0.5 * (2.0 * std::f64::consts::PI).ln()).abs() < 1e-5);
    }
}
