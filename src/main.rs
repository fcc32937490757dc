//! # POD-BNN 縮約モデル サンプルプログラム
//!
//! 1次元の粘性 Burgers 方程式の解析解からスナップショットを生成し、
//! POD で縮約したうえでベイズニューラルネットワークを学習する代理モデルのサンプルです。
//!
//! `clap` クレートを利用して、コマンドラインから`train`（学習）と`infer`（推論）の
//! 機能を個別に実行できます。
//!
//! ## 使い方
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train --hp hp.json
//! ```
//!
//! ### 推論
//! ```bash
//! cargo run --release -- infer --hp hp.json
//! ```

use burn::backend::{Autodiff, NdArray};
use clap::Parser;
use ndarray::s;
use podnn::cli::{Cli, Commands};
use podnn::hyperparams::HyperParams;
use podnn::metrics::{re_mean_std, re_s};
use podnn::plot::{plot_history, plot_slice};
use podnn::snapshots::{Burgers1d, create_linear_mesh};
use podnn::{PodnnModel, PodnnResult};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

type MyBackend = Autodiff<NdArray<f32>>;

fn load_hp(path: Option<&Path>) -> PodnnResult<HyperParams> {
    let hp = match path {
        Some(path) => HyperParams::from_file(path)?,
        None => HyperParams::default(),
    };
    hp.validate()?;
    Ok(hp)
}

// --- サブコマンドに対応する関数 ---

/// `train`サブコマンドを実行します。
///
/// データセットの生成、モデルの学習、履歴グラフの描画、学習済みモデルの保存を行います。
fn run_training(hp: &HyperParams) -> PodnnResult<()> {
    let device = Default::default();
    println!("学習を開始します - バックエンド: Autodiff<NdArray> (CPU)");

    let x_mesh = create_linear_mesh(hp.x_min, hp.x_max, hp.n_x);
    let mut model = PodnnModel::<MyBackend>::new(hp.n_v, x_mesh, vec![hp.n_x], hp.n_t, &device)?
        .with_samples(hp.samples)?;

    let dataset = model.generate_dataset(&Burgers1d, &hp.dataset_config())?;
    if let Some(pod) = model.pod() {
        println!(
            "=> POD ランク: {} (保持エネルギー {:.6}, POD 標準偏差 {:.3e})",
            pod.n_l(),
            pod.energy_ratio(),
            pod.pod_sigma()
        );
    }
    model.save_train_data(&hp.cache_dir, &dataset)?;

    let training_start = Instant::now();
    let history = model.train(
        &dataset.x_v_train,
        &dataset.v_train,
        &hp.h_layers,
        &hp.bnn_config(),
        &hp.fit_options(),
        |predictor| {
            let u_pred = predictor.predict(&dataset.x_v_val)?;
            Ok(re_s(&dataset.u_val, &u_pred, true))
        },
    )?;
    println!("学習が完了しました。");
    println!("=> 学習時間: {:.2?}", training_start.elapsed());

    let graph = hp.cache_dir.join("history.png");
    if let Err(e) = plot_history(&graph, &history) {
        eprintln!("グラフの描画に失敗しました: {}", e);
    } else {
        println!("=> 学習履歴を '{}' に保存しました。", graph.display());
    }

    println!("学習済みモデルを保存中...");
    model.save(&hp.cache_dir)?;
    println!("=> モデルを '{}' に保存しました。", hp.cache_dir.display());
    Ok(())
}

/// `infer`サブコマンドを実行します。
///
/// 保存済みのモデルと学習データを読み込み、検証データで予測と誤差評価を行います。
fn run_inference(hp: &HyperParams) -> PodnnResult<()> {
    let device = Default::default();
    println!("\n推論を実行します - バックエンド: NdArray (CPU)");
    let inference_start = Instant::now();

    println!("保存済みモデルを '{}' からロード中...", hp.cache_dir.display());
    let model = PodnnModel::<MyBackend>::load(&hp.cache_dir, &device)?;
    let dataset = PodnnModel::<MyBackend>::load_train_data(&hp.cache_dir)?;

    let (u_mean, u_sigma) = model.predict_var(&dataset.x_v_val)?;
    println!("推論が完了しました。出力の形状: {:?}", u_mean.dim());
    println!("=> 推論時間: {:.2?}", inference_start.elapsed());

    let err = re_s(&dataset.u_val, &u_mean, true);
    let (err_mean, err_std) = re_mean_std(&model.restruct(&dataset.u_val)?, &model.restruct(&u_mean)?);
    println!("=> 検証誤差 RE: {:.4e}", err);
    println!("=> 平均場 RE: {:.4e}, 標準偏差場 RE: {:.4e}", err_mean, err_std);

    // 最初の検証サンプルの最終時刻
    let col = hp.n_t.max(1) - 1;
    let n_x = hp.n_x;
    let x: Vec<f64> = model.x_mesh().column(0).to_vec();
    let graph: PathBuf = hp.cache_dir.join("slice.png");
    let result = plot_slice(
        &graph,
        "Burgers 1D",
        &x,
        &dataset.u_val.slice(s![..n_x, col]).to_vec(),
        &u_mean.slice(s![..n_x, col]).to_vec(),
        &u_sigma.slice(s![..n_x, col]).to_vec(),
    );
    match result {
        Ok(()) => println!("=> 予測断面を '{}' に保存しました。", graph.display()),
        Err(e) => eprintln!("グラフの描画に失敗しました: {}", e),
    }
    Ok(())
}

/// プログラムのエントリーポイント。
///
/// コマンドライン引数を解析し、`train`または`infer`の処理に振り分けます。
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Train { hp } => load_hp(hp.as_deref()).and_then(|hp| run_training(&hp)),
        Commands::Infer { hp } => load_hp(hp.as_deref()).and_then(|hp| run_inference(&hp)),
    };
    if let Err(e) = result {
        eprintln!("エラー: {}", e);
        std::process::exit(1);
    }
}
