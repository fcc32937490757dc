use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(author, version, about = "A POD-BNN reduced-order surrogate with Burn", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します（train または infer）。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// データセットを生成してPOD-BNNモデルを学習し、結果をディレクトリに保存します
    Train {
        /// ハイパーパラメータのJSONファイル（省略時は既定値）
        #[arg(long)]
        hp: Option<PathBuf>,
    },
    /// 保存されたPOD-BNNモデルを使い、検証データで推論と誤差評価を実行します
    Infer {
        #[arg(long)]
        hp: Option<PathBuf>,
    },
}
