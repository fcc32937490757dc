//! # エラー型
//!
//! POD・回帰モデル・チェックポイント処理で共通に使うエラーを定義します。

use std::path::PathBuf;
use thiserror::Error;

/// クレート全体の結果型
pub type PodnnResult<T> = Result<T, PodnnError>;

/// POD-BNN パイプラインのエラー
#[derive(Error, Debug)]
pub enum PodnnError {
    /// ハイパーパラメータや入力形状が不正
    #[error("設定エラー: {0}")]
    Configuration(String),

    /// 許容誤差を満たす POD ランクが得られない
    #[error("POD ランク不足: {0}")]
    InsufficientRank(String),

    /// 学習（またはロード）前に予測・保存が呼ばれた
    #[error("モデルが未学習です。先に学習またはロードを行ってください")]
    ModelNotFitted,

    /// チェックポイントに必要なファイルが存在しない
    #[error("チェックポイントの {artifact} が見つかりません: {}", path.display())]
    CheckpointMissing {
        artifact: &'static str,
        path: PathBuf,
    },

    /// 損失または予測に NaN/Inf が現れた
    #[error("数値不安定 ({context}): epoch {epoch:?}, 値 {value}")]
    NumericInstability {
        context: &'static str,
        epoch: Option<usize>,
        value: f64,
    },

    #[error("入出力エラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON エラー: {0}")]
    Json(#[from] serde_json::Error),

    /// burn のレコーダによる重みの保存・読み込みエラー
    #[error("重みファイルのエラー: {0}")]
    Recorder(#[from] burn::record::RecorderError),

    #[error("テンソル変換エラー: {0}")]
    Tensor(String),
}

impl PodnnError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<ndarray::ShapeError> for PodnnError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Configuration(format!("配列形状の不一致: {err}"))
    }
}
