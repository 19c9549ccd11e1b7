//! ログ出力の初期化

use tracing_subscriber::EnvFilter;

/// tracingサブスクライバを初期化
///
/// `RUST_LOG` が設定されていればそれを優先し、なければ `verbose` に応じて
/// info / debug を使う。2回目以降の呼び出しは無視される。
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("image_classifier={default_level},warn")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_thread_ids(verbose)
        .try_init();
}
