//! Ctrl-C による中断

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ctrl-C でフラグが立つキャンセルフラグを作成
///
/// 学習・バッチ予測はバッチの区切りでフラグを確認して `Cancelled` で終了する。
/// 2回目の Ctrl-C ではその場でプロセスを終了する。
/// ハンドラはプロセスにつき1回しか登録できない。
pub fn cancel_on_ctrl_c() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);

    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("中断を受け付けました。現在のバッチが終わり次第停止します（もう一度押すと即終了）");
    })?;

    Ok(cancel)
}
