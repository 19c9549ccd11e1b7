//! 予測プログラム: 公開済みモデルでフォルダ内の画像を分類する

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use image_classifier::interrupt::cancel_on_ctrl_c;
use image_classifier::logging::init_logging;
use image_classifier::model::{AppConfig, DeviceType};
use image_classifier::run_prediction_pipeline;

#[derive(Parser, Debug)]
#[command(name = "predict", about = "学習済みモデルで画像を分類する")]
struct Args {
    /// 設定ファイル（JSON）
    #[arg(long)]
    config: Option<PathBuf>,

    /// アセットのルートディレクトリ
    #[arg(long)]
    assets: Option<PathBuf>,

    /// CPU（NdArray）で実行する
    #[arg(long)]
    cpu: bool,

    #[arg(long)]
    verbose: bool,

    /// 終了前にEnterの入力を待つ
    #[arg(long)]
    pause: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let result = run(&args);
    if let Err(ref err) = result {
        eprintln!("エラー: {:#}", err);
    }
    if args.pause {
        println!("Enterキーを押すと終了します...");
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    }
    if result.is_err() {
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let config_path = args.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&config_path)
        .with_context(|| format!("設定ファイルを読み込めません: {}", config_path.display()))?;
    if let Some(ref assets) = args.assets {
        config.assets.root = assets.clone();
    }
    if args.cpu {
        config.device_type = DeviceType::Cpu;
    }
    println!("計算デバイス: {}", config.device_type);

    let cancel = cancel_on_ctrl_c().context("Ctrl-C ハンドラを登録できません")?;
    let results = match config.device_type {
        #[cfg(feature = "gpu")]
        DeviceType::Wgpu => {
            let device = burn_wgpu::WgpuDevice::default();
            run_prediction_pipeline::<burn::backend::Wgpu>(&config, &device, cancel)
        }
        _ => {
            let device = burn_ndarray::NdArrayDevice::Cpu;
            run_prediction_pipeline::<burn::backend::NdArray>(&config, &device, cancel)
        }
    }
    .context("予測に失敗しました")?;

    println!("{} 枚の画像を分類しました", results.len());
    Ok(())
}
