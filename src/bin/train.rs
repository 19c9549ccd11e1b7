//! 学習プログラム: フォルダ単位のラベル付き画像でモデルを学習して保存する
#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use image_classifier::interrupt::cancel_on_ctrl_c;
use image_classifier::logging::init_logging;
use image_classifier::model::{AppConfig, DeviceType};
use image_classifier::run_training_pipeline;

#[derive(Parser, Debug)]
#[command(name = "train", about = "画像分類モデルを学習する")]
struct Args {
    /// 設定ファイル（JSON）
    #[arg(long)]
    config: Option<PathBuf>,

    /// アセットのルートディレクトリ（設定ファイルより優先）
    #[arg(long)]
    assets: Option<PathBuf>,

    /// CPU（NdArray）で実行する
    #[arg(long)]
    cpu: bool,

    /// デバッグログを出力する
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
        wait_for_enter();
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
    config.display();

    let cancel = cancel_on_ctrl_c().context("Ctrl-C ハンドラを登録できません")?;
    let report = match config.device_type {
        #[cfg(feature = "gpu")]
        DeviceType::Wgpu => {
            let device = burn_wgpu::WgpuDevice::default();
            run_training_pipeline::<burn::backend::Wgpu>(&config, &device, cancel)
        }
        #[cfg(not(feature = "gpu"))]
        DeviceType::Wgpu => {
            tracing::warn!("gpu 機能が無効なため CPU で実行します");
            let device = burn_ndarray::NdArrayDevice::Cpu;
            run_training_pipeline::<burn::backend::NdArray>(&config, &device, cancel)
        }
        DeviceType::Cpu => {
            let device = burn_ndarray::NdArrayDevice::Cpu;
            run_training_pipeline::<burn::backend::NdArray>(&config, &device, cancel)
        }
    }
    .context("学習に失敗しました")?;

    println!(
        "完了: {} (MicroAccuracy {:.4})",
        report.published_model.display(),
        report.metrics.micro_accuracy
    );
    Ok(())
}

fn wait_for_enter() {
    println!("Enterキーを押すと終了します...");
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
}
