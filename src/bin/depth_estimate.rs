// 该文件是 Tianmu （天目） 项目的一部分。
// src/bin/depth_estimate.rs - 单目深度估计示例
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use tianmu::{
  DepthEstimation, Device, FromUrl, ImageInput,
  output::{DepthImageOutput, Render},
};

/// Tianmu 深度估计参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图像：image:///path.png
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出深度图：image:///depth.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 权重缓存目录
  #[arg(long, value_name = "DIR")]
  pub checkpoint_dir: Option<PathBuf>,
  /// 推理设备：cpu、gpu 或 accelerator
  #[arg(long, value_name = "DEVICE")]
  pub device: Option<Device>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let image = ImageInput::from_url(&args.input)?.into_rgb()?;
  let output = DepthImageOutput::from_url(&args.output)?;

  let mut depth = match args.checkpoint_dir {
    Some(dir) => DepthEstimation::with_checkpoint_dir(dir)?,
    None => DepthEstimation::new()?,
  };
  if let Some(device) = args.device {
    depth.to(device)?;
  }

  info!("开始推理...");
  let now = std::time::Instant::now();
  let map = depth.call(image.clone())?;
  info!(
    "推理完成，耗时: {:.2?}, 深度图 {}x{}",
    now.elapsed(),
    map.width(),
    map.height()
  );

  output.render_result(&image, &map)?;
  Ok(())
}
