// 该文件是 Tianmu （天目） 项目的一部分。
// src/bin/owlv2_detect.rs - OWLv2 开放词汇检测示例
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
  Device, DetectionRequest, FromUrl, FromUrlWithScheme, ImageInput, Owlv2, Owlv2Config,
  input::FrameDirectoryInput,
  output::{DetectionOutput, Render},
};

/// Tianmu OWLv2 检测参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源：image:///path.png 或 frames:///dir
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 检测提示词，可重复
  #[arg(long = "prompt", value_name = "PROMPT", required = true)]
  pub prompts: Vec<String>,
  /// 输出路径：image:///out.png 或 json:///out.json，可重复
  #[arg(long, value_name = "OUTPUT")]
  pub output: Vec<Url>,
  /// JSON 配置文件
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<PathBuf>,
  /// 置信度阈值
  #[arg(long, value_name = "CONFIDENCE")]
  pub confidence: Option<f32>,
  /// NMS IoU 阈值
  #[arg(long, value_name = "IOU")]
  pub nms: Option<f32>,
  /// 推理设备：cpu、gpu 或 accelerator
  #[arg(long, value_name = "DEVICE")]
  pub device: Option<Device>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("提示词: {:?}", args.prompts);

  let mut config = match &args.config {
    Some(path) => Owlv2Config::from_json_file(path)?,
    None => Owlv2Config::default(),
  };
  if let Some(confidence) = args.confidence {
    config = config.with_confidence(confidence);
  }
  if let Some(device) = args.device {
    config = config.with_device(device);
  }

  let outputs = args
    .output
    .iter()
    .map(DetectionOutput::from_url)
    .collect::<Result<Vec<_>, _>>()?;

  let mut owl = Owlv2::new(Some(config))?;
  let mut request = DetectionRequest::new(args.prompts.clone());
  if let Some(threshold) = args.nms {
    request = request.nms_threshold(threshold);
  }

  info!("开始推理...");
  let now = std::time::Instant::now();
  if args.input.scheme() == FrameDirectoryInput::SCHEME {
    let video = FrameDirectoryInput::from_url(&args.input)?.into_video()?;
    let results = owl.call(request.video(video.clone()))?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());
    for (index, detections) in results.iter().enumerate() {
      info!("第 {} 帧: {} 个检测结果", index + 1, detections.len());
    }
    for output in &outputs {
      output.render_result(&video, results.as_slice())?;
    }
  } else {
    let image = ImageInput::from_url(&args.input)?.into_rgb()?;
    let results = owl.call(request.image(image.clone()))?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());
    let detections = results.first().map(Vec::as_slice).unwrap_or_default();
    for detection in detections {
      info!(
        "{} {:.3} [{:.2}, {:.2}, {:.2}, {:.2}]",
        detection.label,
        detection.score,
        detection.bbox[0],
        detection.bbox[1],
        detection.bbox[2],
        detection.bbox[3]
      );
    }
    for output in &outputs {
      output.render_result(&image, detections)?;
    }
  }

  Ok(())
}
