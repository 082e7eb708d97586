// 该文件是 Tianmu （天目） 项目的一部分。
// src/model/owlv2.rs - OWLv2 开放词汇目标检测
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

use std::path::{Path, PathBuf};

use image::{DynamicImage, RgbImage};
use ndarray::{Array2, ArrayD, Axis, Ix3};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  checkpoint::{CheckpointCache, CheckpointError},
  config::{ConfigError, Owlv2Config},
  device::Device,
  frame::VideoFrames,
  input::InputError,
  model::{
    Detection, Model,
    nms::non_max_suppression,
    owlv2_processor::{Owlv2Inputs, Owlv2Outputs, Owlv2Processor},
  },
  session::{DeviceSession, NamedInput, SessionError},
};

const OWLV2_MODEL_FILE: &str = "onnx/model.onnx";
const OWLV2_TOKENIZER_FILE: &str = "tokenizer.json";
const OWLV2_PREPROCESSOR_FILE: &str = "preprocessor_config.json";
const OWLV2_OUTPUT_LOGITS: &str = "logits";
const OWLV2_OUTPUT_BOXES: &str = "pred_boxes";

#[derive(Error, Debug)]
pub enum Owlv2Error {
  #[error("输入无效: {0}")]
  InvalidInput(String),
  #[error("配置错误: {0}")]
  ConfigError(#[from] ConfigError),
  #[error("输入错误: {0}")]
  InputError(#[from] InputError),
  #[error("权重获取错误: {0}")]
  CheckpointError(#[from] CheckpointError),
  #[error("推理会话错误: {0}")]
  SessionError(#[from] SessionError),
  #[error("分词器错误: {0}")]
  TokenizerError(String),
  #[error("预处理配置错误: {0}")]
  PreprocessorError(#[from] serde_json::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("模型输出形状错误: {0}")]
  OutputShape(String),
  #[error("张量形状错误: {0}")]
  ShapeError(#[from] ndarray::ShapeError),
}

impl Owlv2Error {
  pub fn invalid(msg: &str) -> Self {
    Owlv2Error::InvalidInput(msg.to_string())
  }
}

/// 一次检测调用的参数：`image` 与 `video` 必须且只能给出一个
#[derive(Debug, Clone, Default)]
pub struct DetectionRequest {
  pub prompts: Vec<String>,
  pub image: Option<DynamicImage>,
  pub video: Option<VideoFrames>,
  pub nms_threshold: Option<f32>,
}

enum Media {
  Image(DynamicImage),
  Video(VideoFrames),
}

impl DetectionRequest {
  pub fn new<S: Into<String>>(prompts: impl IntoIterator<Item = S>) -> Self {
    Self {
      prompts: prompts.into_iter().map(Into::into).collect(),
      ..Default::default()
    }
  }

  pub fn image(mut self, image: impl Into<DynamicImage>) -> Self {
    self.image = Some(image.into());
    self
  }

  pub fn video(mut self, video: VideoFrames) -> Self {
    self.video = Some(video);
    self
  }

  pub fn nms_threshold(mut self, threshold: f32) -> Self {
    self.nms_threshold = Some(threshold);
    self
  }

  fn validate(self) -> Result<(Vec<String>, Media, Option<f32>), Owlv2Error> {
    let media = match (self.image, self.video) {
      (None, None) => return Err(Owlv2Error::invalid("Either 'image' or 'video' must be provided.")),
      (Some(_), Some(_)) => {
        return Err(Owlv2Error::invalid("Only one of 'image' or 'video' can be provided."));
      }
      (Some(image), None) => Media::Image(image),
      (None, Some(video)) => Media::Video(video),
    };
    if self.prompts.is_empty() {
      return Err(Owlv2Error::invalid("At least one prompt must be provided."));
    }
    if let Some(threshold) = self.nms_threshold.filter(|t| !(0.0..=1.0).contains(t)) {
      return Err(Owlv2Error::InvalidInput(format!(
        "NMS 阈值必须位于 [0, 1] 区间, 实际为 {}",
        threshold
      )));
    }
    Ok((self.prompts, media, self.nms_threshold))
  }
}

/// ONNX Runtime 上的 OWLv2 网络
pub struct Owlv2Network {
  session: DeviceSession,
}

impl Owlv2Network {
  pub fn load(model_path: impl AsRef<Path>, device: Device) -> Result<Self, Owlv2Error> {
    let session = DeviceSession::load(model_path, device)?;
    Ok(Self { session })
  }

  pub fn device(&self) -> Device {
    self.session.device()
  }
}

fn first_batch(array: ArrayD<f32>) -> Result<Array2<f32>, Owlv2Error> {
  let array = array.into_dimensionality::<Ix3>()?;
  Ok(array.index_axis(Axis(0), 0).to_owned())
}

impl Model for Owlv2Network {
  type Input = Owlv2Inputs;
  type Output = Owlv2Outputs;
  type Error = Owlv2Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let outputs = self.session.run(
      &[
        NamedInput::I64("input_ids", &input.input_ids),
        NamedInput::F32("pixel_values", &input.pixel_values),
        NamedInput::I64("attention_mask", &input.attention_mask),
      ],
      &[OWLV2_OUTPUT_LOGITS, OWLV2_OUTPUT_BOXES],
    )?;

    let mut outputs = outputs.into_iter();
    let (Some(logits), Some(pred_boxes)) = (outputs.next(), outputs.next()) else {
      return Err(Owlv2Error::OutputShape("模型输出数量不足".to_string()));
    };
    Ok(Owlv2Outputs {
      logits: first_batch(logits)?,
      pred_boxes: first_batch(pred_boxes)?,
    })
  }

  fn to(&mut self, device: Device) -> Result<(), Self::Error> {
    self.session.to(device)?;
    Ok(())
  }
}

/// OWLv2 检测工具：构造时加载权重，之后可反复调用
pub struct Owlv2<M = Owlv2Network> {
  config: Owlv2Config,
  processor: Owlv2Processor,
  model: M,
}

impl Owlv2<Owlv2Network> {
  pub fn new(config: Option<Owlv2Config>) -> Result<Self, Owlv2Error> {
    Self::with_cache(config, &CheckpointCache::default())
  }

  pub fn with_cache(
    config: Option<Owlv2Config>,
    cache: &CheckpointCache,
  ) -> Result<Self, Owlv2Error> {
    let config = config.unwrap_or_default();
    config.validate()?;
    info!(
      "初始化 OWLv2: 模型 {}, 预处理器 {}, 设备 {}",
      config.model_name, config.processor_name, config.device
    );

    let model_path = resolve_model_file(cache, &config.model_name)?;
    let tokenizer_path = cache.resolve(&config.processor_name, OWLV2_TOKENIZER_FILE)?;
    let preprocessor_path =
      resolve_optional(cache, &config.processor_name, OWLV2_PREPROCESSOR_FILE)?;

    let processor = Owlv2Processor::from_files(tokenizer_path, preprocessor_path)?;
    let model = Owlv2Network::load(model_path, config.device)?;
    Self::with_parts(config, processor, model)
  }
}

fn resolve_model_file(cache: &CheckpointCache, name: &str) -> Result<PathBuf, Owlv2Error> {
  let path = Path::new(name);
  if path.is_file() {
    return Ok(path.to_path_buf());
  }
  Ok(cache.resolve(name, OWLV2_MODEL_FILE)?)
}

// 预处理配置不存在 (404) 时回退到默认值，其余错误照常返回
fn resolve_optional(cache: &CheckpointCache, name: &str, file: &str) -> Result<PathBuf, Owlv2Error> {
  tolerate_missing(cache.resolve(name, file), || cache.hub_path(name, file))
}

fn tolerate_missing(
  resolved: Result<PathBuf, CheckpointError>,
  fallback: impl FnOnce() -> PathBuf,
) -> Result<PathBuf, Owlv2Error> {
  match resolved {
    Ok(path) => Ok(path),
    Err(CheckpointError::HttpStatus(url, StatusCode::NOT_FOUND)) => {
      debug!("远端不存在 {}, 使用默认预处理配置", url);
      Ok(fallback())
    }
    Err(e) => Err(e.into()),
  }
}

impl<M> Owlv2<M>
where
  M: Model<Input = Owlv2Inputs, Output = Owlv2Outputs, Error = Owlv2Error>,
{
  pub fn with_parts(
    config: Owlv2Config,
    processor: Owlv2Processor,
    model: M,
  ) -> Result<Self, Owlv2Error> {
    config.validate()?;
    Ok(Self {
      config,
      processor,
      model,
    })
  }

  pub fn config(&self) -> &Owlv2Config {
    &self.config
  }

  /// 对单张图像或视频的每一帧执行检测，结果按图像/帧顺序排列
  pub fn call(&mut self, request: DetectionRequest) -> Result<Vec<Vec<Detection>>, Owlv2Error> {
    let (prompts, media, nms_threshold) = request.validate()?;

    let mut inferences = Vec::new();
    match media {
      Media::Image(image) => {
        let image = image.into_rgb8();
        inferences.push(self.run_inference(&image, &prompts)?);
      }
      Media::Video(video) => {
        info!("逐帧处理视频: {} 帧", video.len());
        inferences.reserve(video.len());
        for index in 0..video.len() {
          let frame = video
            .frame(index)
            .ok_or_else(|| Owlv2Error::InvalidInput(format!("无法读取第 {} 帧", index)))?;
          debug!("处理第 {} 帧", index);
          inferences.push(self.run_inference(&frame, &prompts)?);
        }
      }
    }

    if let Some(threshold) = nms_threshold {
      inferences = inferences
        .into_iter()
        .map(|detections| non_max_suppression(detections, threshold))
        .collect();
    }
    Ok(inferences)
  }

  /// 显式切换推理设备
  pub fn to(&mut self, device: Device) -> Result<(), Owlv2Error> {
    self.model.to(device)
  }

  fn run_inference(
    &mut self,
    image: &RgbImage,
    prompts: &[String],
  ) -> Result<Vec<Detection>, Owlv2Error> {
    if image.width() == 0 || image.height() == 0 {
      return Err(Owlv2Error::invalid("图像尺寸不能为零"));
    }
    let inputs = self.processor.preprocess(image, prompts)?;
    let outputs = self.model.infer(&inputs)?;
    self
      .processor
      .post_process(&outputs, prompts, image.dimensions(), self.config.confidence)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::device::DeviceError;
  use crate::model::owlv2_processor::tests::processor;
  use image::Rgb;
  use ndarray::array;

  /// 固定输出的假网络，记录调用次数与所在设备
  struct FixedNetwork {
    outputs: Owlv2Outputs,
    calls: usize,
    device: Device,
    accelerated: bool,
  }

  impl FixedNetwork {
    fn new(outputs: Owlv2Outputs) -> Self {
      Self {
        outputs,
        calls: 0,
        device: Device::Cpu,
        accelerated: true,
      }
    }
  }

  impl Model for FixedNetwork {
    type Input = Owlv2Inputs;
    type Output = Owlv2Outputs;
    type Error = Owlv2Error;

    fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
      assert_eq!(input.pixel_values.shape(), &[1, 3, 32, 32]);
      self.calls += 1;
      Ok(self.outputs.clone())
    }

    fn to(&mut self, device: Device) -> Result<(), Self::Error> {
      if device != Device::Cpu && !self.accelerated {
        return Err(SessionError::from(DeviceError::FeatureDisabled(device, "cuda")).into());
      }
      self.device = device;
      Ok(())
    }
  }

  fn tool(outputs: Owlv2Outputs) -> Owlv2<FixedNetwork> {
    let config = Owlv2Config::default().with_device(Device::Cpu);
    Owlv2::with_parts(config, processor(), FixedNetwork::new(outputs)).unwrap()
  }

  fn image() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb([10, 20, 30])))
  }

  #[test]
  fn neither_image_nor_video_is_rejected() {
    let mut owl = tool(Owlv2Outputs {
      logits: array![[0.0]],
      pred_boxes: array![[0.5, 0.5, 0.1, 0.1]],
    });
    let err = owl.call(DetectionRequest::new(["car"])).unwrap_err();
    assert!(matches!(err, Owlv2Error::InvalidInput(_)));
    assert_eq!(owl.model.calls, 0);
  }

  #[test]
  fn both_image_and_video_is_rejected() {
    let mut owl = tool(Owlv2Outputs {
      logits: array![[0.0]],
      pred_boxes: array![[0.5, 0.5, 0.1, 0.1]],
    });
    let video = VideoFrames::from_images(&[image().into_rgb8()]).unwrap();
    let err = owl
      .call(DetectionRequest::new(["car"]).image(image()).video(video))
      .unwrap_err();
    assert!(matches!(err, Owlv2Error::InvalidInput(_)));
  }

  #[test]
  fn empty_prompts_are_rejected() {
    let mut owl = tool(Owlv2Outputs {
      logits: array![[0.0]],
      pred_boxes: array![[0.5, 0.5, 0.1, 0.1]],
    });
    let request = DetectionRequest::new(Vec::<String>::new()).image(image());
    assert!(matches!(owl.call(request), Err(Owlv2Error::InvalidInput(_))));
  }

  #[test]
  fn out_of_range_nms_threshold_is_rejected() {
    let mut owl = tool(Owlv2Outputs {
      logits: array![[0.0]],
      pred_boxes: array![[0.5, 0.5, 0.1, 0.1]],
    });
    let request = DetectionRequest::new(["car"]).image(image()).nms_threshold(1.5);
    assert!(matches!(owl.call(request), Err(Owlv2Error::InvalidInput(_))));
  }

  #[test]
  fn invalid_confidence_fails_construction() {
    let config = Owlv2Config::default()
      .with_device(Device::Cpu)
      .with_confidence(1.5);
    let network = FixedNetwork::new(Owlv2Outputs {
      logits: array![[0.0]],
      pred_boxes: array![[0.5, 0.5, 0.1, 0.1]],
    });
    assert!(matches!(
      Owlv2::with_parts(config, processor(), network),
      Err(Owlv2Error::ConfigError(_))
    ));
  }

  #[test]
  fn video_runs_the_network_once_per_frame() {
    let mut owl = tool(Owlv2Outputs {
      logits: array![[4.0]],
      pred_boxes: array![[0.5, 0.5, 0.2, 0.2]],
    });
    let frames: Vec<RgbImage> = (0..5).map(|_| image().into_rgb8()).collect();
    let video = VideoFrames::from_images(&frames).unwrap();

    let results = owl.call(DetectionRequest::new(["shark"]).video(video)).unwrap();
    assert_eq!(results.len(), 5);
    assert_eq!(owl.model.calls, 5);
    assert!(results.iter().all(|frame| frame.len() == 1 && frame[0].label == "shark"));
  }

  #[test]
  fn nms_runs_per_frame() {
    let mut owl = tool(Owlv2Outputs {
      logits: array![[4.0], [3.0]],
      pred_boxes: array![[0.5, 0.5, 0.2, 0.2], [0.5, 0.5, 0.21, 0.21]],
    });
    let without = owl.call(DetectionRequest::new(["car"]).image(image())).unwrap();
    assert_eq!(without[0].len(), 2);

    let with = owl
      .call(DetectionRequest::new(["car"]).image(image()).nms_threshold(0.1))
      .unwrap();
    assert_eq!(with[0].len(), 1);
    assert!(with[0][0].score > 0.95);
  }

  #[test]
  fn transfer_reaches_the_network() {
    let mut owl = tool(Owlv2Outputs {
      logits: array![[0.0]],
      pred_boxes: array![[0.5, 0.5, 0.1, 0.1]],
    });
    owl.to(Device::Gpu).unwrap();
    assert_eq!(owl.model.device, Device::Gpu);

    owl.to(Device::Cpu).unwrap();
    assert_eq!(owl.model.device, Device::Cpu);
  }

  #[test]
  fn failed_transfer_is_reported_and_keeps_the_device() {
    let mut owl = tool(Owlv2Outputs {
      logits: array![[0.0]],
      pred_boxes: array![[0.5, 0.5, 0.1, 0.1]],
    });
    owl.model.accelerated = false;

    let err = owl.to(Device::Gpu).unwrap_err();
    assert!(matches!(
      err,
      Owlv2Error::SessionError(SessionError::DeviceError(DeviceError::FeatureDisabled(
        Device::Gpu,
        _
      )))
    ));
    assert_eq!(owl.model.device, Device::Cpu);
  }

  #[test]
  fn missing_preprocessor_config_falls_back_to_defaults() {
    let fallback = PathBuf::from("/cache/preprocessor_config.json");
    let missing = CheckpointError::HttpStatus("https://hub/x".to_string(), StatusCode::NOT_FOUND);
    assert_eq!(
      tolerate_missing(Err(missing), || fallback.clone()).unwrap(),
      fallback
    );

    let found = PathBuf::from("/cache/found.json");
    assert_eq!(
      tolerate_missing(Ok(found.clone()), || fallback.clone()).unwrap(),
      found
    );
  }

  #[test]
  fn other_preprocessor_config_failures_are_errors() {
    let fallback = || PathBuf::from("/cache/preprocessor_config.json");
    let failures = [
      CheckpointError::HttpStatus(
        "https://hub/x".to_string(),
        StatusCode::INTERNAL_SERVER_ERROR,
      ),
      CheckpointError::HttpStatus("https://hub/x".to_string(), StatusCode::UNAUTHORIZED),
      CheckpointError::IoError(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "read-only cache",
      )),
      CheckpointError::InvalidUrl("huggingface.co/bad repo".to_string()),
    ];
    for failure in failures {
      assert!(matches!(
        tolerate_missing(Err(failure), fallback),
        Err(Owlv2Error::CheckpointError(_))
      ));
    }
  }

  #[test]
  fn local_processor_directory_is_used_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CheckpointCache::new(dir.path().join("cache"));
    let name = dir.path().to_string_lossy().to_string();

    let path = resolve_optional(&cache, &name, OWLV2_PREPROCESSOR_FILE).unwrap();
    assert_eq!(path, dir.path().join(OWLV2_PREPROCESSOR_FILE));
    assert!(!path.exists());
    assert!(!cache.dir().exists());
  }
}
