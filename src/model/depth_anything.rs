// 该文件是 Tianmu （天目） 项目的一部分。
// src/model/depth_anything.rs - Depth-Anything-V2 单目深度估计
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

use image::{DynamicImage, RgbImage, imageops::FilterType};
use ndarray::{Array2, ArrayD};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl,
  checkpoint::{Checkpoint, CheckpointCache, CheckpointError, default_checkpoint_dir},
  device::Device,
  frame::to_normalized_nchw,
  input::{ImageInput, InputError},
  model::Model,
  session::{DeviceSession, NamedInput, SessionError},
};

pub const DEPTH_ANYTHING_V2_CHECKPOINT: Checkpoint = Checkpoint {
  url: "https://huggingface.co/onnx-community/depth-anything-v2-small/resolve/main/onnx/model.onnx?download=true",
  file_name: "depth_anything_v2_vits.onnx",
};

const DEPTH_INPUT_SIZE: u32 = 518;
const DEPTH_SIZE_MULTIPLE: u32 = 14;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const DEPTH_INPUT_NAME: &str = "pixel_values";
const DEPTH_OUTPUT_NAME: &str = "predicted_depth";

#[derive(Error, Debug)]
pub enum DepthEstimationError {
  #[error("输入无效: {0}")]
  InvalidInput(String),
  #[error("输入错误: {0}")]
  InputError(#[from] InputError),
  #[error("权重获取错误: {0}")]
  CheckpointError(#[from] CheckpointError),
  #[error("推理会话错误: {0}")]
  SessionError(#[from] SessionError),
  #[error("模型输出形状错误: {0}")]
  OutputShape(String),
  #[error("张量形状错误: {0}")]
  ShapeError(#[from] ndarray::ShapeError),
}

/// 稠密深度图，形状为 `(height, width)`，数值为模型输出的相对深度
#[derive(Debug, Clone, PartialEq)]
pub struct DepthMap {
  map: Array2<f32>,
}

impl DepthMap {
  pub fn new(map: Array2<f32>) -> Self {
    Self { map }
  }

  pub fn height(&self) -> usize {
    self.map.nrows()
  }

  pub fn width(&self) -> usize {
    self.map.ncols()
  }

  pub fn map(&self) -> &Array2<f32> {
    &self.map
  }

  pub fn into_inner(self) -> Array2<f32> {
    self.map
  }

  /// 忽略非有限值后的最小值与最大值
  pub fn min_max(&self) -> Option<(f32, f32)> {
    self
      .map
      .iter()
      .copied()
      .filter(|v| v.is_finite())
      .fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
      })
  }
}

/// Depth-Anything 的预处理与后处理
#[derive(Debug, Clone)]
pub struct DepthAnythingProcessor {
  input_size: u32,
  multiple: u32,
  mean: [f32; 3],
  std: [f32; 3],
}

impl Default for DepthAnythingProcessor {
  fn default() -> Self {
    Self {
      input_size: DEPTH_INPUT_SIZE,
      multiple: DEPTH_SIZE_MULTIPLE,
      mean: IMAGENET_MEAN,
      std: IMAGENET_STD,
    }
  }
}

impl DepthAnythingProcessor {
  pub fn with_input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  /// 保持宽高比缩放，使两边都不小于输入尺寸且为 14 的倍数，返回 `(width, height)`
  pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
    let target = self.input_size as f32;
    let scale = (target / width as f32).max(target / height as f32);
    (
      self.constrain(width as f32 * scale),
      self.constrain(height as f32 * scale),
    )
  }

  fn constrain(&self, value: f32) -> u32 {
    let multiple = self.multiple as f32;
    let mut rounded = (value / multiple).round_ties_even() * multiple;
    if rounded < self.input_size as f32 {
      rounded = (value / multiple).ceil() * multiple;
    }
    rounded as u32
  }

  /// 双三次缩放，除以 255 后按 ImageNet 均值方差归一化，输出 NCHW
  pub fn preprocess(&self, image: &RgbImage) -> ArrayD<f32> {
    let (width, height) = self.target_size(image.width(), image.height());
    debug!(
      "深度估计输入 {}x{} 缩放到 {}x{}",
      image.width(),
      image.height(),
      width,
      height
    );
    let resized = image::imageops::resize(image, width, height, FilterType::CatmullRom);
    let scaled = DynamicImage::ImageRgb8(resized).into_rgb32f();
    to_normalized_nchw(&scaled, self.mean, self.std).into_dyn()
  }

  /// 对齐角点的双线性插值，将模型输出还原到原图尺寸
  pub fn post_process(
    &self,
    depth: &Array2<f32>,
    (width, height): (u32, u32),
  ) -> Result<DepthMap, DepthEstimationError> {
    if depth.is_empty() {
      return Err(DepthEstimationError::OutputShape("深度输出为空".to_string()));
    }
    Ok(DepthMap::new(upsample_align_corners(
      depth,
      height as usize,
      width as usize,
    )))
  }
}

fn upsample_align_corners(src: &Array2<f32>, height: usize, width: usize) -> Array2<f32> {
  let (src_h, src_w) = src.dim();
  let ratio = |from: usize, to: usize| {
    if to > 1 {
      (from - 1) as f32 / (to - 1) as f32
    } else {
      0.0
    }
  };
  let (ratio_y, ratio_x) = (ratio(src_h, height), ratio(src_w, width));

  Array2::from_shape_fn((height, width), |(y, x)| {
    let fy = y as f32 * ratio_y;
    let fx = x as f32 * ratio_x;
    let y0 = (fy.floor() as usize).min(src_h - 1);
    let x0 = (fx.floor() as usize).min(src_w - 1);
    let y1 = (y0 + 1).min(src_h - 1);
    let x1 = (x0 + 1).min(src_w - 1);
    let dy = fy - y0 as f32;
    let dx = fx - x0 as f32;

    let top = src[[y0, x0]] * (1.0 - dx) + src[[y0, x1]] * dx;
    let bottom = src[[y1, x0]] * (1.0 - dx) + src[[y1, x1]] * dx;
    top * (1.0 - dy) + bottom * dy
  })
}

/// ONNX Runtime 上的 Depth-Anything-V2 网络
pub struct DepthAnythingNetwork {
  session: DeviceSession,
}

impl DepthAnythingNetwork {
  pub fn load(model_path: impl AsRef<Path>, device: Device) -> Result<Self, DepthEstimationError> {
    Ok(Self {
      session: DeviceSession::load(model_path, device)?,
    })
  }

  pub fn device(&self) -> Device {
    self.session.device()
  }
}

impl Model for DepthAnythingNetwork {
  type Input = ArrayD<f32>;
  type Output = Array2<f32>;
  type Error = DepthEstimationError;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let depth = self
      .session
      .run(&[NamedInput::F32(DEPTH_INPUT_NAME, input)], &[DEPTH_OUTPUT_NAME])?
      .into_iter()
      .next()
      .ok_or_else(|| DepthEstimationError::OutputShape("缺少深度输出".to_string()))?;

    // [1, h, w] 或 [1, 1, h, w]
    let shape = depth.shape().to_vec();
    let (height, width) = match shape.as_slice() {
      [.., h, w] => (*h, *w),
      _ => return Err(DepthEstimationError::OutputShape(format!("{:?}", shape))),
    };
    Ok(depth.into_shape_with_order((height, width))?)
  }

  fn to(&mut self, device: Device) -> Result<(), Self::Error> {
    self.session.to(device)?;
    Ok(())
  }
}

/// 深度估计工具：构造时准备权重与会话
pub struct DepthEstimation<M = DepthAnythingNetwork> {
  processor: DepthAnythingProcessor,
  model: M,
}

impl DepthEstimation<DepthAnythingNetwork> {
  pub fn new() -> Result<Self, DepthEstimationError> {
    Self::with_checkpoint_dir(default_checkpoint_dir())
  }

  pub fn with_checkpoint_dir(dir: impl Into<PathBuf>) -> Result<Self, DepthEstimationError> {
    let cache = CheckpointCache::new(dir);
    let model_path = cache.fetch(&DEPTH_ANYTHING_V2_CHECKPOINT)?;
    let device = Device::default();
    info!("初始化 Depth-Anything-V2: {}, 设备 {}", model_path.display(), device);
    let model = DepthAnythingNetwork::load(model_path, device)?;
    Ok(Self::with_parts(DepthAnythingProcessor::default(), model))
  }
}

impl<M> DepthEstimation<M>
where
  M: Model<Input = ArrayD<f32>, Output = Array2<f32>, Error = DepthEstimationError>,
{
  pub fn with_parts(processor: DepthAnythingProcessor, model: M) -> Self {
    Self { processor, model }
  }

  /// 估计一张图像的深度，输出与输入同尺寸
  pub fn call(&mut self, input: impl Into<ImageInput>) -> Result<DepthMap, DepthEstimationError> {
    let image = input.into().into_rgb()?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
      return Err(DepthEstimationError::InvalidInput("图像尺寸不能为零".to_string()));
    }

    let pixel_values = self.processor.preprocess(&image);
    let depth = self.model.infer(&pixel_values)?;
    let map = self.processor.post_process(&depth, (width, height))?;
    debug!("深度图 {}x{}", map.width(), map.height());
    Ok(map)
  }

  /// 以 `image://` 或 `file://` URL 指定输入，其他方案视为无效输入
  pub fn call_url(&mut self, url: &Url) -> Result<DepthMap, DepthEstimationError> {
    let input = ImageInput::from_url(url).map_err(|e| match e {
      InputError::SchemeMismatch { .. } => DepthEstimationError::InvalidInput(e.to_string()),
      other => DepthEstimationError::InputError(other),
    })?;
    self.call(input)
  }

  pub fn to(&mut self, device: Device) -> Result<(), DepthEstimationError> {
    self.model.to(device)
  }
}
