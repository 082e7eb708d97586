// 该文件是 Tianmu （天目） 项目的一部分。
// src/model.rs - 模型
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

use serde::{Deserialize, Serialize};

use crate::device::Device;

/// 一个已加载的网络：输入张量进，原始输出出
pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
  fn to(&mut self, device: Device) -> Result<(), Self::Error>;
}

/// 单个检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub label: String,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，像素坐标
}

/// 短语定位视图：一帧内的框与标签分列
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundingResult {
  pub bboxes: Vec<[f32; 4]>,
  pub labels: Vec<String>,
}

impl From<&[Detection]> for GroundingResult {
  fn from(detections: &[Detection]) -> Self {
    let (bboxes, labels) = detections
      .iter()
      .map(|d| (d.bbox, d.label.clone()))
      .unzip();
    Self { bboxes, labels }
  }
}

impl GroundingResult {
  pub fn is_empty(&self) -> bool {
    self.bboxes.is_empty()
  }
}

/// 保留两位小数
pub(crate) fn round2(value: f32) -> f32 {
  (value * 100.0).round() / 100.0
}

pub mod nms;

mod depth_anything;
mod owlv2;
mod owlv2_processor;

pub use self::depth_anything::{
  DEPTH_ANYTHING_V2_CHECKPOINT, DepthAnythingNetwork, DepthAnythingProcessor, DepthEstimation,
  DepthEstimationError, DepthMap,
};
pub use self::owlv2::{DetectionRequest, Owlv2, Owlv2Error, Owlv2Network};
pub use self::owlv2_processor::{Owlv2Inputs, Owlv2Outputs, Owlv2Processor};
