// 该文件是 Tianmu （天目） 项目的一部分。
// src/output/depth_image.rs - 深度图输出
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

use image::{ImageBuffer, Luma, RgbImage};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  model::DepthMap,
  output::{Render, ensure_parent},
};

pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

#[derive(Error, Debug)]
pub enum DepthImageError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("深度图尺寸 {depth:?} 与原图尺寸 {image:?} 不一致")]
  SizeMismatch {
    depth: (usize, usize),
    image: (usize, usize),
  },
}

/// 深度图按最小最大值归一化后保存为 16 位灰度图
pub struct DepthImageOutput {
  path: PathBuf,
}

impl FromUrlWithScheme for DepthImageOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for DepthImageOutput {
  type Error = DepthImageError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DepthImageError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }
    Ok(Self::new(decode_url_path(uri)))
  }
}

impl DepthImageOutput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn save(&self, depth: &DepthMap) -> Result<(), DepthImageError> {
    ensure_parent(&self.path)?;
    to_depth_image(depth).save(&self.path)?;
    info!("保存深度图到文件: {}", self.path.display());
    Ok(())
  }
}

/// 常数深度图输出全零，非有限值记为零
pub fn to_depth_image(depth: &DepthMap) -> DepthImage {
  let (lo, hi) = depth.min_max().unwrap_or((0.0, 0.0));
  let range = hi - lo;
  let map = depth.map();
  ImageBuffer::from_fn(depth.width() as u32, depth.height() as u32, |x, y| {
    let value = map[[y as usize, x as usize]];
    if !value.is_finite() || range <= 0.0 {
      return Luma([0]);
    }
    Luma([(((value - lo) / range) * u16::MAX as f32).round() as u16])
  })
}

impl Render<RgbImage, DepthMap> for DepthImageOutput {
  type Error = DepthImageError;

  fn render_result(&self, frame: &RgbImage, result: &DepthMap) -> Result<(), Self::Error> {
    let image = (frame.height() as usize, frame.width() as usize);
    let depth = (result.height(), result.width());
    if image != depth {
      return Err(DepthImageError::SizeMismatch { depth, image });
    }
    self.save(result)
  }
}
