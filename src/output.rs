// 该文件是 Tianmu （天目） 项目的一部分。
// src/output.rs - 输出定义
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

use std::path::Path;

use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::FromUrl;
#[cfg(any(feature = "save_image_file", feature = "json_record"))]
use crate::FromUrlWithScheme;
use crate::{frame::VideoFrames, model::Detection};

pub trait Render<Frame: ?Sized, Output: ?Sized>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

mod depth_image;
pub use self::depth_image::{DepthImageError, DepthImageOutput};

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "json_record")]
mod json_record;
#[cfg(feature = "json_record")]
pub use self::json_record::{JsonRecordError, JsonRecordOutput, RecordFormat};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "json_record")]
  #[error("JSON 记录输出错误: {0}")]
  JsonRecordError(#[from] JsonRecordError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 按 URL 方案选择的检测结果输出
pub enum DetectionOutput {
  #[cfg(feature = "save_image_file")]
  SaveImageFile(SaveImageFileOutput),
  #[cfg(feature = "json_record")]
  JsonRecord(JsonRecordOutput),
}

impl FromUrl for DetectionOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => Ok(DetectionOutput::SaveImageFile(
        SaveImageFileOutput::from_url(url)?,
      )),
      #[cfg(feature = "json_record")]
      JsonRecordOutput::SCHEME => Ok(DetectionOutput::JsonRecord(JsonRecordOutput::from_url(
        url,
      )?)),
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Render<RgbImage, [Detection]> for DetectionOutput {
  type Error = OutputError;

  fn render_result(&self, frame: &RgbImage, result: &[Detection]) -> Result<(), Self::Error> {
    match *self {
      #[cfg(feature = "save_image_file")]
      DetectionOutput::SaveImageFile(ref output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "json_record")]
      DetectionOutput::JsonRecord(ref output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

impl Render<VideoFrames, [Vec<Detection>]> for DetectionOutput {
  type Error = OutputError;

  fn render_result(
    &self,
    frame: &VideoFrames,
    result: &[Vec<Detection>],
  ) -> Result<(), Self::Error> {
    match *self {
      #[cfg(feature = "save_image_file")]
      DetectionOutput::SaveImageFile(ref output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "json_record")]
      DetectionOutput::JsonRecord(ref output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

/// 需要时创建输出文件的父目录
pub(crate) fn ensure_parent(path: &Path) -> std::io::Result<()> {
  match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
    _ => Ok(()),
  }
}
