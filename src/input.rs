// 该文件是 Tianmu （天目） 项目的一部分。
// src/input.rs - 图像/视频输入
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

use thiserror::Error;

mod frame_directory;
mod image_file;

pub use self::frame_directory::FrameDirectoryInput;
pub use self::image_file::ImageInput;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("URI 方案不匹配: 期望 {expected}, 实际 {actual}")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("帧尺寸不一致: {0}")]
  FrameShapeMismatch(String),
  #[error("目录中没有图像帧: {0}")]
  NoFrames(String),
}

impl InputError {
  pub(crate) fn scheme_mismatch(expected: &'static str, actual: &str) -> Self {
    InputError::SchemeMismatch {
      expected,
      actual: actual.to_string(),
    }
  }
}
