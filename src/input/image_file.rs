// 该文件是 Tianmu （天目） 项目的一部分。
// src/input/image_file.rs - 单张图像输入
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

use image::{DynamicImage, ImageReader, RgbImage};
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, decode_url_path, input::InputError};

const FILE_SCHEME: &str = "file";

/// 单张图像：文件路径或内存中的图像，在调用边界处一次性区分
#[derive(Debug, Clone)]
pub enum ImageInput {
  Path(PathBuf),
  Image(DynamicImage),
}

impl FromUrlWithScheme for ImageInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME && url.scheme() != FILE_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(InputError::scheme_mismatch(Self::SCHEME, url.scheme()));
    }
    Ok(ImageInput::Path(PathBuf::from(decode_url_path(url))))
  }
}

impl ImageInput {
  /// 解码并转换为 RGB
  pub fn into_rgb(self) -> Result<RgbImage, InputError> {
    match self {
      ImageInput::Path(path) => {
        debug!("读取图像文件: {}", path.display());
        Ok(ImageReader::open(&path)?.decode()?.to_rgb8())
      }
      ImageInput::Image(image) => Ok(image.into_rgb8()),
    }
  }
}

impl From<PathBuf> for ImageInput {
  fn from(path: PathBuf) -> Self {
    ImageInput::Path(path)
  }
}

impl From<&Path> for ImageInput {
  fn from(path: &Path) -> Self {
    ImageInput::Path(path.to_path_buf())
  }
}

impl From<&str> for ImageInput {
  fn from(path: &str) -> Self {
    ImageInput::Path(PathBuf::from(path))
  }
}

impl From<DynamicImage> for ImageInput {
  fn from(image: DynamicImage) -> Self {
    ImageInput::Image(image)
  }
}

impl From<RgbImage> for ImageInput {
  fn from(image: RgbImage) -> Self {
    ImageInput::Image(DynamicImage::ImageRgb8(image))
  }
}
