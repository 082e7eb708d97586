// 该文件是 Tianmu （天目） 项目的一部分。
// src/input/frame_directory.rs - 目录帧序列输入
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

use image::ImageReader;
use tracing::{debug, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, decode_url_path, frame::VideoFrames, input::InputError};

const FRAME_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "webp"];

/// 以文件名顺序读取目录中的图像作为视频帧
pub struct FrameDirectoryInput {
  directory: PathBuf,
}

impl FromUrlWithScheme for FrameDirectoryInput {
  const SCHEME: &'static str = "frames";
}

impl FromUrl for FrameDirectoryInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InputError::scheme_mismatch(Self::SCHEME, url.scheme()));
    }
    Ok(Self::new(decode_url_path(url)))
  }
}

impl FrameDirectoryInput {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
    }
  }

  fn frame_paths(&self) -> Result<Vec<PathBuf>, InputError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.directory)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|path| path.is_file() && is_frame(path))
      .collect();
    paths.sort();
    Ok(paths)
  }

  pub fn into_video(self) -> Result<VideoFrames, InputError> {
    let paths = self.frame_paths()?;
    if paths.is_empty() {
      return Err(InputError::NoFrames(self.directory.display().to_string()));
    }
    info!("从 {} 读取 {} 帧", self.directory.display(), paths.len());

    let mut frames = Vec::with_capacity(paths.len());
    for path in &paths {
      debug!("读取帧: {}", path.display());
      frames.push(ImageReader::open(path)?.decode()?.to_rgb8());
    }

    VideoFrames::from_images(&frames).ok_or_else(|| {
      InputError::FrameShapeMismatch(self.directory.display().to_string())
    })
  }
}

fn is_frame(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    .unwrap_or(false)
}
