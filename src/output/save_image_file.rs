// 该文件是 Tianmu （天目） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::VideoFrames,
  model::Detection,
  output::{Render, ensure_parent},
};

const BOX_THICKNESS: i32 = 2;
const BOX_COLORS: [[u8; 3]; 6] = [
  [255, 56, 56],
  [56, 56, 255],
  [72, 249, 10],
  [255, 157, 151],
  [0, 194, 255],
  [255, 178, 29],
];

/// 在图像上绘制检测框并保存；视频逐帧保存为 `<stem>_<index>.<ext>`
pub struct SaveImageFileOutput {
  path: PathBuf,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("帧数 {frames} 与结果数 {results} 不一致")]
  FrameCountMismatch { frames: usize, results: usize },
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }
    Ok(Self::new(decode_url_path(uri)))
  }
}

impl SaveImageFileOutput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn frame_path(&self, index: usize) -> PathBuf {
    let stem = self
      .path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_default();
    let name = match self.path.extension() {
      Some(ext) => format!("{}_{:04}.{}", stem, index, ext.to_string_lossy()),
      None => format!("{}_{:04}", stem, index),
    };
    self.path.with_file_name(name)
  }

  fn save_image(&self, image: &RgbImage, path: &Path) -> Result<(), SaveImageFileError> {
    ensure_parent(path)?;
    image.save(path)?;
    info!("保存图像到文件: {}", path.display());
    Ok(())
  }
}

/// 同一标签使用同一颜色，颜色按标签首次出现的顺序分配
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
  let mut labels: Vec<&str> = Vec::new();
  for detection in detections {
    let index = match labels.iter().position(|l| *l == detection.label) {
      Some(index) => index,
      None => {
        labels.push(&detection.label);
        labels.len() - 1
      }
    };
    draw_box(image, &detection.bbox, Rgb(BOX_COLORS[index % BOX_COLORS.len()]));
  }
}

fn draw_box(image: &mut RgbImage, bbox: &[f32; 4], color: Rgb<u8>) {
  let x_min = bbox[0].floor() as i32;
  let y_min = bbox[1].floor() as i32;
  let x_max = bbox[2].ceil() as i32;
  let y_max = bbox[3].ceil() as i32;

  for inset in 0..BOX_THICKNESS {
    let width = x_max - x_min - 2 * inset;
    let height = y_max - y_min - 2 * inset;
    if width <= 0 || height <= 0 {
      break;
    }
    let rect = Rect::at(x_min + inset, y_min + inset).of_size(width as u32, height as u32);
    draw_hollow_rect_mut(image, rect, color);
  }
}

impl Render<RgbImage, [Detection]> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, frame: &RgbImage, result: &[Detection]) -> Result<(), Self::Error> {
    let mut image = frame.clone();
    draw_detections(&mut image, result);
    self.save_image(&image, &self.path)
  }
}

impl Render<VideoFrames, [Vec<Detection>]> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    frame: &VideoFrames,
    result: &[Vec<Detection>],
  ) -> Result<(), Self::Error> {
    if frame.len() != result.len() {
      return Err(SaveImageFileError::FrameCountMismatch {
        frames: frame.len(),
        results: result.len(),
      });
    }
    for (index, (mut image, detections)) in frame.frames().zip(result).enumerate() {
      draw_detections(&mut image, detections);
      self.save_image(&image, &self.frame_path(index))?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detection(label: &str, bbox: [f32; 4]) -> Detection {
    Detection {
      label: label.to_string(),
      score: 0.9,
      bbox,
    }
  }

  #[test]
  fn boxes_are_drawn_in_label_colors() {
    let mut image = RgbImage::new(20, 20);
    draw_detections(
      &mut image,
      &[
        detection("car", [2.0, 2.0, 10.0, 10.0]),
        detection("shark", [12.0, 12.0, 18.0, 18.0]),
      ],
    );
    assert_eq!(image.get_pixel(2, 5), &Rgb(BOX_COLORS[0]));
    assert_eq!(image.get_pixel(12, 15), &Rgb(BOX_COLORS[1]));
    assert_eq!(image.get_pixel(6, 6), &Rgb([0, 0, 0]));
  }

  #[test]
  fn boxes_outside_the_image_are_clipped() {
    let mut image = RgbImage::new(8, 8);
    draw_detections(&mut image, &[detection("car", [-5.0, -5.0, 50.0, 50.0])]);
    assert_eq!(image.get_pixel(4, 4), &Rgb([0, 0, 0]));
  }

  #[test]
  fn video_frames_get_indexed_names() {
    let dir = tempfile::tempdir().unwrap();
    let output = SaveImageFileOutput::new(dir.path().join("out/result.png"));
    let video = VideoFrames::from_images(&[RgbImage::new(4, 4), RgbImage::new(4, 4)]).unwrap();
    let results = vec![vec![], vec![detection("car", [0.0, 0.0, 3.0, 3.0])]];
    output.render_result(&video, results.as_slice()).unwrap();
    assert!(dir.path().join("out/result_0000.png").exists());
    assert!(dir.path().join("out/result_0001.png").exists());
  }

  #[test]
  fn frame_count_must_match() {
    let dir = tempfile::tempdir().unwrap();
    let output = SaveImageFileOutput::new(dir.path().join("result.png"));
    let video = VideoFrames::from_images(&[RgbImage::new(4, 4)]).unwrap();
    let results: Vec<Vec<Detection>> = Vec::new();
    assert!(matches!(
      output.render_result(&video, results.as_slice()),
      Err(SaveImageFileError::FrameCountMismatch { .. })
    ));
  }

  #[test]
  fn scheme_must_be_image() {
    let url = Url::parse("json:///tmp/out.json").unwrap();
    assert!(SaveImageFileOutput::from_url(&url).is_err());
  }
}
