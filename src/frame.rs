// 该文件是 Tianmu （天目） 项目的一部分。
// src/frame.rs - 视频帧与张量布局
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

use image::{Rgb32FImage, RgbImage};
use ndarray::{Array4, ArrayView3, Axis, s};

const RGB_CHANNELS: usize = 3;

/// 按帧顺序排列的 RGB 视频，布局为 `(帧, 高, 宽, 3)`
#[derive(Debug, Clone)]
pub struct VideoFrames {
  data: Array4<u8>,
}

impl VideoFrames {
  /// 通道数不是 3 时返回 `None`
  pub fn new(data: Array4<u8>) -> Option<Self> {
    if data.shape()[3] != RGB_CHANNELS {
      return None;
    }
    Some(Self { data })
  }

  /// 将尺寸一致的若干帧拼接为视频，尺寸不一致时返回 `None`
  pub fn from_images(frames: &[RgbImage]) -> Option<Self> {
    let (width, height) = frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
    let mut data = Array4::<u8>::zeros((frames.len(), height as usize, width as usize, RGB_CHANNELS));
    for (mut slot, frame) in data.axis_iter_mut(Axis(0)).zip(frames) {
      if frame.dimensions() != (width, height) {
        return None;
      }
      let view = ArrayView3::from_shape(
        (height as usize, width as usize, RGB_CHANNELS),
        frame.as_raw().as_slice(),
      )
      .ok()?;
      slot.assign(&view);
    }
    Some(Self { data })
  }

  pub fn len(&self) -> usize {
    self.data.shape()[0]
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn height(&self) -> usize {
    self.data.shape()[1]
  }

  pub fn width(&self) -> usize {
    self.data.shape()[2]
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn frame(&self, index: usize) -> Option<RgbImage> {
    if index >= self.len() {
      return None;
    }
    let view = self.data.slice(s![index, .., .., ..]);
    let raw: Vec<u8> = view.iter().copied().collect();
    RgbImage::from_raw(self.width() as u32, self.height() as u32, raw)
  }

  /// 按顺序逐帧迭代
  pub fn frames(&self) -> impl Iterator<Item = RgbImage> + '_ {
    (0..self.len()).filter_map(|index| self.frame(index))
  }
}

/// 将 `[0, 1]` 区间的浮点图像按通道归一化，输出 NCHW 布局的单批张量
pub fn to_normalized_nchw(image: &Rgb32FImage, mean: [f32; 3], std: [f32; 3]) -> Array4<f32> {
  let (width, height) = image.dimensions();
  let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, height as usize, width as usize));
  for (x, y, pixel) in image.enumerate_pixels() {
    for c in 0..RGB_CHANNELS {
      tensor[[0, c, y as usize, x as usize]] = (pixel[c] - mean[c]) / std[c];
    }
  }
  tensor
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn solid(width: u32, height: u32, value: u8) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([value, value.wrapping_add(1), value.wrapping_add(2)]))
  }

  #[test]
  fn frames_keep_order_and_pixels() {
    let frames = [solid(4, 3, 10), solid(4, 3, 20), solid(4, 3, 30)];
    let video = VideoFrames::from_images(&frames).unwrap();
    assert_eq!(video.len(), 3);
    assert_eq!((video.width(), video.height()), (4, 3));

    let decoded: Vec<RgbImage> = video.frames().collect();
    assert_eq!(decoded, frames);
  }

  #[test]
  fn mismatched_frame_sizes_are_rejected() {
    assert!(VideoFrames::from_images(&[solid(4, 3, 0), solid(3, 4, 0)]).is_none());
  }

  #[test]
  fn non_rgb_array_is_rejected() {
    assert!(VideoFrames::new(Array4::zeros((1, 2, 2, 4))).is_none());
    assert!(VideoFrames::new(Array4::zeros((0, 2, 2, 3))).unwrap().is_empty());
  }

  #[test]
  fn normalization_uses_per_channel_statistics() {
    let image = Rgb32FImage::from_pixel(2, 1, Rgb([0.5, 0.25, 1.0]));
    let tensor = to_normalized_nchw(&image, [0.5, 0.0, 0.5], [1.0, 0.5, 0.25]);
    assert_eq!(tensor.shape(), &[1, 3, 1, 2]);
    assert_eq!(tensor[[0, 0, 0, 1]], 0.0);
    assert_eq!(tensor[[0, 1, 0, 0]], 0.5);
    assert_eq!(tensor[[0, 2, 0, 0]], 2.0);
  }
}
