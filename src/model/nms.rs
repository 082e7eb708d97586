// 该文件是 Tianmu （天目） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
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

use std::cmp::Ordering;

use tracing::debug;

use crate::model::Detection;

/// 计算两个边界框的 IoU
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 同标签的检测框之间做贪心抑制，IoU 大于阈值的低分框被移除。
///
/// 分数相同时先出现的框优先保留；输出保持输入顺序。
pub fn non_max_suppression(detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
  let mut order: Vec<usize> = (0..detections.len()).collect();
  // 稳定排序，分数相同者保持输入顺序
  order.sort_by(|&a, &b| {
    detections[b]
      .score
      .partial_cmp(&detections[a].score)
      .unwrap_or(Ordering::Equal)
  });

  let mut suppressed = vec![false; detections.len()];
  for (rank, &best) in order.iter().enumerate() {
    if suppressed[best] {
      continue;
    }
    for &other in &order[rank + 1..] {
      if suppressed[other] || detections[other].label != detections[best].label {
        continue;
      }
      if iou(&detections[best].bbox, &detections[other].bbox) > threshold {
        suppressed[other] = true;
      }
    }
  }

  let before = detections.len();
  let kept: Vec<Detection> = detections
    .into_iter()
    .zip(suppressed)
    .filter_map(|(detection, suppressed)| (!suppressed).then_some(detection))
    .collect();
  debug!("NMS 阈值 {}: {} -> {} 个检测框", threshold, before, kept.len());
  kept
}
