// 该文件是 Tianmu （天目） 项目的一部分。
// src/output/json_record.rs - JSON 检测记录输出
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

use std::{
  fs::File,
  io::BufWriter,
  path::{Path, PathBuf},
  str::FromStr,
};

use image::RgbImage;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::VideoFrames,
  model::{Detection, GroundingResult},
  output::{Render, ensure_parent},
};

#[derive(Error, Debug)]
pub enum JsonRecordError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("未知记录格式: {0}")]
  UnknownFormat(String),
}

/// 记录格式：完整检测列表，或按帧分列的框与标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFormat {
  #[default]
  Detections,
  Grounding,
}

impl FromStr for RecordFormat {
  type Err = JsonRecordError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "detections" => Ok(RecordFormat::Detections),
      "grounding" => Ok(RecordFormat::Grounding),
      other => Err(JsonRecordError::UnknownFormat(other.to_string())),
    }
  }
}

/// 将所有帧的检测结果写入一个 JSON 文件，例如 `json:///tmp/out.json?format=grounding`
pub struct JsonRecordOutput {
  path: PathBuf,
  format: RecordFormat,
}

impl FromUrlWithScheme for JsonRecordOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonRecordOutput {
  type Error = JsonRecordError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(JsonRecordError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }
    let format = uri
      .query_pairs()
      .find(|(key, _)| key == "format")
      .map(|(_, value)| value.parse())
      .transpose()?
      .unwrap_or_default();
    Ok(Self::new(decode_url_path(uri), format))
  }
}

impl JsonRecordOutput {
  pub fn new(path: impl Into<PathBuf>, format: RecordFormat) -> Self {
    Self {
      path: path.into(),
      format,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn format(&self) -> RecordFormat {
    self.format
  }

  /// 每帧一个元素
  pub fn record(&self, frames: &[Vec<Detection>]) -> Result<(), JsonRecordError> {
    ensure_parent(&self.path)?;
    let writer = BufWriter::new(File::create(&self.path)?);
    match self.format {
      RecordFormat::Detections => serde_json::to_writer_pretty(writer, frames)?,
      RecordFormat::Grounding => {
        let grounding: Vec<GroundingResult> = frames
          .iter()
          .map(|detections| GroundingResult::from(detections.as_slice()))
          .collect();
        serde_json::to_writer_pretty(writer, &grounding)?
      }
    }
    info!("保存 {} 帧检测记录到: {}", frames.len(), self.path.display());
    Ok(())
  }
}

impl Render<RgbImage, [Detection]> for JsonRecordOutput {
  type Error = JsonRecordError;

  fn render_result(&self, _frame: &RgbImage, result: &[Detection]) -> Result<(), Self::Error> {
    self.record(&[result.to_vec()])
  }
}

impl Render<VideoFrames, [Vec<Detection>]> for JsonRecordOutput {
  type Error = JsonRecordError;

  fn render_result(
    &self,
    _frame: &VideoFrames,
    result: &[Vec<Detection>],
  ) -> Result<(), Self::Error> {
    self.record(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{Value, json};

  fn read(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
  }

  #[test]
  fn grounding_format_from_query() {
    let url = Url::parse("json:///tmp/out.json?format=grounding").unwrap();
    let output = JsonRecordOutput::from_url(&url).unwrap();
    assert_eq!(output.format(), RecordFormat::Grounding);
    assert_eq!(output.path(), Path::new("/tmp/out.json"));
  }

  #[test]
  fn unknown_format_is_rejected() {
    let url = Url::parse("json:///tmp/out.json?format=csv").unwrap();
    assert!(matches!(
      JsonRecordOutput::from_url(&url),
      Err(JsonRecordError::UnknownFormat(_))
    ));
  }

  #[test]
  fn empty_image_result_records_empty_grounding() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grounding.json");
    let output = JsonRecordOutput::new(&path, RecordFormat::Grounding);
    let detections: Vec<Detection> = Vec::new();
    output
      .render_result(&RgbImage::new(2, 2), detections.as_slice())
      .unwrap();
    assert_eq!(read(&path), json!([{"bboxes": [], "labels": []}]));
  }

  #[test]
  fn detections_are_recorded_per_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/detections.json");
    let output = JsonRecordOutput::new(&path, RecordFormat::Detections);
    let frames = vec![
      vec![Detection {
        label: "car".into(),
        score: 0.5,
        bbox: [1.0, 2.0, 3.0, 4.0],
      }],
      vec![],
    ];
    output.record(&frames).unwrap();
    assert_eq!(
      read(&path),
      json!([[{"label": "car", "score": 0.5, "bbox": [1.0, 2.0, 3.0, 4.0]}], []])
    );
  }
}
