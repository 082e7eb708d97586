// 该文件是 Tianmu （天目） 项目的一部分。
// src/config.rs - 检测工具配置
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::device::Device;

/// ONNX 导出的 OWLv2 base patch16 集成模型，可通过 `model_name` 替换
pub const OWLV2_DEFAULT_MODEL: &str = "Xenova/owlv2-base-patch16-ensemble";
pub const OWLV2_DEFAULT_CONFIDENCE: f32 = 0.1;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("置信度阈值必须位于 [0, 1] 区间, 实际为 {0}")]
  ConfidenceOutOfRange(f32),
  #[error("模型名称不能为空")]
  EmptyModelName,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
}

/// OWLv2 检测工具的配置，工具构造后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Owlv2Config {
  /// 模型名称：本地目录、本地 `.onnx` 文件或 Hugging Face 仓库名
  pub model_name: String,
  /// 预处理器名称：本地目录或 Hugging Face 仓库名
  pub processor_name: String,
  /// 置信度阈值
  pub confidence: f32,
  /// 推理设备
  pub device: Device,
}

impl Default for Owlv2Config {
  fn default() -> Self {
    Self {
      model_name: OWLV2_DEFAULT_MODEL.to_string(),
      processor_name: OWLV2_DEFAULT_MODEL.to_string(),
      confidence: OWLV2_DEFAULT_CONFIDENCE,
      device: Device::default(),
    }
  }
}

impl Owlv2Config {
  pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
    self.model_name = model_name.into();
    self
  }

  pub fn with_processor_name(mut self, processor_name: impl Into<String>) -> Self {
    self.processor_name = processor_name.into();
    self
  }

  pub fn with_confidence(mut self, confidence: f32) -> Self {
    self.confidence = confidence;
    self
  }

  pub fn with_device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&self.confidence) {
      return Err(ConfigError::ConfidenceOutOfRange(self.confidence));
    }
    if self.model_name.trim().is_empty() || self.processor_name.trim().is_empty() {
      return Err(ConfigError::EmptyModelName);
    }
    Ok(())
  }

  /// 从 JSON 文件读取配置，缺省字段使用默认值
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("读取配置文件: {}", path.display());
    let data = std::fs::read_to_string(path)?;
    let config: Owlv2Config = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_is_valid() {
    let config = Owlv2Config::default();
    assert_eq!(config.confidence, 0.1);
    assert_eq!(config.model_name, config.processor_name);
    config.validate().unwrap();
  }

  #[test]
  fn confidence_outside_unit_interval_is_rejected() {
    for confidence in [-0.01, 1.01, f32::NAN] {
      let config = Owlv2Config::default().with_confidence(confidence);
      assert!(matches!(
        config.validate(),
        Err(ConfigError::ConfidenceOutOfRange(_))
      ));
    }
    Owlv2Config::default().with_confidence(0.0).validate().unwrap();
    Owlv2Config::default().with_confidence(1.0).validate().unwrap();
  }

  #[test]
  fn partial_json_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("owlv2.json");
    std::fs::write(&path, r#"{"confidence": 0.3, "device": "cpu"}"#).unwrap();

    let config = Owlv2Config::from_json_file(&path).unwrap();
    assert_eq!(config.confidence, 0.3);
    assert_eq!(config.device, Device::Cpu);
    assert_eq!(config.model_name, OWLV2_DEFAULT_MODEL);
  }

  #[test]
  fn json_with_bad_confidence_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("owlv2.json");
    std::fs::write(&path, r#"{"confidence": 2.0, "device": "cpu"}"#).unwrap();

    assert!(matches!(
      Owlv2Config::from_json_file(&path),
      Err(ConfigError::ConfidenceOutOfRange(_))
    ));
  }
}
