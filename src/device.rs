// 该文件是 Tianmu （天目） 项目的一部分。
// src/device.rs - 计算设备选择
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

use std::fmt;
use std::str::FromStr;

#[cfg(any(feature = "cuda", feature = "coreml"))]
use ort::execution_providers::ExecutionProvider;
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DeviceError {
  #[error("未知设备: {0}")]
  Unknown(String),
  #[error("设备 {0} 需要启用 `{1}` 特性")]
  FeatureDisabled(Device, &'static str),
}

/// 推理设备，构造时确定，只能通过显式的 `to` 调用切换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
  Cpu,
  Gpu,
  #[serde(alias = "mps")]
  Accelerator,
}

impl Default for Device {
  fn default() -> Self {
    Device::probe()
  }
}

impl Device {
  /// 按 GPU、加速器、CPU 的顺序探测第一个可用设备
  pub fn probe() -> Self {
    let device = if cuda_available() {
      Device::Gpu
    } else if coreml_available() {
      Device::Accelerator
    } else {
      Device::Cpu
    };
    debug!("探测到推理设备: {}", device);
    device
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Device::Cpu => "cpu",
      Device::Gpu => "gpu",
      Device::Accelerator => "accelerator",
    }
  }

  /// 设备对应的执行提供者列表，末尾总是 CPU 兜底
  pub fn execution_providers(&self) -> Result<Vec<ExecutionProviderDispatch>, DeviceError> {
    let mut providers = Vec::with_capacity(2);
    match self {
      Device::Cpu => {}
      #[cfg(feature = "cuda")]
      Device::Gpu => {
        providers.push(ort::execution_providers::CUDAExecutionProvider::default().build());
      }
      #[cfg(not(feature = "cuda"))]
      Device::Gpu => return Err(DeviceError::FeatureDisabled(*self, "cuda")),
      #[cfg(feature = "coreml")]
      Device::Accelerator => {
        providers.push(ort::execution_providers::CoreMLExecutionProvider::default().build());
      }
      #[cfg(not(feature = "coreml"))]
      Device::Accelerator => return Err(DeviceError::FeatureDisabled(*self, "coreml")),
    }
    providers.push(CPUExecutionProvider::default().build());
    Ok(providers)
  }
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Device {
  type Err = DeviceError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "cpu" => Ok(Device::Cpu),
      "gpu" | "cuda" => Ok(Device::Gpu),
      "accelerator" | "mps" | "coreml" => Ok(Device::Accelerator),
      other => Err(DeviceError::Unknown(other.to_string())),
    }
  }
}

#[cfg(feature = "cuda")]
fn cuda_available() -> bool {
  ort::execution_providers::CUDAExecutionProvider::default()
    .is_available()
    .unwrap_or(false)
}

#[cfg(not(feature = "cuda"))]
fn cuda_available() -> bool {
  false
}

#[cfg(feature = "coreml")]
fn coreml_available() -> bool {
  ort::execution_providers::CoreMLExecutionProvider::default()
    .is_available()
    .unwrap_or(false)
}

#[cfg(not(feature = "coreml"))]
fn coreml_available() -> bool {
  false
}
