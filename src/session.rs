// 该文件是 Tianmu （天目） 项目的一部分。
// src/session.rs - ONNX Runtime 会话
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

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::TensorRef;
use thiserror::Error;
use tracing::{debug, info};

use crate::device::{Device, DeviceError};

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("模型文件不存在: {0}")]
  ModelNotFound(PathBuf),
  #[error("设备错误: {0}")]
  DeviceError(#[from] DeviceError),
  #[error("ONNX Runtime 错误: {0}")]
  OrtError(#[from] ort::Error),
  #[error("张量 `{0}` 不是连续内存")]
  NotContiguous(String),
  #[error("缺少输出张量: {0}")]
  MissingOutput(String),
  #[error("张量形状错误: {0}")]
  ShapeError(#[from] ndarray::ShapeError),
}

/// 绑定到某个设备的推理会话，独占其模型文件路径与设备
pub struct DeviceSession {
  session: Session,
  model_path: PathBuf,
  device: Device,
}

/// 会话的命名输入
pub enum NamedInput<'a> {
  F32(&'a str, &'a ArrayD<f32>),
  I64(&'a str, &'a ArrayD<i64>),
}

impl NamedInput<'_> {
  fn name(&self) -> &str {
    match self {
      NamedInput::F32(name, _) | NamedInput::I64(name, _) => name,
    }
  }
}

impl DeviceSession {
  pub fn load(model_path: impl AsRef<Path>, device: Device) -> Result<Self, SessionError> {
    let model_path = model_path.as_ref().to_path_buf();
    let session = build_session(&model_path, device)?;
    Ok(Self {
      session,
      model_path,
      device,
    })
  }

  pub fn device(&self) -> Device {
    self.device
  }

  pub fn model_path(&self) -> &Path {
    &self.model_path
  }

  /// 在新设备上重建会话
  pub fn to(&mut self, device: Device) -> Result<(), SessionError> {
    if device == self.device {
      return Ok(());
    }
    info!("切换推理设备: {} -> {}", self.device, device);
    self.session = build_session(&self.model_path, device)?;
    self.device = device;
    Ok(())
  }

  /// 执行一次前向推理，按名称取出 f32 输出
  pub fn run(
    &mut self,
    inputs: &[NamedInput<'_>],
    outputs: &[&str],
  ) -> Result<Vec<ArrayD<f32>>, SessionError> {
    let mut values: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len());
    for input in inputs {
      let value: SessionInputValue<'_> = match input {
        NamedInput::F32(name, array) => {
          let data = array
            .as_slice()
            .ok_or_else(|| SessionError::NotContiguous(name.to_string()))?;
          TensorRef::from_array_view((dims_of(array.shape()), data))?.into()
        }
        NamedInput::I64(name, array) => {
          let data = array
            .as_slice()
            .ok_or_else(|| SessionError::NotContiguous(name.to_string()))?;
          TensorRef::from_array_view((dims_of(array.shape()), data))?.into()
        }
      };
      values.push((Cow::Borrowed(input.name()), value));
    }

    debug!("执行模型推理: {}", self.model_path.display());
    let inputs: SessionInputs<'_, '_, 0> = SessionInputs::ValueMap(values);
    let results = self.session.run(inputs)?;

    let mut extracted = Vec::with_capacity(outputs.len());
    for name in outputs {
      let value = results
        .get(*name)
        .ok_or_else(|| SessionError::MissingOutput(name.to_string()))?;
      let (shape, data) = value.try_extract_tensor::<f32>()?;
      let shape: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
      debug!("输出 {} 形状: {:?}", name, shape);
      extracted.push(ArrayD::from_shape_vec(IxDyn(&shape), data.to_vec())?);
    }
    Ok(extracted)
  }
}

fn dims_of(shape: &[usize]) -> Vec<i64> {
  shape.iter().map(|&d| d as i64).collect()
}

fn build_session(model_path: &Path, device: Device) -> Result<Session, SessionError> {
  if !model_path.exists() {
    return Err(SessionError::ModelNotFound(model_path.to_path_buf()));
  }

  info!("加载模型文件: {} (设备: {})", model_path.display(), device);
  let providers = device.execution_providers()?;
  let session = Session::builder()?
    .with_optimization_level(GraphOptimizationLevel::Level3)?
    .with_execution_providers(providers)?
    .commit_from_file(model_path)?;
  info!("模型加载完成");
  Ok(session)
}
