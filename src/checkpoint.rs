// 该文件是 Tianmu （天目） 项目的一部分。
// src/checkpoint.rs - 预训练权重下载与本地缓存
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

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const CHECKPOINT_DIR_ENV: &str = "TIANMU_CHECKPOINT_DIR";

const HUB_ENDPOINT: &str = "https://huggingface.co";
const HUB_REVISION: &str = "main";

#[derive(Error, Debug)]
pub enum CheckpointError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("网络错误: {0}")]
  NetworkError(#[from] reqwest::Error),
  #[error("下载 {0} 失败, HTTP 状态 {1}")]
  HttpStatus(String, reqwest::StatusCode),
  #[error("无效的下载地址: {0}")]
  InvalidUrl(String),
}

/// 固定来源的权重文件：下载地址与缓存文件名一一对应
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
  pub url: &'static str,
  pub file_name: &'static str,
}

/// 默认缓存目录，优先使用 `TIANMU_CHECKPOINT_DIR`
pub fn default_checkpoint_dir() -> PathBuf {
  if let Some(dir) = std::env::var_os(CHECKPOINT_DIR_ENV) {
    return PathBuf::from(dir);
  }
  dirs::cache_dir()
    .map(|mut p| {
      p.push("tianmu");
      p.push("checkpoints");
      p
    })
    .unwrap_or_else(|| PathBuf::from("./checkpoints"))
}

/// 本地权重缓存，文件存在即视为已缓存
#[derive(Debug, Clone)]
pub struct CheckpointCache {
  dir: PathBuf,
}

impl Default for CheckpointCache {
  fn default() -> Self {
    Self::new(default_checkpoint_dir())
  }
}

impl CheckpointCache {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn ensure_dir(&self) -> Result<&Path, CheckpointError> {
    if !self.dir.exists() {
      fs::create_dir_all(&self.dir)?;
      info!("创建权重缓存目录: {}", self.dir.display());
    }
    Ok(&self.dir)
  }

  /// 固定权重的缓存路径
  pub fn path_of(&self, checkpoint: &Checkpoint) -> PathBuf {
    self.dir.join(checkpoint.file_name)
  }

  /// 取得固定权重，本地缺失时下载
  pub fn fetch(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
    self.ensure_dir()?;
    let url = Url::parse(checkpoint.url)
      .map_err(|_| CheckpointError::InvalidUrl(checkpoint.url.to_string()))?;
    download(&url, &self.path_of(checkpoint))
  }

  /// Hugging Face 仓库文件的缓存路径: `<dir>/<org>--<repo>/<file>`
  pub fn hub_path(&self, repo: &str, file: &str) -> PathBuf {
    self.dir.join(repo.replace('/', "--")).join(file)
  }

  /// 取得 Hugging Face 仓库中的文件，本地缺失时下载
  pub fn fetch_hub_file(&self, repo: &str, file: &str) -> Result<PathBuf, CheckpointError> {
    let url = hub_file_url(repo, file)?;
    let path = self.hub_path(repo, file);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }
    download(&url, &path)
  }

  /// 解析预训练资源：本地目录直接使用，否则视为仓库名并走缓存
  pub fn resolve(&self, name: &str, file: &str) -> Result<PathBuf, CheckpointError> {
    let local = Path::new(name);
    if local.is_dir() {
      let path = local.join(file);
      debug!("使用本地文件: {}", path.display());
      return Ok(path);
    }
    self.fetch_hub_file(name, file)
  }
}

pub fn hub_file_url(repo: &str, file: &str) -> Result<Url, CheckpointError> {
  let raw = format!("{HUB_ENDPOINT}/{repo}/resolve/{HUB_REVISION}/{file}");
  Url::parse(&raw).map_err(|_| CheckpointError::InvalidUrl(raw))
}

/// 文件存在时直接返回，否则下载到 `path`，不做重试
pub fn download(url: &Url, path: &Path) -> Result<PathBuf, CheckpointError> {
  if path.exists() {
    debug!("权重已缓存: {}", path.display());
    return Ok(path.to_path_buf());
  }

  info!("下载权重 {} -> {}", url, path.display());
  let mut response = reqwest::blocking::get(url.clone())?;
  if !response.status().is_success() {
    return Err(CheckpointError::HttpStatus(
      url.to_string(),
      response.status(),
    ));
  }

  let written = persist(&mut response, path)?;
  info!(
    "下载完成: {} ({:.2} MB)",
    path.display(),
    written as f64 / (1024.0 * 1024.0)
  );
  Ok(path.to_path_buf())
}

/// 先写入 `<path>.part` 再改名，失败时删除临时文件
fn persist(reader: &mut impl Read, path: &Path) -> Result<u64, CheckpointError> {
  let partial = partial_path(path);
  let result = write_then_rename(reader, &partial, path);
  if result.is_err() && partial.exists() {
    debug!("清理未完成的下载: {}", partial.display());
    let _ = fs::remove_file(&partial);
  }
  result
}

fn write_then_rename(
  reader: &mut impl Read,
  partial: &Path,
  path: &Path,
) -> Result<u64, CheckpointError> {
  let written = {
    let mut writer = BufWriter::new(File::create(partial)?);
    let written = io::copy(reader, &mut writer)?;
    writer.flush()?;
    written
  };
  fs::rename(partial, path)?;
  Ok(written)
}

fn partial_path(path: &Path) -> PathBuf {
  let mut name = path.file_name().unwrap_or_default().to_os_string();
  name.push(".part");
  path.with_file_name(name)
}
