// 该文件是 Xiling （西岭） 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  fs::File,
  io::{BufWriter, Write},
  path::PathBuf,
  sync::Mutex,
};

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, broker::Snapshot};

#[cfg(feature = "draw")]
pub mod draw;

pub trait Render<Output> {
  type Error;
  fn render_result(&self, result: &Output) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("结果序列化错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("输出地址缺少文件路径: {0}")]
  MissingPath(String),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 把检测结果写入日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOutput;

impl FromUrl for LogOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch);
    }
    Ok(LogOutput)
  }
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl Render<Snapshot> for LogOutput {
  type Error = OutputError;

  fn render_result(&self, snapshot: &Snapshot) -> Result<(), Self::Error> {
    info!(
      "第 {} 帧: {} 个目标",
      snapshot.generation,
      snapshot.result.len()
    );
    for item in snapshot.result.iter() {
      info!(
        "  {} ({}) {:.3} [{:.1}, {:.1}, {:.1}, {:.1}]",
        item.class_name,
        item.class_id,
        item.score,
        item.bbox[0],
        item.bbox[1],
        item.bbox[2],
        item.bbox[3]
      );
    }
    Ok(())
  }
}

/// 每个快照写一行 JSON
pub struct JsonLinesOutput<W: Write> {
  writer: Mutex<W>,
}

impl<W: Write> JsonLinesOutput<W> {
  pub fn new(writer: W) -> Self {
    Self {
      writer: Mutex::new(writer),
    }
  }

  pub fn into_inner(self) -> W {
    self
      .writer
      .into_inner()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl FromUrl for JsonLinesOutput<BufWriter<File>> {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch);
    }
    let path = PathBuf::from(url.path());
    if url.path().is_empty() || url.path() == "/" {
      return Err(OutputError::MissingPath(url.to_string()));
    }
    info!("检测结果写入: {}", path.display());
    Ok(Self::new(BufWriter::new(File::create(path)?)))
  }
}

impl FromUrlWithScheme for JsonLinesOutput<BufWriter<File>> {
  const SCHEME: &'static str = "jsonl";
}

impl<W: Write> Render<Snapshot> for JsonLinesOutput<W> {
  type Error = OutputError;

  fn render_result(&self, snapshot: &Snapshot) -> Result<(), Self::Error> {
    let mut writer = self
      .writer
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    serde_json::to_writer(&mut *writer, snapshot)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
  }
}

/// 按 URL 方案选择的输出
pub enum OutputWrapper {
  Log(LogOutput),
  JsonLines(JsonLinesOutput<BufWriter<File>>),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      LogOutput::SCHEME => Ok(OutputWrapper::Log(LogOutput::from_url(url)?)),
      JsonLinesOutput::<BufWriter<File>>::SCHEME => {
        Ok(OutputWrapper::JsonLines(JsonLinesOutput::from_url(url)?))
      }
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl Render<Snapshot> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, snapshot: &Snapshot) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Log(output) => output.render_result(snapshot),
      OutputWrapper::JsonLines(output) => output.render_result(snapshot),
    }
  }
}
