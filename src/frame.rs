// 该文件是 Xiling （西岭） 项目的一部分。
// src/frame.rs - 预处理后的输入帧
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

const RGB_CHANNELS: usize = 3;

pub trait AsNhwcFrame {
  fn as_nhwc(&self) -> &[u8];
}

/// 原始帧（letterbox 之前）的尺寸，用于把检测结果映射回原图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSize {
  pub width: u32,
  pub height: u32,
}

impl SourceSize {
  pub fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("原始帧尺寸无效: {0}x{1}")]
  InvalidSource(u32, u32),
}

/// 已经 letterbox 到模型输入尺寸的 NHWC RGB 帧
#[derive(Debug, Clone)]
pub struct PreparedFrame {
  data: Box<[u8]>,
  width: u32,
  height: u32,
  source: SourceSize,
}

impl PreparedFrame {
  pub fn new(
    data: impl Into<Box<[u8]>>,
    width: u32,
    height: u32,
    source: SourceSize,
  ) -> Result<Self, FrameError> {
    let data = data.into();
    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }
    if source.width == 0 || source.height == 0 {
      return Err(FrameError::InvalidSource(source.width, source.height));
    }
    Ok(Self {
      data,
      width,
      height,
      source,
    })
  }

  /// 全零帧，常用于预热和测试
  pub fn blank(width: u32, height: u32, source: SourceSize) -> Result<Self, FrameError> {
    let size = RGB_CHANNELS * width as usize * height as usize;
    Self::new(vec![0u8; size], width, height, source)
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn source(&self) -> SourceSize {
    self.source
  }

  pub fn into_data(self) -> Box<[u8]> {
    self.data
  }
}

impl AsNhwcFrame for PreparedFrame {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}
