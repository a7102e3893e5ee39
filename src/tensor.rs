// 该文件是 Xiling （西岭） 项目的一部分。
// src/tensor.rs - 推理输出张量
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

use half::f16;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 张量元素类型标签（由推理运行时给出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
  Float32,
  Float16,
  UInt8,
  Int8,
}

impl DataType {
  pub fn element_size(self) -> usize {
    match self {
      DataType::Float32 => 4,
      DataType::Float16 => 2,
      DataType::UInt8 | DataType::Int8 => 1,
    }
  }
}

#[derive(Error, Debug)]
pub enum TensorError {
  #[error("不支持的张量数据类型: {0:?}")]
  UnsupportedDataType(DataType),
  #[error("张量 {name} 数据长度不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  LengthMismatch {
    name: String,
    expected: usize,
    actual: usize,
  },
}

/// 输出张量描述：名称、形状与数据类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
  pub name: String,
  pub shape: Vec<usize>,
  pub data_type: DataType,
}

impl TensorInfo {
  pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>, data_type: DataType) -> Self {
    Self {
      name: name.into(),
      shape: shape.into(),
      data_type,
    }
  }

  pub fn num_elements(&self) -> usize {
    self.shape.iter().product()
  }

  pub fn byte_len(&self) -> usize {
    self.num_elements() * self.data_type.element_size()
  }
}

/// 一个完整的输出张量：描述加原始字节
#[derive(Debug, Clone)]
pub struct Tensor {
  info: TensorInfo,
  data: Box<[u8]>,
}

impl Tensor {
  pub fn new(info: TensorInfo, data: impl Into<Box<[u8]>>) -> Result<Self, TensorError> {
    let data = data.into();
    let expected = info.byte_len();
    if data.len() != expected {
      return Err(TensorError::LengthMismatch {
        name: info.name,
        expected,
        actual: data.len(),
      });
    }
    Ok(Self { info, data })
  }

  pub fn from_f32(
    name: impl Into<String>,
    shape: impl Into<Vec<usize>>,
    values: &[f32],
  ) -> Result<Self, TensorError> {
    let info = TensorInfo::new(name, shape, DataType::Float32);
    let bytes: &[u8] = bytemuck::cast_slice(values);
    Self::new(info, bytes.to_vec())
  }

  pub fn from_f16(
    name: impl Into<String>,
    shape: impl Into<Vec<usize>>,
    values: &[f32],
  ) -> Result<Self, TensorError> {
    let info = TensorInfo::new(name, shape, DataType::Float16);
    let bytes = values
      .iter()
      .flat_map(|v| f16::from_f32(*v).to_ne_bytes())
      .collect::<Vec<u8>>();
    Self::new(info, bytes)
  }

  pub fn info(&self) -> &TensorInfo {
    &self.info
  }

  pub fn name(&self) -> &str {
    &self.info.name
  }

  pub fn shape(&self) -> &[usize] {
    &self.info.shape
  }

  pub fn data_type(&self) -> DataType {
    self.info.data_type
  }

  pub fn bytes(&self) -> &[u8] {
    &self.data
  }

  /// 以 f32 读取张量数据。对齐的 f32 缓冲区零拷贝，其余情况转换拷贝
  pub fn to_f32(&self) -> Result<Cow<'_, [f32]>, TensorError> {
    match self.info.data_type {
      DataType::Float32 => match bytemuck::try_cast_slice::<u8, f32>(&self.data) {
        Ok(values) => Ok(Cow::Borrowed(values)),
        Err(_) => Ok(Cow::Owned(
          self
            .data
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        )),
      },
      DataType::Float16 => Ok(Cow::Owned(
        self
          .data
          .chunks_exact(2)
          .map(|b| f16::from_ne_bytes([b[0], b[1]]).to_f32())
          .collect(),
      )),
      other => Err(TensorError::UnsupportedDataType(other)),
    }
  }
}
