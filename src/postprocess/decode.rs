// 该文件是 Xiling （西岭） 项目的一部分。
// src/postprocess/decode.rs - 候选解码策略
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod anchor;
mod consolidated;
mod split;

use thiserror::Error;

use crate::{
  model::{KeypointLayout, ModelConfig, PostProcessMode},
  postprocess::candidates::CandidateBuffers,
  tensor::{Tensor, TensorError},
};

pub use anchor::BoundLayer;
pub use consolidated::ConsolidatedOutput;
pub use split::{PlanarTensor, PointGrid, SplitHeadOutput};

/// 没有可见度通道的关键点（人脸）使用的固定可见度
pub const DEFAULT_VISIBILITY: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("缺少输出张量: 索引 {0}")]
  MissingTensor(usize),
  #[error("输出张量 {name} 形状改变: 绑定时 {expected:?}, 实际 {actual:?}")]
  ShapeChanged {
    name: String,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("张量读取错误: {0}")]
  Tensor(#[from] TensorError),
  #[error("原始帧尺寸无效: {width}x{height}")]
  InvalidSourceSize { width: u32, height: u32 },
}

/// 单个候选在通道维度上的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
  /// 目标置信度通道，`None` 表示已融合进类别得分（恒为 1.0）
  pub objectness: Option<usize>,
  pub class_offset: usize,
  pub num_classes: usize,
  pub keypoints: Option<(usize, KeypointLayout)>,
  /// 每个候选至少占用的通道数
  pub pitch: usize,
}

impl ChannelLayout {
  pub fn for_mode(mode: PostProcessMode, num_classes: usize) -> Self {
    match mode {
      PostProcessMode::Detection => Self {
        objectness: Some(4),
        class_offset: 5,
        num_classes,
        keypoints: None,
        pitch: 5 + num_classes,
      },
      PostProcessMode::Pose => {
        let layout = KeypointLayout::POSE;
        Self {
          objectness: Some(4),
          class_offset: 5,
          num_classes,
          keypoints: Some((5 + num_classes, layout)),
          pitch: 5 + num_classes + layout.channels(),
        }
      }
      PostProcessMode::Face => {
        let layout = KeypointLayout::FACE;
        Self {
          objectness: Some(4),
          class_offset: 5 + layout.channels(),
          num_classes,
          keypoints: Some((5, layout)),
          pitch: 5 + layout.channels() + num_classes,
        }
      }
      PostProcessMode::AnchorFree => Self {
        objectness: None,
        class_offset: 4,
        num_classes,
        keypoints: None,
        pitch: 4 + num_classes,
      },
    }
  }

  /// 在一行通道中寻找得分最高且超过阈值的类别
  ///
  /// 起始比较值就是阈值本身，因此只有严格大于阈值的类别会被选中。
  pub fn best_class(
    &self,
    row: &[f32],
    threshold: f32,
    score: impl Fn(f32) -> f32,
  ) -> Option<(usize, f32)> {
    let classes = &row[self.class_offset..self.class_offset + self.num_classes];
    let mut best = None;
    let mut max_score = threshold;
    for (class_id, raw) in classes.iter().enumerate() {
      let s = score(*raw);
      if s > max_score {
        max_score = s;
        best = Some((class_id, s));
      }
    }
    best
  }

  /// 把关键点通道按 (x, y, visibility) 复制进槽位缓冲区
  pub fn copy_keypoints(&self, row: &[f32], dst: &mut [f32]) {
    let Some((offset, layout)) = self.keypoints else {
      return;
    };
    for k in 0..layout.count {
      let src = offset + k * layout.dims;
      dst[k * 3] = row[src];
      dst[k * 3 + 1] = row[src + 1];
      dst[k * 3 + 2] = if layout.dims >= 3 {
        row[src + 2]
      } else {
        DEFAULT_VISIBILITY
      };
    }
  }
}

/// 绑定阶段选出的解码策略
#[derive(Debug, Clone)]
pub enum DecodeStrategy {
  /// 每个检测层一个张量，需要锚框解码
  Anchor(Vec<BoundLayer>),
  /// 单个张量已包含解码后的全部候选
  Consolidated(ConsolidatedOutput),
  /// 得分与框距离分开输出的无锚框检测头
  SplitHead(SplitHeadOutput),
}

impl DecodeStrategy {
  /// 解码一帧输出，返回进入候选索引的数量
  pub fn decode(
    &self,
    tensors: &[Tensor],
    config: &ModelConfig,
    layout: &ChannelLayout,
    out: &mut CandidateBuffers,
  ) -> Result<usize, DecodeError> {
    match self {
      DecodeStrategy::Anchor(layers) => anchor::decode(layers, tensors, config, layout, out),
      DecodeStrategy::Consolidated(output) => {
        consolidated::decode(output, tensors, config, layout, out)
      }
      DecodeStrategy::SplitHead(head) => split::decode(head, tensors, config, layout, out),
    }
  }

  pub fn is_consolidated(&self) -> bool {
    matches!(self, DecodeStrategy::Consolidated(_))
  }
}

pub fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// sigmoid 的反函数，用于把概率阈值换算到原始输出空间
pub fn logit(p: f32) -> f32 {
  (p / (1.0 - p)).ln()
}

fn fetch<'a>(
  tensors: &'a [Tensor],
  index: usize,
  shape: &[usize],
) -> Result<&'a Tensor, DecodeError> {
  let tensor = tensors.get(index).ok_or(DecodeError::MissingTensor(index))?;
  if tensor.shape() != shape {
    return Err(DecodeError::ShapeChanged {
      name: tensor.name().to_string(),
      expected: shape.to_vec(),
      actual: tensor.shape().to_vec(),
    });
  }
  Ok(tensor)
}
