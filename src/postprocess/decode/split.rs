// 该文件是 Xiling （西岭） 项目的一部分。
// src/postprocess/decode/split.rs - 拆分头无锚框解码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use tracing::debug;

use super::{ChannelLayout, DecodeError, fetch};
use crate::{model::ModelConfig, postprocess::candidates::CandidateBuffers, tensor::Tensor};

/// 以 [通道, 锚点] 读取的张量
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanarTensor {
  pub tensor_index: usize,
  pub shape: Vec<usize>,
  pub channels: usize,
}

/// 一个步长对应的锚点网格
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointGrid {
  pub stride: f32,
  pub grid_w: usize,
  pub grid_h: usize,
  /// 该网格第一个锚点的全局索引
  pub slot_offset: usize,
}

impl PointGrid {
  pub fn slot(&self, gx: usize, gy: usize) -> usize {
    self.slot_offset + gy * self.grid_w + gx
  }
}

/// 已绑定的拆分头：得分张量与框距离张量
#[derive(Debug, Clone, PartialEq)]
pub struct SplitHeadOutput {
  pub scores: PlanarTensor,
  /// 每个锚点 4 个通道：到左、上、右、下边的距离（以步长为单位）
  pub boxes: PlanarTensor,
  pub grids: Vec<PointGrid>,
  pub points: usize,
}

pub(super) fn decode(
  head: &SplitHeadOutput,
  tensors: &[Tensor],
  config: &ModelConfig,
  layout: &ChannelLayout,
  out: &mut CandidateBuffers,
) -> Result<usize, DecodeError> {
  let scores = fetch(tensors, head.scores.tensor_index, &head.scores.shape)?.to_f32()?;
  let boxes = fetch(tensors, head.boxes.tensor_index, &head.boxes.shape)?.to_f32()?;
  let points = head.points;
  let mut row = vec![0.0f32; layout.pitch];
  let mut accepted = 0;

  for grid in &head.grids {
    for gy in 0..grid.grid_h {
      for gx in 0..grid.grid_w {
        let slot = grid.slot(gx, gy);
        for (c, v) in row[layout.class_offset..layout.class_offset + layout.num_classes]
          .iter_mut()
          .enumerate()
        {
          *v = scores[c * points + slot];
        }
        let Some((class_id, score)) = layout.best_class(&row, config.score_threshold, |v| v)
        else {
          continue;
        };

        let (ax, ay) = (gx as f32 + 0.5, gy as f32 + 0.5);
        let x1 = ax - boxes[slot];
        let y1 = ay - boxes[points + slot];
        let x2 = ax + boxes[2 * points + slot];
        let y2 = ay + boxes[3 * points + slot];
        out.write_box(
          slot,
          (x1 + x2) * 0.5 * grid.stride,
          (y1 + y2) * 0.5 * grid.stride,
          (x2 - x1) * grid.stride,
          (y2 - y1) * grid.stride,
        );
        out.index_mut().push(class_id, score, slot);
        accepted += 1;
      }
    }
    debug!("步长 {} 解码完成, 累计候选 {}", grid.stride, accepted);
  }

  Ok(accepted)
}
