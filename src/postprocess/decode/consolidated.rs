// 该文件是 Xiling （西岭） 项目的一部分。
// src/postprocess/decode/consolidated.rs - 合并输出解码
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

/// 合并输出张量的绑定信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidatedOutput {
  pub tensor_index: usize,
  pub shape: Vec<usize>,
  /// `true` 表示 [channels, rows] 布局（解耦头导出）
  pub transposed: bool,
  pub rows: usize,
  /// 张量中每行实际的通道数
  pub pitch: usize,
}

/// 按行访问张量数据，转置布局逐行收集到临时缓冲区
struct Rows<'a> {
  data: &'a [f32],
  output: &'a ConsolidatedOutput,
}

impl<'a> Rows<'a> {
  fn row<'b>(&'b self, r: usize, scratch: &'b mut [f32]) -> &'b [f32] {
    let pitch = self.output.pitch;
    if !self.output.transposed {
      return &self.data[r * pitch..(r + 1) * pitch];
    }
    let rows = self.output.rows;
    for (c, v) in scratch.iter_mut().enumerate() {
      *v = self.data[c * rows + r];
    }
    scratch
  }
}

pub(super) fn decode(
  output: &ConsolidatedOutput,
  tensors: &[Tensor],
  config: &ModelConfig,
  layout: &ChannelLayout,
  out: &mut CandidateBuffers,
) -> Result<usize, DecodeError> {
  let tensor = fetch(tensors, output.tensor_index, &output.shape)?;
  let data = tensor.to_f32()?;
  let rows = Rows {
    data: &data,
    output,
  };
  let mut scratch = vec![0.0f32; output.pitch];
  let mut accepted = 0;

  for slot in 0..output.rows {
    let row = rows.row(slot, &mut scratch);

    let objectness = layout.objectness.map_or(1.0, |c| row[c]);
    if objectness <= config.conf_threshold {
      continue;
    }
    let Some((class_id, score)) =
      layout.best_class(row, config.score_threshold, |v| objectness * v)
    else {
      continue;
    };

    out.write_box(slot, row[0], row[1], row[2], row[3]);
    layout.copy_keypoints(row, out.keypoints_mut(slot));
    out.index_mut().push(class_id, score, slot);
    accepted += 1;
  }

  debug!("合并输出 {} 解码完成, 候选 {}", tensor.name(), accepted);
  Ok(accepted)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn transposed_rows_are_gathered_by_column() {
    // 2 行 × 3 通道，按 [channels, rows] 存储
    let data = [1.0, 2.0, 10.0, 20.0, 100.0, 200.0];
    let output = ConsolidatedOutput {
      tensor_index: 0,
      shape: vec![1, 3, 2],
      transposed: true,
      rows: 2,
      pitch: 3,
    };
    let rows = Rows {
      data: &data,
      output: &output,
    };
    let mut scratch = [0.0f32; 3];
    assert_eq!(rows.row(1, &mut scratch), &[2.0, 20.0, 200.0]);
  }

  #[test]
  fn flat_rows_are_slices() {
    let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let output = ConsolidatedOutput {
      tensor_index: 0,
      shape: vec![2, 3],
      transposed: false,
      rows: 2,
      pitch: 3,
    };
    let rows = Rows {
      data: &data,
      output: &output,
    };
    let mut scratch = [0.0f32; 3];
    assert_eq!(rows.row(1, &mut scratch), &[4.0, 5.0, 6.0]);
  }
}
