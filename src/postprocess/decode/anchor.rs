// 该文件是 Xiling （西岭） 项目的一部分。
// src/postprocess/decode/anchor.rs - 分层锚框解码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use tracing::debug;

use super::{ChannelLayout, DecodeError, fetch, logit, sigmoid};
use crate::{
  model::{LayerSpec, ModelConfig},
  postprocess::candidates::CandidateBuffers,
  tensor::Tensor,
};

/// 已与运行时输出张量绑定的检测层
#[derive(Debug, Clone, PartialEq)]
pub struct BoundLayer {
  pub spec: LayerSpec,
  pub tensor_index: usize,
  /// 绑定时的张量形状 [1, H, W, C]
  pub shape: Vec<usize>,
  /// 每个网格单元的通道数（可大于锚框数 × pitch）
  pub channels: usize,
  /// 该层第一个槽位的全局索引
  pub slot_offset: usize,
}

impl BoundLayer {
  /// 网格单元 (gx, gy) 第 `anchor` 个锚框对应的全局槽位
  pub fn slot(&self, gx: usize, gy: usize, anchor: usize) -> usize {
    self.slot_offset + (gy * self.spec.grid_w + gx) * self.spec.num_anchors() + anchor
  }
}

pub(super) fn decode(
  layers: &[BoundLayer],
  tensors: &[Tensor],
  config: &ModelConfig,
  layout: &ChannelLayout,
  out: &mut CandidateBuffers,
) -> Result<usize, DecodeError> {
  let raw_threshold = logit(config.conf_threshold);
  let objectness_channel = layout.objectness.unwrap_or(4);
  let mut accepted = 0;

  for layer in layers {
    let tensor = fetch(tensors, layer.tensor_index, &layer.shape)?;
    let data = tensor.to_f32()?;
    let spec = &layer.spec;
    let stride_x = config.input_width as f32 / spec.grid_w as f32;
    let stride_y = config.input_height as f32 / spec.grid_h as f32;

    for gy in 0..spec.grid_h {
      for gx in 0..spec.grid_w {
        let cell = (gy * spec.grid_w + gx) * layer.channels;
        for a in 0..spec.num_anchors() {
          let base = cell + a * layout.pitch;
          let row = &data[base..base + layout.pitch];

          let raw = row[objectness_channel];
          if raw <= raw_threshold {
            continue;
          }
          let objectness = sigmoid(raw);
          if objectness <= config.conf_threshold {
            continue;
          }

          let Some((class_id, score)) =
            layout.best_class(row, config.score_threshold, |v| objectness * sigmoid(v))
          else {
            continue;
          };

          let slot = layer.slot(gx, gy, a);
          let cx = center(row[0], gx, stride_x, spec.scale_x);
          let cy = center(row[1], gy, stride_y, spec.scale_y);
          let w = (sigmoid(row[2]) * 2.0).powi(2) * spec.anchor_w[a];
          let h = (sigmoid(row[3]) * 2.0).powi(2) * spec.anchor_h[a];
          out.write_box(slot, cx, cy, w, h);
          layout.copy_keypoints(row, out.keypoints_mut(slot));
          out.index_mut().push(class_id, score, slot);
          accepted += 1;
        }
      }
    }

    debug!("检测层 {} 解码完成, 累计候选 {}", spec.name, accepted);
  }

  Ok(accepted)
}

fn center(t: f32, cell: usize, stride: f32, scale: f32) -> f32 {
  let offset = if scale == 0.0 {
    sigmoid(t) * 2.0 - 0.5
  } else {
    sigmoid(t * scale - 0.5 * (scale - 1.0))
  };
  (offset + cell as f32) * stride
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn slots_are_laid_out_cell_major_then_anchor() {
    let layer = BoundLayer {
      spec: LayerSpec::new("p4", 3, 2, &[(1.0, 1.0), (2.0, 2.0)]),
      tensor_index: 1,
      shape: vec![1, 2, 3, 14],
      channels: 14,
      slot_offset: 100,
    };
    assert_eq!(layer.slot(0, 0, 0), 100);
    assert_eq!(layer.slot(0, 0, 1), 101);
    assert_eq!(layer.slot(1, 0, 0), 102);
    assert_eq!(layer.slot(2, 1, 1), 100 + 11);
  }

  #[test]
  fn center_decoding_variants() {
    // sigmoid(0) = 0.5
    assert_eq!(center(0.0, 1, 32.0, 0.0), (0.5 * 2.0 - 0.5 + 1.0) * 32.0);
    // scale = 1 退化为 sigmoid(t)
    assert_eq!(center(0.0, 2, 8.0, 1.0), 2.5 * 8.0);
  }
}
