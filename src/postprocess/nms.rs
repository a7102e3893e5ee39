// 该文件是 Xiling （西岭） 项目的一部分。
// src/postprocess/nms.rs - 非极大值抑制
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::postprocess::candidates::CandidateIndex;

/// NMS 保留下来的候选
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kept {
  pub class_id: usize,
  pub score: f32,
  pub slot: usize,
}

/// 计算两个 [x1, y1, x2, y2] 边界框的 IoU
pub fn iou(a: &[f32], b: &[f32]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 按类别做贪心抑制，类别之间互不影响
///
/// `index` 必须已按得分降序排序，`boxes` 为每槽位 4 个浮点数的候选框缓冲区。
pub fn suppress(index: &CandidateIndex, boxes: &[f32], iou_threshold: f32) -> Vec<Kept> {
  let mut kept = Vec::new();
  let mut suppressed = Vec::new();

  for class_id in 0..index.num_classes() {
    let candidates = index.class(class_id);
    suppressed.clear();
    suppressed.resize(candidates.len(), false);

    for i in 0..candidates.len() {
      if suppressed[i] {
        continue;
      }
      let best = candidates[i];
      kept.push(Kept {
        class_id,
        score: best.score,
        slot: best.slot,
      });

      let best_box = slot_box(boxes, best.slot);
      for j in (i + 1)..candidates.len() {
        if !suppressed[j] && iou(best_box, slot_box(boxes, candidates[j].slot)) > iou_threshold {
          suppressed[j] = true;
        }
      }
    }
  }

  kept
}

fn slot_box(boxes: &[f32], slot: usize) -> &[f32] {
  &boxes[slot * 4..slot * 4 + 4]
}
