// 该文件是 Xiling （西岭） 项目的一部分。
// src/postprocess/candidates.rs - 按类别的候选索引
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::model::KEYPOINT_STRIDE;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
  pub score: f32,
  pub slot: usize,
}

/// 每个类别一个 (得分, 槽位) 列表，每次解码前清空重建
#[derive(Debug, Clone)]
pub struct CandidateIndex {
  classes: Vec<Vec<Candidate>>,
}

impl CandidateIndex {
  pub fn new(num_classes: usize) -> Self {
    Self {
      classes: vec![Vec::new(); num_classes],
    }
  }

  pub fn num_classes(&self) -> usize {
    self.classes.len()
  }

  pub fn clear(&mut self) {
    self.classes.iter_mut().for_each(Vec::clear);
  }

  pub fn push(&mut self, class_id: usize, score: f32, slot: usize) {
    if let Some(list) = self.classes.get_mut(class_id) {
      list.push(Candidate { score, slot });
    }
  }

  /// 按得分降序排序，同分保持插入顺序
  pub fn sort_descending(&mut self) {
    for list in &mut self.classes {
      list.sort_by(|a, b| b.score.total_cmp(&a.score));
    }
  }

  pub fn class(&self, class_id: usize) -> &[Candidate] {
    self.classes.get(class_id).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn len(&self) -> usize {
    self.classes.iter().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.classes.iter().all(Vec::is_empty)
  }
}

/// 每次解码共用的候选缓冲区
///
/// 每个槽位固定占用 4 个框坐标和 51 个关键点浮点数，加载模型时一次性分配。
#[derive(Debug, Clone)]
pub struct CandidateBuffers {
  boxes: Vec<f32>,
  keypoints: Vec<f32>,
  index: CandidateIndex,
}

impl CandidateBuffers {
  pub fn new(num_boxes: usize, num_classes: usize) -> Self {
    Self {
      boxes: vec![0.0; num_boxes * 4],
      keypoints: vec![0.0; num_boxes * KEYPOINT_STRIDE],
      index: CandidateIndex::new(num_classes),
    }
  }

  pub fn num_boxes(&self) -> usize {
    self.boxes.len() / 4
  }

  /// 只清空索引，缓冲区内容由下一次解码覆盖
  pub fn clear(&mut self) {
    self.index.clear();
  }

  pub fn boxes(&self) -> &[f32] {
    &self.boxes
  }

  pub fn box_at(&self, slot: usize) -> [f32; 4] {
    let b = &self.boxes[slot * 4..slot * 4 + 4];
    [b[0], b[1], b[2], b[3]]
  }

  /// 以中心点和宽高写入槽位，转换为角点坐标
  pub fn write_box(&mut self, slot: usize, cx: f32, cy: f32, w: f32, h: f32) {
    self.boxes[slot * 4..slot * 4 + 4].copy_from_slice(&[
      cx - w / 2.0,
      cy - h / 2.0,
      cx + w / 2.0,
      cy + h / 2.0,
    ]);
  }

  pub fn keypoints(&self, slot: usize) -> &[f32] {
    &self.keypoints[slot * KEYPOINT_STRIDE..(slot + 1) * KEYPOINT_STRIDE]
  }

  pub fn keypoints_mut(&mut self, slot: usize) -> &mut [f32] {
    &mut self.keypoints[slot * KEYPOINT_STRIDE..(slot + 1) * KEYPOINT_STRIDE]
  }

  pub fn index(&self) -> &CandidateIndex {
    &self.index
  }

  pub fn index_mut(&mut self) -> &mut CandidateIndex {
    &mut self.index
  }
}
