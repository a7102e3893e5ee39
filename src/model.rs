// 该文件是 Xiling （西岭） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use serde::Serialize;

mod config;
mod layer;
mod registry;

pub use self::config::{
  ConfigError, KEYPOINT_STRIDE, KeypointLayout, MAX_NUM_BOXES, ModelConfig, PostProcessMode,
};
pub use self::layer::{LayerSpec, SPLIT_HEAD_STRIDES, SplitHead};
pub use self::registry::{COCO_CLASSES, ModelId, ModelSource};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Keypoint {
  pub x: f32,
  pub y: f32,
  pub visibility: f32,
}

/// 单个检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundingBox {
  pub class_id: usize,
  pub class_name: String,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
  pub keypoints: Option<Box<[Keypoint]>>,
}

impl BoundingBox {
  pub fn width(&self) -> f32 {
    self.bbox[2] - self.bbox[0]
  }

  pub fn height(&self) -> f32 {
    self.bbox[3] - self.bbox[1]
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectResult {
  pub items: Box<[BoundingBox]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, BoundingBox> {
    self.items.iter()
  }
}

impl From<Vec<BoundingBox>> for DetectResult {
  fn from(items: Vec<BoundingBox>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}
