// 该文件是 Xiling （西岭） 项目的一部分。
// src/model/layer.rs - 检测头层定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use serde::{Deserialize, Serialize};

/// 一个检测头（特征层）的静态描述
///
/// 锚框尺寸以模型输入像素为单位。`scale_x`/`scale_y` 为 0 时使用
/// `sigmoid(t) * 2 - 0.5` 的中心解码，否则使用缩放变体。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
  pub name: String,
  pub grid_w: usize,
  pub grid_h: usize,
  pub anchor_w: Vec<f32>,
  pub anchor_h: Vec<f32>,
  #[serde(default)]
  pub scale_x: f32,
  #[serde(default)]
  pub scale_y: f32,
}

impl LayerSpec {
  pub fn new(
    name: impl Into<String>,
    grid_w: usize,
    grid_h: usize,
    anchors: &[(f32, f32)],
  ) -> Self {
    Self {
      name: name.into(),
      grid_w,
      grid_h,
      anchor_w: anchors.iter().map(|(w, _)| *w).collect(),
      anchor_h: anchors.iter().map(|(_, h)| *h).collect(),
      scale_x: 0.0,
      scale_y: 0.0,
    }
  }

  pub fn with_scale(mut self, scale_x: f32, scale_y: f32) -> Self {
    self.scale_x = scale_x;
    self.scale_y = scale_y;
    self
  }

  pub fn num_anchors(&self) -> usize {
    self.anchor_w.len()
  }

  /// 该层占用的候选槽位数
  pub fn slot_count(&self) -> usize {
    self.grid_w * self.grid_h * self.num_anchors()
  }
}

/// 拆分头默认的特征层步长
pub const SPLIT_HEAD_STRIDES: [u32; 3] = [8, 16, 32];

fn default_strides() -> Vec<u32> {
  SPLIT_HEAD_STRIDES.to_vec()
}

/// 得分与框距离分开输出的无锚框检测头
///
/// 两个张量都按 [通道, 锚点] 排列。锚点按步长从小到大依次展开，
/// 每个步长内按行优先遍历网格，网格尺寸为输入尺寸整除步长。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitHead {
  pub scores: String,
  pub boxes: String,
  #[serde(default = "default_strides")]
  pub strides: Vec<u32>,
}

impl SplitHead {
  pub fn new(scores: impl Into<String>, boxes: impl Into<String>) -> Self {
    Self {
      scores: scores.into(),
      boxes: boxes.into(),
      strides: default_strides(),
    }
  }

  pub fn with_strides(mut self, strides: &[u32]) -> Self {
    self.strides = strides.to_vec();
    self
  }

  /// 每个步长对应的网格 (stride, grid_w, grid_h)
  pub fn grids(&self, width: u32, height: u32) -> impl Iterator<Item = (u32, usize, usize)> + '_ {
    self.strides.iter().map(move |&stride| {
      let stride = stride.max(1);
      (stride, (width / stride) as usize, (height / stride) as usize)
    })
  }

  /// 所有步长的锚点总数
  pub fn point_count(&self, width: u32, height: u32) -> usize {
    self.grids(width, height).map(|(_, w, h)| w * h).sum()
  }
}
