// 该文件是 Xiling （西岭） 项目的一部分。
// tests/common/synthetic_tensor.rs - 构造合成输出张量
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

use xiling::{
  model::{LayerSpec, ModelConfig, PostProcessMode, SplitHead},
  tensor::Tensor,
};

/// [1, H, W, C] 布局的检测层输出
#[derive(Debug, Clone)]
pub struct GridTensor {
  pub grid_w: usize,
  pub grid_h: usize,
  pub channels: usize,
  pub data: Vec<f32>,
}

impl GridTensor {
  pub fn filled(grid_w: usize, grid_h: usize, channels: usize, value: f32) -> Self {
    Self {
      grid_w,
      grid_h,
      channels,
      data: vec![value; grid_w * grid_h * channels],
    }
  }

  /// 从单元 (gx, gy) 的第 `offset` 个通道开始写入
  pub fn set(&mut self, gx: usize, gy: usize, offset: usize, values: &[f32]) -> &mut Self {
    let base = (gy * self.grid_w + gx) * self.channels + offset;
    self.data[base..base + values.len()].copy_from_slice(values);
    self
  }

  pub fn to_tensor(&self, name: &str) -> Tensor {
    Tensor::from_f32(
      name,
      vec![1, self.grid_h, self.grid_w, self.channels],
      &self.data,
    )
    .unwrap()
  }
}

pub fn class_names(num_classes: usize) -> Vec<String> {
  (0..num_classes).map(|i| format!("class{i}")).collect()
}

pub fn layered_config(size: u32, num_classes: usize, layers: Vec<LayerSpec>) -> ModelConfig {
  ModelConfig {
    input_width: size,
    input_height: size,
    conf_threshold: 0.25,
    score_threshold: 0.25,
    iou_threshold: 0.5,
    num_boxes: None,
    num_classes,
    consolidated_output: String::new(),
    class_names: class_names(num_classes),
    mode: PostProcessMode::Detection,
    layers,
    split_head: None,
  }
}

pub fn consolidated_config(
  size: u32,
  num_classes: usize,
  output: &str,
  mode: PostProcessMode,
) -> ModelConfig {
  ModelConfig {
    consolidated_output: output.to_string(),
    mode,
    ..layered_config(size, num_classes, Vec::new())
  }
}

pub fn split_head_config(size: u32, num_classes: usize, head: SplitHead) -> ModelConfig {
  ModelConfig {
    mode: PostProcessMode::AnchorFree,
    split_head: Some(head),
    ..layered_config(size, num_classes, Vec::new())
  }
}

/// 合并输出的一行: cx, cy, w, h, objectness, 各类别得分
pub fn row(cx: f32, cy: f32, w: f32, h: f32, objectness: f32, classes: &[f32]) -> Vec<f32> {
  let mut row = vec![cx, cy, w, h, objectness];
  row.extend_from_slice(classes);
  row
}

/// 确定性的伪随机数，保证测试可复现
#[derive(Debug, Clone)]
pub struct Lcg(u64);

impl Lcg {
  pub fn new(seed: u64) -> Self {
    Self(seed)
  }

  pub fn next_f32(&mut self) -> f32 {
    self.0 = self
      .0
      .wrapping_mul(6364136223846793005)
      .wrapping_add(1442695040888963407);
    (self.0 >> 40) as f32 / (1u64 << 24) as f32
  }

  pub fn range(&mut self, lo: f32, hi: f32) -> f32 {
    lo + (hi - lo) * self.next_f32()
  }
}

pub fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
