// 该文件是 Xiling （西岭） 项目的一部分。
// src/postprocess/letterbox.rs - 模型坐标到原图坐标的映射
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::{frame::SourceSize, model::BoundingBox};

/// 对称 letterbox 的参数
///
/// 前提是预处理把原图等比缩放后在两侧对称填充到模型尺寸。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  ratio: f32,
  pad_w: f32,
  pad_h: f32,
  src_w: f32,
  src_h: f32,
}

impl Letterbox {
  pub fn new(source: SourceSize, model_w: u32, model_h: u32) -> Option<Self> {
    if source.width == 0 || source.height == 0 || model_w == 0 || model_h == 0 {
      return None;
    }
    let (src_w, src_h) = (source.width as f32, source.height as f32);
    let (npu_w, npu_h) = (model_w as f32, model_h as f32);
    let ratio = (npu_w / src_w).min(npu_h / src_h);
    Some(Self {
      ratio,
      pad_w: (npu_w - src_w * ratio) / 2.0,
      pad_h: (npu_h - src_h * ratio) / 2.0,
      src_w,
      src_h,
    })
  }

  pub fn ratio(&self) -> f32 {
    self.ratio
  }

  pub fn padding(&self) -> (f32, f32) {
    (self.pad_w, self.pad_h)
  }

  /// 原图坐标 -> 模型坐标（预处理方向）
  pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
    (x * self.ratio + self.pad_w, y * self.ratio + self.pad_h)
  }

  /// 模型坐标 -> 原图坐标，结果限制在原图范围内
  pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
    (
      ((x - self.pad_w) / self.ratio).clamp(0.0, self.src_w),
      ((y - self.pad_h) / self.ratio).clamp(0.0, self.src_h),
    )
  }

  pub fn unletterbox(&self, item: &mut BoundingBox) {
    let (x1, y1) = self.to_source(item.bbox[0], item.bbox[1]);
    let (x2, y2) = self.to_source(item.bbox[2], item.bbox[3]);
    item.bbox = [x1, y1, x2, y2];

    if let Some(keypoints) = item.keypoints.as_mut() {
      for kp in keypoints.iter_mut() {
        let (x, y) = self.to_source(kp.x, kp.y);
        kp.x = x;
        kp.y = y;
      }
    }
  }

  pub fn apply(&self, items: &mut [BoundingBox]) {
    items.iter_mut().for_each(|item| self.unletterbox(item));
  }
}
