// 该文件是 Xiling （西岭） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size,
  },
  rect::Rect,
};
use thiserror::Error;
use tracing::info;

use crate::model::{BoundingBox, DetectResult};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const KEYPOINT_RADIUS: i32 = 3;
const KEYPOINT_MIN_VISIBILITY: f32 = 0.5;

const PALETTE: [[u8; 3]; 8] = [
  [0, 0, 255],
  [255, 56, 56],
  [72, 249, 10],
  [255, 157, 151],
  [0, 194, 255],
  [255, 178, 29],
  [146, 204, 23],
  [132, 56, 255],
];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("字体文件读取失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 在原图上绘制检测框、标签和关键点
///
/// 没有加载字体时只画框和关键点。
pub struct Draw {
  font: Option<FontVec>,
  font_size: f32,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font: None,
      font_size: LABEL_FONT_SIZE,
    }
  }
}

impl Draw {
  pub fn with_font_file(mut self, path: impl AsRef<Path>) -> Result<Self, DrawError> {
    let path = path.as_ref();
    info!("加载字体: {}", path.display());
    let data = std::fs::read(path)?;
    self.font = Some(FontVec::try_from_vec(data)?);
    Ok(self)
  }

  pub fn with_font_size(mut self, font_size: f32) -> Self {
    self.font_size = font_size;
    self
  }

  pub fn class_color(class_id: usize) -> [u8; 3] {
    PALETTE[class_id % PALETTE.len()]
  }

  pub fn draw_detections(&self, image: &mut RgbImage, result: &DetectResult) {
    for item in result.iter() {
      self.draw_item(image, item);
    }
  }

  fn draw_item(&self, image: &mut RgbImage, item: &BoundingBox) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }
    let color = Rgb(Self::class_color(item.class_id));

    let x_min = (item.bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (item.bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (item.bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (item.bbox[3].ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    for t in 0..BOX_THICKNESS {
      let (bw, bh) = (x_max - x_min - 2 * t, y_max - y_min - 2 * t);
      if bw <= 0 || bh <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(bw as u32, bh as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    if let Some(keypoints) = item.keypoints.as_deref() {
      for kp in keypoints.iter().filter(|kp| kp.visibility >= KEYPOINT_MIN_VISIBILITY) {
        draw_filled_circle_mut(image, (kp.x as i32, kp.y as i32), KEYPOINT_RADIUS, color);
      }
    }

    let Some(font) = self.font.as_ref() else {
      return;
    };
    let label = format!("{} {:.2}", item.class_name, item.score);
    let scale = PxScale::from(self.font_size);
    let (text_w, text_h) = text_size(scale, font, &label);
    let label_h = text_h as i32 + 2 * LABEL_TEXT_VERTICAL_PADDING;
    let label_y = (y_min - label_h).max(0);
    let label_w = (text_w as i32).min(w - x_min);
    if label_w <= 0 {
      return;
    }

    let background = Rect::at(x_min, label_y).of_size(label_w as u32, label_h as u32);
    draw_filled_rect_mut(image, background, color);
    draw_text_mut(
      image,
      Rgb([255u8, 255, 255]),
      x_min,
      label_y + LABEL_TEXT_VERTICAL_PADDING,
      scale,
      font,
      &label,
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn box_outline_uses_class_color() {
    let mut image = RgbImage::new(32, 32);
    let result: DetectResult = vec![BoundingBox {
      class_id: 1,
      class_name: "bicycle".into(),
      score: 0.9,
      bbox: [4.0, 4.0, 20.0, 20.0],
      keypoints: None,
    }]
    .into();

    Draw::default().draw_detections(&mut image, &result);
    assert_eq!(image.get_pixel(4, 10).0, Draw::class_color(1));
    assert_eq!(image.get_pixel(12, 12).0, [0, 0, 0]);
  }

  #[test]
  fn degenerate_box_is_skipped() {
    let mut image = RgbImage::new(8, 8);
    let result: DetectResult = vec![BoundingBox {
      class_id: 0,
      class_name: "person".into(),
      score: 0.9,
      bbox: [5.0, 5.0, 5.0, 5.0],
      keypoints: None,
    }]
    .into();
    Draw::default().draw_detections(&mut image, &result);
    assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
  }
}
