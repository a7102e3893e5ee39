// 该文件是 Xiling （西岭） 项目的一部分。
// src/postprocess.rs - 检测后处理流水线
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

pub mod binder;
pub mod candidates;
pub mod decode;
pub mod letterbox;
pub mod nms;

use std::sync::Arc;

use tracing::debug;

pub use binder::{BindError, Binding, bind};
pub use candidates::{CandidateBuffers, CandidateIndex};
pub use decode::{ChannelLayout, DecodeError, DecodeStrategy};
pub use letterbox::Letterbox;

use crate::{
  frame::SourceSize,
  model::{BoundingBox, DetectResult, Keypoint, ModelConfig},
  tensor::{Tensor, TensorInfo},
};

/// 解码 → 排序 → NMS → 坐标还原
///
/// 每个加载好的模型对应一个实例，候选缓冲区在各帧之间复用。
/// 单帧处理是单线程的，调用方负责保证同一时刻只有一个 `process`。
#[derive(Debug)]
pub struct PostProcessor {
  config: Arc<ModelConfig>,
  binding: Binding,
  candidates: CandidateBuffers,
}

impl PostProcessor {
  pub fn new(config: Arc<ModelConfig>, outputs: &[TensorInfo]) -> Result<Self, BindError> {
    let binding = bind(&config, outputs)?;
    let candidates = CandidateBuffers::new(binding.num_boxes, config.num_classes);
    Ok(Self {
      config,
      binding,
      candidates,
    })
  }

  pub fn config(&self) -> &ModelConfig {
    &self.config
  }

  pub fn binding(&self) -> &Binding {
    &self.binding
  }

  pub fn num_boxes(&self) -> usize {
    self.candidates.num_boxes()
  }

  /// 完整处理一帧输出，返回原图坐标下的检测结果
  pub fn process(
    &mut self,
    tensors: &[Tensor],
    source: SourceSize,
  ) -> Result<DetectResult, DecodeError> {
    let letterbox = Letterbox::new(source, self.config.input_width, self.config.input_height)
      .ok_or(DecodeError::InvalidSourceSize {
        width: source.width,
        height: source.height,
      })?;

    let mut items = self.decode(tensors)?;
    letterbox.apply(&mut items);
    Ok(items.into())
  }

  /// 解码并做 NMS，坐标仍在模型输入空间
  pub fn decode(&mut self, tensors: &[Tensor]) -> Result<Vec<BoundingBox>, DecodeError> {
    self.candidates.clear();
    let accepted =
      self
        .binding
        .strategy
        .decode(tensors, &self.config, &self.binding.layout, &mut self.candidates)?;

    self.candidates.index_mut().sort_descending();
    let kept = nms::suppress(
      self.candidates.index(),
      self.candidates.boxes(),
      self.config.iou_threshold,
    );
    debug!("候选 {} 个, NMS 后保留 {} 个", accepted, kept.len());

    let keypoints = self.binding.layout.keypoints;
    let items = kept
      .into_iter()
      .map(|k| BoundingBox {
        class_id: k.class_id,
        class_name: self.config.class_name(k.class_id).to_string(),
        score: k.score,
        bbox: self.candidates.box_at(k.slot),
        keypoints: keypoints.map(|(_, layout)| {
          self.candidates.keypoints(k.slot)[..layout.count * 3]
            .chunks_exact(3)
            .map(|p| Keypoint {
              x: p[0],
              y: p[1],
              visibility: p[2],
            })
            .collect()
        }),
      })
      .collect();

    Ok(items)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{LayerSpec, PostProcessMode};

  fn pose_config() -> ModelConfig {
    ModelConfig {
      input_width: 64,
      input_height: 64,
      conf_threshold: 0.25,
      score_threshold: 0.25,
      iou_threshold: 0.45,
      num_boxes: None,
      num_classes: 1,
      consolidated_output: "output".into(),
      class_names: vec!["person".into()],
      mode: PostProcessMode::Pose,
      layers: Vec::<LayerSpec>::new(),
      split_head: None,
    }
  }

  #[test]
  fn pose_rows_carry_keypoints() {
    let config = Arc::new(pose_config());
    let pitch = 5 + 1 + 51;
    let mut row = vec![0.0f32; pitch];
    row[..6].copy_from_slice(&[32.0, 32.0, 10.0, 20.0, 0.9, 0.8]);
    for k in 0..17 {
      row[6 + k * 3] = k as f32;
      row[6 + k * 3 + 1] = 2.0 * k as f32;
      row[6 + k * 3 + 2] = 0.7;
    }
    let tensor = Tensor::from_f32("output", vec![1, 1, pitch], &row).unwrap();

    let mut processor = PostProcessor::new(config, &[tensor.info().clone()]).unwrap();
    let items = processor.decode(&[tensor]).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].bbox, [27.0, 22.0, 37.0, 42.0]);

    let keypoints = items[0].keypoints.as_ref().unwrap();
    assert_eq!(keypoints.len(), 17);
    assert_eq!((keypoints[16].x, keypoints[16].y), (16.0, 32.0));
    assert_eq!(keypoints[16].visibility, 0.7);
  }

  #[test]
  fn invalid_source_size_is_a_decode_error() {
    let config = Arc::new(pose_config());
    let tensor = Tensor::from_f32("output", vec![1, 1, 57], &[0.0; 57]).unwrap();
    let mut processor = PostProcessor::new(config, &[tensor.info().clone()]).unwrap();
    assert!(matches!(
      processor.process(&[tensor], SourceSize::new(0, 0)),
      Err(DecodeError::InvalidSourceSize { .. })
    ));
  }

  #[test]
  fn shape_change_after_binding_is_reported() {
    let config = Arc::new(pose_config());
    let bound = Tensor::from_f32("output", vec![1, 1, 57], &[0.0; 57]).unwrap();
    let mut processor = PostProcessor::new(config, &[bound.info().clone()]).unwrap();

    let changed = Tensor::from_f32("output", vec![1, 2, 57], &[0.0; 114]).unwrap();
    assert!(matches!(
      processor.decode(&[changed]),
      Err(DecodeError::ShapeChanged { .. })
    ));
  }
}
