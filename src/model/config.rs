// 该文件是 Xiling （西岭） 项目的一部分。
// src/model/config.rs - 模型后处理配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{collections::HashSet, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{LayerSpec, SplitHead};

/// 候选槽位数量上限，超过即视为配置错误
pub const MAX_NUM_BOXES: usize = 100_000;

/// 每个候选槽位的关键点缓冲区长度（17 个关键点 × 3）
pub const KEYPOINT_STRIDE: usize = 51;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("阈值 {name} 无效: {value}")]
  InvalidThreshold { name: &'static str, value: f32 },
  #[error("模型输入尺寸无效: {width}x{height}")]
  InvalidInputSize { width: u32, height: u32 },
  #[error("类别数量为 0")]
  NoClasses,
  #[error("类别名称数量不匹配: 期望 {expected}, 实际 {actual}")]
  ClassNamesMismatch { expected: usize, actual: usize },
  #[error("检测层 {name} 无效: {reason}")]
  InvalidLayer { name: String, reason: String },
  #[error("检测层名称重复: {0}")]
  DuplicateLayer(String),
  #[error("拆分头配置无效: {0}")]
  InvalidSplitHead(String),
  #[error("候选框数量过大: {0}，请检查配置")]
  TooManyBoxes(usize),
  #[error("声明的候选框数量 {declared} 小于检测层所需的 {required}")]
  TooFewBoxes { declared: usize, required: usize },
  #[error("既没有检测层也没有合并输出名称")]
  NoOutputs,
  #[error("无锚框模式需要合并输出张量名称或拆分头配置")]
  AnchorFreeNeedsOutput,
  #[error("未知的模型配置: {0}")]
  UnknownModel(String),
  #[error("模型配置索引 {index} 越界，有效范围: 0-{max}")]
  IndexOutOfRange { index: usize, max: usize },
  #[error("模型地址无效: {0}")]
  InvalidSource(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("配置解析错误: {0}")]
  Json(#[from] serde_json::Error),
}

/// 关键点通道布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeypointLayout {
  pub count: usize,
  /// 每个关键点在张量中占用的通道数（2 表示没有可见度通道）
  pub dims: usize,
}

impl KeypointLayout {
  pub const POSE: KeypointLayout = KeypointLayout { count: 17, dims: 3 };
  pub const FACE: KeypointLayout = KeypointLayout { count: 5, dims: 2 };

  pub fn channels(&self) -> usize {
    self.count * self.dims
  }
}

/// 后处理模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessMode {
  #[default]
  Detection,
  Pose,
  Face,
  AnchorFree,
}

impl PostProcessMode {
  pub fn keypoints(self) -> Option<KeypointLayout> {
    match self {
      PostProcessMode::Pose => Some(KeypointLayout::POSE),
      PostProcessMode::Face => Some(KeypointLayout::FACE),
      PostProcessMode::Detection | PostProcessMode::AnchorFree => None,
    }
  }
}

/// 模型后处理配置，加载模型时创建一次，之后只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
  pub input_width: u32,
  pub input_height: u32,
  pub conf_threshold: f32,
  pub score_threshold: f32,
  pub iou_threshold: f32,
  /// 候选槽位总数，缺省或 0 时由检测层自动计算
  #[serde(default)]
  pub num_boxes: Option<usize>,
  pub num_classes: usize,
  /// 合并输出张量名称，为空表示分层模式
  #[serde(default)]
  pub consolidated_output: String,
  pub class_names: Vec<String>,
  #[serde(default)]
  pub mode: PostProcessMode,
  #[serde(default)]
  pub layers: Vec<LayerSpec>,
  /// 无锚框模式下得分与框分开输出时的张量描述
  #[serde(default)]
  pub split_head: Option<SplitHead>,
}

impl ModelConfig {
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: ModelConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("读取模型配置文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    Self::from_json_str(&text)
  }

  pub fn with_conf_threshold(mut self, threshold: f32) -> Self {
    self.conf_threshold = threshold;
    self
  }

  pub fn with_score_threshold(mut self, threshold: f32) -> Self {
    self.score_threshold = threshold;
    self
  }

  pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
    self.iou_threshold = threshold;
    self
  }

  pub fn is_consolidated(&self) -> bool {
    !self.consolidated_output.is_empty()
  }

  /// 分层模式下的槽位总数：检测层槽位之和，或拆分头的锚点总数
  pub fn layered_box_count(&self) -> usize {
    match &self.split_head {
      Some(head) => head.point_count(self.input_width, self.input_height),
      None => self.layers.iter().map(LayerSpec::slot_count).sum(),
    }
  }

  /// 是否存在可供回退的分层输出
  pub fn has_layered_outputs(&self) -> bool {
    match self.mode {
      PostProcessMode::AnchorFree => self.split_head.is_some(),
      _ => !self.layers.is_empty(),
    }
  }

  pub fn class_name(&self, class_id: usize) -> &str {
    self
      .class_names
      .get(class_id)
      .map(String::as_str)
      .unwrap_or("unknown")
  }

  /// 检查配置并返回解析后的候选槽位数
  ///
  /// 合并输出模式下若未声明数量则返回 0，真实数量由输出绑定阶段确定。
  pub fn validate(&self) -> Result<usize, ConfigError> {
    if self.input_width == 0 || self.input_height == 0 {
      return Err(ConfigError::InvalidInputSize {
        width: self.input_width,
        height: self.input_height,
      });
    }

    check_unit("conf_threshold", self.conf_threshold, false)?;
    check_unit("score_threshold", self.score_threshold, false)?;
    check_unit("iou_threshold", self.iou_threshold, true)?;

    if self.num_classes == 0 {
      return Err(ConfigError::NoClasses);
    }
    if self.class_names.len() != self.num_classes {
      return Err(ConfigError::ClassNamesMismatch {
        expected: self.num_classes,
        actual: self.class_names.len(),
      });
    }

    if let Some(head) = &self.split_head {
      self.validate_split_head(head)?;
    }
    if self.mode == PostProcessMode::AnchorFree
      && !self.is_consolidated()
      && self.split_head.is_none()
    {
      return Err(ConfigError::AnchorFreeNeedsOutput);
    }
    if !self.has_layered_outputs() && !self.is_consolidated() {
      return Err(ConfigError::NoOutputs);
    }

    let mut names = HashSet::new();
    for layer in &self.layers {
      validate_layer(layer)?;
      if !names.insert(layer.name.as_str()) {
        return Err(ConfigError::DuplicateLayer(layer.name.clone()));
      }
    }

    let layered = self.layered_box_count();
    let num_boxes = match self.num_boxes {
      Some(n) if n > 0 => {
        if !self.is_consolidated() && n < layered {
          return Err(ConfigError::TooFewBoxes {
            declared: n,
            required: layered,
          });
        }
        n
      }
      _ if layered > 0 => {
        debug!("自动计算候选框数量: {}", layered);
        layered
      }
      _ => {
        warn!("未设置候选框数量，将由合并输出张量形状决定");
        0
      }
    };

    if num_boxes >= MAX_NUM_BOXES {
      return Err(ConfigError::TooManyBoxes(num_boxes));
    }

    Ok(num_boxes)
  }

  fn validate_split_head(&self, head: &SplitHead) -> Result<(), ConfigError> {
    let invalid = |reason: &str| -> Result<(), ConfigError> {
      Err(ConfigError::InvalidSplitHead(reason.to_string()))
    };

    if self.mode != PostProcessMode::AnchorFree {
      return invalid("只能用于无锚框模式");
    }
    if !self.layers.is_empty() {
      return invalid("不能同时配置检测层");
    }
    if head.scores.is_empty() || head.boxes.is_empty() {
      return invalid("张量名称为空");
    }
    if head.scores == head.boxes {
      return invalid("得分与框使用了同一个张量");
    }
    if head.strides.is_empty() || head.strides.contains(&0) {
      return invalid("步长为空或为 0");
    }
    for (stride, grid_w, grid_h) in head.grids(self.input_width, self.input_height) {
      if grid_w == 0 || grid_h == 0 {
        return invalid(&format!("步长 {stride} 超出输入尺寸"));
      }
    }
    Ok(())
  }
}

fn check_unit(name: &'static str, value: f32, inclusive: bool) -> Result<(), ConfigError> {
  let upper_ok = if inclusive { value <= 1.0 } else { value < 1.0 };
  if value.is_finite() && value >= 0.0 && upper_ok {
    Ok(())
  } else {
    Err(ConfigError::InvalidThreshold { name, value })
  }
}

fn validate_layer(layer: &LayerSpec) -> Result<(), ConfigError> {
  let invalid = |reason: &str| ConfigError::InvalidLayer {
    name: layer.name.clone(),
    reason: reason.to_string(),
  };

  if layer.name.is_empty() {
    return Err(invalid("名称为空"));
  }
  if layer.grid_w == 0 || layer.grid_h == 0 {
    return Err(invalid("网格尺寸为 0"));
  }
  if layer.anchor_w.is_empty() {
    return Err(invalid("没有锚框"));
  }
  if layer.anchor_w.len() != layer.anchor_h.len() {
    return Err(invalid("锚框宽高数量不一致"));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn two_class_config() -> ModelConfig {
    ModelConfig {
      input_width: 640,
      input_height: 640,
      conf_threshold: 0.25,
      score_threshold: 0.3,
      iou_threshold: 0.45,
      num_boxes: None,
      num_classes: 2,
      consolidated_output: String::new(),
      class_names: vec!["cat".into(), "dog".into()],
      mode: PostProcessMode::Detection,
      layers: vec![
        LayerSpec::new("p3", 4, 4, &[(10.0, 13.0), (16.0, 30.0)]),
        LayerSpec::new("p4", 2, 2, &[(30.0, 61.0), (62.0, 45.0)]),
      ],
      split_head: None,
    }
  }

  #[test]
  fn box_count_is_summed_from_layers() {
    assert_eq!(two_class_config().validate().unwrap(), 4 * 4 * 2 + 2 * 2 * 2);
  }

  #[test]
  fn declared_count_smaller_than_layers_is_rejected() {
    let mut config = two_class_config();
    config.num_boxes = Some(10);
    assert!(matches!(
      config.validate(),
      Err(ConfigError::TooFewBoxes {
        declared: 10,
        required: 40
      })
    ));
  }

  #[test]
  fn runaway_box_count_is_fatal() {
    let mut config = two_class_config();
    config.layers = vec![LayerSpec::new("huge", 400, 400, &[(1.0, 1.0)])];
    assert!(matches!(
      config.validate(),
      Err(ConfigError::TooManyBoxes(160_000))
    ));
  }

  #[test]
  fn class_names_must_match_class_count() {
    let mut config = two_class_config();
    config.class_names.pop();
    assert!(matches!(
      config.validate(),
      Err(ConfigError::ClassNamesMismatch {
        expected: 2,
        actual: 1
      })
    ));
  }

  #[test]
  fn thresholds_are_range_checked() {
    let config = two_class_config().with_conf_threshold(1.0);
    assert!(matches!(
      config.validate(),
      Err(ConfigError::InvalidThreshold {
        name: "conf_threshold",
        ..
      })
    ));
    let config = two_class_config().with_iou_threshold(f32::NAN);
    assert!(config.validate().is_err());
  }

  #[test]
  fn anchor_free_requires_consolidated_output_or_split_head() {
    let mut config = two_class_config();
    config.mode = PostProcessMode::AnchorFree;
    assert!(matches!(
      config.validate(),
      Err(ConfigError::AnchorFreeNeedsOutput)
    ));
  }

  #[test]
  fn duplicate_layer_names_are_rejected() {
    let mut config = two_class_config();
    config.layers[1].name = "p3".into();
    assert!(matches!(
      config.validate(),
      Err(ConfigError::DuplicateLayer(name)) if name == "p3"
    ));
  }

  #[test]
  fn split_head_counts_points_of_every_stride() {
    let mut config = two_class_config();
    config.layers.clear();
    config.mode = PostProcessMode::AnchorFree;
    config.split_head = Some(SplitHead::new("scores", "boxes"));
    assert_eq!(config.validate().unwrap(), 80 * 80 + 40 * 40 + 20 * 20);

    config.split_head = Some(SplitHead::new("scores", "boxes").with_strides(&[8, 1024]));
    assert!(matches!(
      config.validate(),
      Err(ConfigError::InvalidSplitHead(_))
    ));

    config.split_head = Some(SplitHead::new("out", "out"));
    assert!(matches!(
      config.validate(),
      Err(ConfigError::InvalidSplitHead(_))
    ));
  }

  #[test]
  fn split_head_needs_anchor_free_mode() {
    let mut config = two_class_config();
    config.layers.clear();
    config.split_head = Some(SplitHead::new("scores", "boxes"));
    assert!(matches!(
      config.validate(),
      Err(ConfigError::InvalidSplitHead(_))
    ));
  }

  #[test]
  fn consolidated_without_count_defers_to_binding() {
    let mut config = two_class_config();
    config.layers.clear();
    config.consolidated_output = "output0".into();
    assert_eq!(config.validate().unwrap(), 0);
  }

  #[test]
  fn json_config_is_parsed_and_validated() {
    let config = ModelConfig::from_json_str(
      r#"{
        "input_width": 320, "input_height": 320,
        "conf_threshold": 0.3, "score_threshold": 0.3, "iou_threshold": 0.5,
        "num_classes": 1, "class_names": ["face"], "mode": "face",
        "layers": [{"name":"p3","grid_w":40,"grid_h":40,"anchor_w":[4.0],"anchor_h":[5.0]}]
      }"#,
    )
    .unwrap();
    assert_eq!(config.mode, PostProcessMode::Face);
    assert_eq!(config.mode.keypoints(), Some(KeypointLayout::FACE));
    assert!(!config.is_consolidated());
  }
}
