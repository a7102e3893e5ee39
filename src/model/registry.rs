// 该文件是 Xiling （西岭） 项目的一部分。
// src/model/registry.rs - 内置模型配置与模型地址
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{fmt, path::PathBuf, str::FromStr};

use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{ConfigError, LayerSpec, ModelConfig, PostProcessMode},
};

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

const V5_ANCHORS: [[(f32, f32); 3]; 3] = [
  [(10.0, 13.0), (16.0, 30.0), (33.0, 23.0)],
  [(30.0, 61.0), (62.0, 45.0), (59.0, 119.0)],
  [(116.0, 90.0), (156.0, 198.0), (373.0, 326.0)],
];

const V7_ANCHORS: [[(f32, f32); 3]; 3] = [
  [(12.0, 16.0), (19.0, 36.0), (40.0, 28.0)],
  [(36.0, 75.0), (76.0, 55.0), (72.0, 146.0)],
  [(142.0, 110.0), (192.0, 243.0), (459.0, 401.0)],
];

const FACE_ANCHORS: [[(f32, f32); 3]; 3] = [
  [(4.0, 5.0), (8.0, 10.0), (13.0, 16.0)],
  [(23.0, 29.0), (43.0, 55.0), (73.0, 105.0)],
  [(146.0, 217.0), (231.0, 300.0), (335.0, 433.0)],
];

const HEAD_STRIDES: [u32; 3] = [8, 16, 32];

/// 内置模型配置标识
///
/// 数值索引沿用历史编号，默认为 2（yolov5s_640）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ModelId {
  Yolov5s320,
  Yolov5s512,
  #[default]
  Yolov5s640,
  Yolov7_512,
  Yolov7_640,
  Yolov8_640,
  YoloxS512,
  Yolov5sFace640,
  Yolov3_512,
  Yolov4_416,
  Yolov9_640,
}

impl ModelId {
  pub const ALL: [ModelId; 11] = [
    ModelId::Yolov5s320,
    ModelId::Yolov5s512,
    ModelId::Yolov5s640,
    ModelId::Yolov7_512,
    ModelId::Yolov7_640,
    ModelId::Yolov8_640,
    ModelId::YoloxS512,
    ModelId::Yolov5sFace640,
    ModelId::Yolov3_512,
    ModelId::Yolov4_416,
    ModelId::Yolov9_640,
  ];

  pub fn from_index(index: usize) -> Result<Self, ConfigError> {
    Self::ALL
      .get(index)
      .copied()
      .ok_or(ConfigError::IndexOutOfRange {
        index,
        max: Self::ALL.len() - 1,
      })
  }

  pub fn index(self) -> usize {
    Self::ALL.iter().position(|id| *id == self).unwrap_or_default()
  }

  pub fn name(self) -> &'static str {
    match self {
      ModelId::Yolov5s320 => "yolov5s_320",
      ModelId::Yolov5s512 => "yolov5s_512",
      ModelId::Yolov5s640 => "yolov5s_640",
      ModelId::Yolov7_512 => "yolov7_512",
      ModelId::Yolov7_640 => "yolov7_640",
      ModelId::Yolov8_640 => "yolov8_640",
      ModelId::YoloxS512 => "yolox_s_512",
      ModelId::Yolov5sFace640 => "yolov5s_face_640",
      ModelId::Yolov3_512 => "yolov3_512",
      ModelId::Yolov4_416 => "yolov4_416",
      ModelId::Yolov9_640 => "yolov9_640",
    }
  }

  /// 生成该模型的后处理配置
  pub fn config(self) -> ModelConfig {
    match self {
      ModelId::Yolov5s320 => anchor_config(320, "/model.24/m", &V5_ANCHORS, &[0.0; 3]),
      ModelId::Yolov5s512 => anchor_config(512, "/model.24/m", &V5_ANCHORS, &[0.0; 3]),
      ModelId::Yolov5s640 => anchor_config(640, "/model.24/m", &V5_ANCHORS, &[0.0; 3]),
      ModelId::Yolov7_512 => anchor_config(512, "/model.105/m", &V7_ANCHORS, &[0.0; 3]),
      ModelId::Yolov7_640 => anchor_config(640, "/model.105/m", &V7_ANCHORS, &[0.0; 3]),
      ModelId::Yolov3_512 => anchor_config(512, "/model.28/m", &V5_ANCHORS, &[0.0; 3]),
      ModelId::Yolov4_416 => anchor_config(416, "/model.161/m", &V7_ANCHORS, &[1.2, 1.1, 1.05]),
      ModelId::Yolov8_640 | ModelId::Yolov9_640 => ModelConfig {
        consolidated_output: "output0".to_string(),
        mode: PostProcessMode::AnchorFree,
        ..coco_base(640)
      },
      ModelId::YoloxS512 => ModelConfig {
        consolidated_output: "output".to_string(),
        ..coco_base(512)
      },
      ModelId::Yolov5sFace640 => {
        let mut config = anchor_config(640, "/model.24/m", &FACE_ANCHORS, &[0.0; 3]);
        config.num_classes = 1;
        config.class_names = vec!["face".to_string()];
        config.mode = PostProcessMode::Face;
        config
      }
    }
  }
}

impl fmt::Display for ModelId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for ModelId {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Ok(index) = s.parse::<usize>() {
      return Self::from_index(index);
    }
    Self::ALL
      .iter()
      .copied()
      .find(|id| id.name().eq_ignore_ascii_case(s))
      .ok_or_else(|| ConfigError::UnknownModel(s.to_string()))
  }
}

fn coco_base(size: u32) -> ModelConfig {
  ModelConfig {
    input_width: size,
    input_height: size,
    conf_threshold: 0.25,
    score_threshold: 0.3,
    iou_threshold: 0.4,
    num_boxes: None,
    num_classes: COCO_CLASSES.len(),
    consolidated_output: String::new(),
    class_names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
    mode: PostProcessMode::Detection,
    layers: Vec::new(),
    split_head: None,
  }
}

fn anchor_config(
  size: u32,
  prefix: &str,
  anchors: &[[(f32, f32); 3]; 3],
  scales: &[f32; 3],
) -> ModelConfig {
  let layers = HEAD_STRIDES
    .iter()
    .zip(anchors)
    .zip(scales)
    .enumerate()
    .map(|(i, ((stride, anchors), scale))| {
      let grid = (size / stride) as usize;
      LayerSpec::new(format!("{prefix}.{i}/Conv_output_0"), grid, grid, anchors)
        .with_scale(*scale, *scale)
    })
    .collect();

  ModelConfig {
    layers,
    ..coco_base(size)
  }
}

/// 模型来源：模型文件路径加后处理配置
///
/// 地址形如 `yolo:///path/model.dxnn?config=yolov5s_640&conf=0.3&iou=0.45`，
/// `config` 也可以是 JSON 配置文件路径。
#[derive(Debug, Clone)]
pub struct ModelSource {
  pub model_path: PathBuf,
  pub config: ModelConfig,
}

impl FromUrlWithScheme for ModelSource {
  const SCHEME: &'static str = "yolo";
}

impl FromUrl for ModelSource {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigError::InvalidSource(format!(
        "模型地址必须使用 {} 方案, 实际为 {}",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let mut config = None;
    let mut conf = None;
    let mut score = None;
    let mut iou = None;
    for (key, value) in url.query_pairs() {
      match &*key {
        "config" => {
          config = Some(if value.ends_with(".json") {
            ModelConfig::from_json_file(&*value)?
          } else {
            value.parse::<ModelId>()?.config()
          })
        }
        "conf" => conf = Some(parse_threshold("conf", &value)?),
        "score" => score = Some(parse_threshold("score", &value)?),
        "iou" => iou = Some(parse_threshold("iou", &value)?),
        other => debug!("忽略未知的模型参数: {}", other),
      }
    }

    let mut config = config.unwrap_or_else(|| ModelId::default().config());
    if let Some(t) = conf {
      config = config.with_conf_threshold(t);
    }
    if let Some(t) = score {
      config = config.with_score_threshold(t);
    }
    if let Some(t) = iou {
      config = config.with_iou_threshold(t);
    }
    config.validate()?;

    let model_path = PathBuf::from(url.path());
    info!("模型来源: {}", model_path.display());
    Ok(ModelSource { model_path, config })
  }
}

fn parse_threshold(name: &str, value: &str) -> Result<f32, ConfigError> {
  value
    .parse::<f32>()
    .map_err(|_| ConfigError::InvalidSource(format!("参数 {name} 不是有效数字: {value}")))
}
