// 该文件是 Xiling （西岭） 项目的一部分。
// src/postprocess/binder.rs - 模型输出绑定
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  model::{ConfigError, MAX_NUM_BOXES, ModelConfig, PostProcessMode, SplitHead},
  postprocess::decode::{
    BoundLayer, ChannelLayout, ConsolidatedOutput, DecodeStrategy, PlanarTensor, PointGrid,
    SplitHeadOutput,
  },
  tensor::{DataType, TensorInfo},
};

#[derive(Error, Debug)]
pub enum BindError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("运行时没有名为 {0} 的输出张量")]
  MissingOutput(String),
  #[error("输出张量数量不匹配: 配置了 {matched} 个检测层, 运行时有 {outputs} 个输出")]
  TensorCountMismatch { matched: usize, outputs: usize },
  #[error("输出张量 {name} 维度不匹配: 期望 {expected}, 实际 {actual}")]
  RankMismatch {
    name: String,
    expected: &'static str,
    actual: usize,
  },
  #[error("输出张量 {name} 网格不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  GridMismatch {
    name: String,
    expected: (usize, usize),
    actual: (usize, usize),
  },
  #[error("输出张量 {name} 通道数不足: 需要 {required}, 实际 {actual}")]
  TooFewChannels {
    name: String,
    required: usize,
    actual: usize,
  },
  #[error("输出张量 {name} 数据类型不支持: {data_type:?}")]
  UnsupportedDataType { name: String, data_type: DataType },
  #[error("输出张量 {0} 不包含任何候选")]
  EmptyOutput(String),
  #[error("输出张量 {name} 锚点数不匹配: 期望 {expected}, 实际 {actual}")]
  PointCountMismatch {
    name: String,
    expected: usize,
    actual: usize,
  },
}

/// 绑定结果，加载后只读
#[derive(Debug, Clone)]
pub struct Binding {
  pub num_boxes: usize,
  pub layout: ChannelLayout,
  pub strategy: DecodeStrategy,
}

/// 把配置与运行时的输出张量列表对齐
///
/// 若存在与合并输出同名的张量则进入合并模式，否则每个检测层（或拆分头的
/// 两个张量）必须按名称匹配互不相同的张量，且覆盖运行时的全部输出。
pub fn bind(config: &ModelConfig, outputs: &[TensorInfo]) -> Result<Binding, BindError> {
  let declared = config.validate()?;
  let layout = ChannelLayout::for_mode(config.mode, config.num_classes);

  for (i, info) in outputs.iter().enumerate() {
    debug!("输出张量 {}: {} {:?} {:?}", i, info.name, info.shape, info.data_type);
  }

  if config.is_consolidated() {
    if let Some((index, info)) = outputs
      .iter()
      .enumerate()
      .find(|(_, info)| info.name == config.consolidated_output)
    {
      return bind_consolidated(config, declared, layout, index, info);
    }
    if !config.has_layered_outputs() {
      return Err(BindError::MissingOutput(config.consolidated_output.clone()));
    }
    warn!(
      "未找到合并输出 {}, 回退到分层模式",
      config.consolidated_output
    );
  }

  match (&config.split_head, config.mode) {
    (Some(head), PostProcessMode::AnchorFree) => {
      bind_split_head(config, declared, layout, head, outputs)
    }
    _ => bind_layers(config, declared, layout, outputs),
  }
}

fn bind_consolidated(
  config: &ModelConfig,
  declared: usize,
  layout: ChannelLayout,
  index: usize,
  info: &TensorInfo,
) -> Result<Binding, BindError> {
  check_data_type(info)?;

  let shape = &info.shape;
  if !(2..=3).contains(&shape.len()) {
    return Err(BindError::RankMismatch {
      name: info.name.clone(),
      expected: "2 或 3",
      actual: shape.len(),
    });
  }

  let transposed = config.mode == PostProcessMode::AnchorFree;
  let (inner, outer) = (shape[shape.len() - 1], shape[shape.len() - 2]);
  let (rows, pitch) = if transposed {
    (inner, outer)
  } else {
    (outer, inner)
  };

  if rows == 0 {
    return Err(BindError::EmptyOutput(info.name.clone()));
  }
  if rows >= MAX_NUM_BOXES {
    return Err(ConfigError::TooManyBoxes(rows).into());
  }
  if pitch < layout.pitch {
    return Err(BindError::TooFewChannels {
      name: info.name.clone(),
      required: layout.pitch,
      actual: pitch,
    });
  }
  if pitch > layout.pitch {
    info!("输出张量 {} 有额外通道: {} > {}", info.name, pitch, layout.pitch);
  }
  if declared > 0 && declared != rows {
    info!("候选框数量由输出形状决定: {} -> {}", declared, rows);
  }
  if !config.layers.is_empty() {
    debug!("合并输出模式忽略 {} 个检测层定义", config.layers.len());
  }

  info!(
    "绑定合并输出 {} (索引 {}), 候选 {}, 通道 {}, 转置 {}",
    info.name, index, rows, pitch, transposed
  );

  Ok(Binding {
    num_boxes: rows,
    layout,
    strategy: DecodeStrategy::Consolidated(ConsolidatedOutput {
      tensor_index: index,
      shape: shape.clone(),
      transposed,
      rows,
      pitch,
    }),
  })
}

fn bind_layers(
  config: &ModelConfig,
  declared: usize,
  layout: ChannelLayout,
  outputs: &[TensorInfo],
) -> Result<Binding, BindError> {
  let mut bound = Vec::with_capacity(config.layers.len());
  let mut used = HashSet::new();
  let mut slot_offset = 0;

  for spec in &config.layers {
    let (index, info) = find_output(outputs, &spec.name)?;
    used.insert(index);

    check_data_type(info)?;
    let shape = &info.shape;
    if shape.len() != 4 {
      return Err(BindError::RankMismatch {
        name: info.name.clone(),
        expected: "4",
        actual: shape.len(),
      });
    }

    let (grid_h, grid_w, channels) = (shape[1], shape[2], shape[3]);
    if (grid_w, grid_h) != (spec.grid_w, spec.grid_h) {
      return Err(BindError::GridMismatch {
        name: info.name.clone(),
        expected: (spec.grid_w, spec.grid_h),
        actual: (grid_w, grid_h),
      });
    }

    let required = spec.num_anchors() * layout.pitch;
    if channels < required {
      return Err(BindError::TooFewChannels {
        name: info.name.clone(),
        required,
        actual: channels,
      });
    }
    if channels > required {
      info!("输出张量 {} 有额外通道: {} > {}", info.name, channels, required);
    }

    debug!(
      "检测层 {} 绑定到张量 {}, 网格 {}x{}, 槽位起点 {}",
      spec.name, index, grid_w, grid_h, slot_offset
    );
    bound.push(BoundLayer {
      spec: spec.clone(),
      tensor_index: index,
      shape: shape.clone(),
      channels,
      slot_offset,
    });
    slot_offset += spec.slot_count();
  }

  check_coverage(&used, outputs)?;

  info!("分层模式绑定完成: {} 个检测层, 候选 {}", bound.len(), declared);
  Ok(Binding {
    num_boxes: declared,
    layout,
    strategy: DecodeStrategy::Anchor(bound),
  })
}

fn bind_split_head(
  config: &ModelConfig,
  declared: usize,
  layout: ChannelLayout,
  head: &SplitHead,
  outputs: &[TensorInfo],
) -> Result<Binding, BindError> {
  let points = head.point_count(config.input_width, config.input_height);
  let scores = bind_planar(outputs, &head.scores, points, config.num_classes)?;
  let boxes = bind_planar(outputs, &head.boxes, points, 4)?;
  check_coverage(&HashSet::from([scores.tensor_index, boxes.tensor_index]), outputs)?;

  let mut slot_offset = 0;
  let grids = head
    .grids(config.input_width, config.input_height)
    .map(|(stride, grid_w, grid_h)| {
      let grid = PointGrid {
        stride: stride as f32,
        grid_w,
        grid_h,
        slot_offset,
      };
      slot_offset += grid_w * grid_h;
      grid
    })
    .collect();

  info!(
    "拆分头绑定完成: 得分 {} (索引 {}), 框 {} (索引 {}), 锚点 {}",
    head.scores, scores.tensor_index, head.boxes, boxes.tensor_index, points
  );
  Ok(Binding {
    num_boxes: declared,
    layout,
    strategy: DecodeStrategy::SplitHead(SplitHeadOutput {
      scores,
      boxes,
      grids,
      points,
    }),
  })
}

/// 按 [.., 通道, 锚点] 解释张量：最后一维是锚点，其余维度的乘积是通道数
fn bind_planar(
  outputs: &[TensorInfo],
  name: &str,
  points: usize,
  required: usize,
) -> Result<PlanarTensor, BindError> {
  let (index, info) = find_output(outputs, name)?;
  check_data_type(info)?;

  let shape = &info.shape;
  if shape.len() < 2 {
    return Err(BindError::RankMismatch {
      name: info.name.clone(),
      expected: "至少 2",
      actual: shape.len(),
    });
  }
  let (last, rest) = (shape[shape.len() - 1], &shape[..shape.len() - 1]);
  if last != points {
    return Err(BindError::PointCountMismatch {
      name: info.name.clone(),
      expected: points,
      actual: last,
    });
  }
  let channels = rest.iter().product::<usize>();
  if channels < required {
    return Err(BindError::TooFewChannels {
      name: info.name.clone(),
      required,
      actual: channels,
    });
  }

  Ok(PlanarTensor {
    tensor_index: index,
    shape: shape.clone(),
    channels,
  })
}

fn find_output<'a>(
  outputs: &'a [TensorInfo],
  name: &str,
) -> Result<(usize, &'a TensorInfo), BindError> {
  outputs
    .iter()
    .enumerate()
    .find(|(_, info)| info.name == name)
    .ok_or_else(|| BindError::MissingOutput(name.to_string()))
}

/// 绑定的张量索引互不相同，且覆盖全部运行时输出
fn check_coverage(used: &HashSet<usize>, outputs: &[TensorInfo]) -> Result<(), BindError> {
  if used.len() != outputs.len() {
    return Err(BindError::TensorCountMismatch {
      matched: used.len(),
      outputs: outputs.len(),
    });
  }
  Ok(())
}

fn check_data_type(info: &TensorInfo) -> Result<(), BindError> {
  match info.data_type {
    DataType::Float32 | DataType::Float16 => Ok(()),
    other => Err(BindError::UnsupportedDataType {
      name: info.name.clone(),
      data_type: other,
    }),
  }
}
