// 该文件是 Xiling （西岭） 项目的一部分。
// src/runtime/replay.rs - 回放已记录的输出张量
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

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use super::{CompletionCallback, InferenceRuntime, RuntimeError, RuntimeLoader, WorkerRuntime};
use crate::{
  frame::SourceSize,
  tensor::{DataType, Tensor, TensorInfo},
};

/// 清单中的一个张量：原始字节保存在单独的文件中
#[derive(Debug, Clone, Deserialize)]
pub struct TensorRecord {
  pub name: String,
  pub shape: Vec<usize>,
  pub data_type: DataType,
  /// 相对于清单文件所在目录
  pub file: PathBuf,
}

/// 回放清单
///
/// ```json
/// {
///   "source": { "width": 1920, "height": 1080 },
///   "tensors": [
///     { "name": "output0", "shape": [1, 84, 8400], "data_type": "float32", "file": "output0.bin" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
  #[serde(default)]
  pub source: Option<SourceSize>,
  pub tensors: Vec<TensorRecord>,
}

impl Manifest {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
  }

  pub fn load_tensors(&self, base_dir: &Path) -> Result<Vec<Tensor>, RuntimeError> {
    self
      .tensors
      .iter()
      .map(|record| -> Result<Tensor, RuntimeError> {
        let path = base_dir.join(&record.file);
        info!("读取张量 {}: {}", record.name, path.display());
        let data = std::fs::read(&path)?;
        let info = TensorInfo::new(&record.name, record.shape.clone(), record.data_type);
        Ok(Tensor::new(info, data)?)
      })
      .collect()
  }
}

/// 循环回放预先记录的输出，忽略输入帧内容
pub struct ReplayRuntime {
  worker: WorkerRuntime,
}

impl ReplayRuntime {
  pub fn new(frames: Vec<Vec<Tensor>>) -> Result<Self, RuntimeError> {
    let first = frames
      .first()
      .ok_or_else(|| RuntimeError::Load("回放数据为空".into()))?;
    let outputs = first.iter().map(|t| t.info().clone()).collect();

    let mut cursor = 0;
    let worker = WorkerRuntime::spawn(outputs, move |_input| {
      let tensors = frames[cursor % frames.len()].clone();
      cursor += 1;
      Ok(tensors)
    })?;
    Ok(Self { worker })
  }
}

impl InferenceRuntime for ReplayRuntime {
  fn outputs(&self) -> Vec<TensorInfo> {
    self.worker.outputs()
  }

  fn run_async(
    &self,
    input: Box<[u8]>,
    on_complete: CompletionCallback,
  ) -> Result<(), RuntimeError> {
    self.worker.run_async(input, on_complete)
  }
}

/// 把“模型路径”解释为回放清单路径
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayLoader;

impl RuntimeLoader for ReplayLoader {
  type Runtime = ReplayRuntime;

  fn load(&self, model_path: &Path) -> Result<ReplayRuntime, RuntimeError> {
    let manifest = Manifest::from_file(model_path)?;
    let base_dir = model_path.parent().unwrap_or_else(|| Path::new("."));
    let tensors = manifest.load_tensors(base_dir)?;
    ReplayRuntime::new(vec![tensors])
  }
}

#[cfg(test)]
mod tests {
  use std::sync::mpsc;

  use super::*;

  #[test]
  fn replay_cycles_through_frames() {
    let frames = vec![
      vec![Tensor::from_f32("out", vec![1], &[1.0]).unwrap()],
      vec![Tensor::from_f32("out", vec![1], &[2.0]).unwrap()],
    ];
    let runtime = ReplayRuntime::new(frames).unwrap();
    assert_eq!(runtime.outputs()[0].name, "out");

    let (tx, rx) = mpsc::channel();
    for _ in 0..3 {
      let tx = tx.clone();
      runtime
        .run_async(
          Box::new([]),
          Box::new(move |result| {
            tx.send(result.unwrap()[0].to_f32().unwrap()[0]).unwrap();
          }),
        )
        .unwrap();
    }
    let seen: Vec<f32> = (0..3).map(|_| rx.recv().unwrap()).collect();
    assert_eq!(seen, vec![1.0, 2.0, 1.0]);
  }

  #[test]
  fn empty_replay_is_a_load_error() {
    assert!(matches!(
      ReplayRuntime::new(Vec::new()),
      Err(RuntimeError::Load(_))
    ));
  }

  #[test]
  fn manifest_parses_source_and_records() {
    let manifest: Manifest = serde_json::from_str(
      r#"{
        "source": {"width": 1280, "height": 720},
        "tensors": [{"name": "output", "shape": [1, 10, 7], "data_type": "float16", "file": "o.bin"}]
      }"#,
    )
    .unwrap();
    assert_eq!(manifest.source, Some(SourceSize::new(1280, 720)));
    assert_eq!(manifest.tensors[0].data_type, DataType::Float16);
  }
}
