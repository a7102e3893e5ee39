// 该文件是 Xiling （西岭） 项目的一部分。
// src/runtime.rs - 推理运行时接口
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

use std::path::Path;

use thiserror::Error;

use crate::tensor::{Tensor, TensorError, TensorInfo};

mod replay;
mod worker;

pub use self::replay::{Manifest, ReplayLoader, ReplayRuntime, TensorRecord};
pub use self::worker::WorkerRuntime;

#[derive(Error, Debug)]
pub enum RuntimeError {
  #[error("推理引擎创建失败: {0}")]
  Load(String),
  #[error("推理执行失败: {0}")]
  Inference(String),
  #[error("推理线程已停止")]
  Stopped,
  #[error("张量错误: {0}")]
  Tensor(#[from] TensorError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("清单解析错误: {0}")]
  Manifest(#[from] serde_json::Error),
}

/// 推理完成回调，在运行时自己的线程上调用
pub type CompletionCallback = Box<dyn FnOnce(Result<Vec<Tensor>, RuntimeError>) + Send + 'static>;

/// 异步推理引擎
///
/// `run_async` 立即返回，结果通过回调交付。输出张量的顺序与
/// `outputs()` 一致。
pub trait InferenceRuntime: Send + Sync + 'static {
  fn outputs(&self) -> Vec<TensorInfo>;

  fn run_async(&self, input: Box<[u8]>, on_complete: CompletionCallback)
  -> Result<(), RuntimeError>;
}

/// 根据模型文件路径创建推理引擎
pub trait RuntimeLoader {
  type Runtime: InferenceRuntime;

  fn load(&self, model_path: &Path) -> Result<Self::Runtime, RuntimeError>;
}
