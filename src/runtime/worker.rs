// 该文件是 Xiling （西岭） 项目的一部分。
// src/runtime/worker.rs - 独立线程推理运行时
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

use std::{
  sync::mpsc::{self, Sender},
  thread::{self, JoinHandle},
};

use tracing::{debug, info};

use super::{CompletionCallback, InferenceRuntime, RuntimeError};
use crate::tensor::{Tensor, TensorInfo};

struct Job {
  input: Box<[u8]>,
  on_complete: CompletionCallback,
}

/// 在专用线程上串行执行推理函数的运行时
///
/// 任务按提交顺序执行，完成回调在工作线程上调用。
pub struct WorkerRuntime {
  outputs: Vec<TensorInfo>,
  sender: Option<Sender<Job>>,
  handle: Option<JoinHandle<()>>,
}

impl WorkerRuntime {
  pub fn spawn<F>(outputs: Vec<TensorInfo>, mut infer: F) -> Result<Self, RuntimeError>
  where
    F: FnMut(&[u8]) -> Result<Vec<Tensor>, RuntimeError> + Send + 'static,
  {
    let (sender, receiver) = mpsc::channel::<Job>();
    let handle = thread::Builder::new()
      .name("xiling-infer".into())
      .spawn(move || {
        info!("推理线程启动");
        for job in receiver {
          let result = infer(&job.input);
          (job.on_complete)(result);
        }
        info!("推理线程退出");
      })?;

    Ok(Self {
      outputs,
      sender: Some(sender),
      handle: Some(handle),
    })
  }
}

impl InferenceRuntime for WorkerRuntime {
  fn outputs(&self) -> Vec<TensorInfo> {
    self.outputs.clone()
  }

  fn run_async(
    &self,
    input: Box<[u8]>,
    on_complete: CompletionCallback,
  ) -> Result<(), RuntimeError> {
    let sender = self.sender.as_ref().ok_or(RuntimeError::Stopped)?;
    sender
      .send(Job { input, on_complete })
      .map_err(|_| RuntimeError::Stopped)
  }
}

impl Drop for WorkerRuntime {
  fn drop(&mut self) {
    self.sender.take();
    if let Some(handle) = self.handle.take() {
      // 最后一个引用可能在完成回调里释放，此时不能等待自己
      if handle.thread().id() == thread::current().id() {
        debug!("在推理线程内释放运行时，跳过 join");
        return;
      }
      let _ = handle.join();
    }
  }
}
