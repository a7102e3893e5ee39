// 该文件是 Xiling （西岭） 项目的一部分。
// src/task.rs - 采集、提交与结果消费循环
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
  broker::Snapshot,
  detector::{Detector, DetectorState, ErrorCategory},
  frame::PreparedFrame,
  output::Render,
  runtime::InferenceRuntime,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub trait Task<I, R: InferenceRuntime, O>: Sized {
  type Error;
  fn run_task(self, input: I, detector: Detector<R>, output: O) -> Result<(), Self::Error>;
}

/// 等待在途帧完成，返回最终状态
fn drain<R: InferenceRuntime>(detector: &Detector<R>, timeout: Duration) -> DetectorState {
  let start = Instant::now();
  loop {
    let state = detector.state();
    if !matches!(state, DetectorState::Submitted | DetectorState::Decoding)
      || start.elapsed() >= timeout
    {
      return state;
    }
    thread::sleep(Duration::from_millis(1));
  }
}

/// 提交一帧并等待其结果
#[derive(Debug, Clone)]
pub struct OneShotTask {
  timeout: Duration,
}

impl Default for OneShotTask {
  fn default() -> Self {
    Self {
      timeout: DEFAULT_DRAIN_TIMEOUT,
    }
  }
}

impl OneShotTask {
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

impl<
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = PreparedFrame>,
  R: InferenceRuntime,
  O: Render<Snapshot, Error = RE>,
> Task<I, R, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, detector: Detector<R>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    let now = Instant::now();
    let generation = detector.submit(frame)?;

    let state = drain(&detector, self.timeout);
    let snapshot = detector.snapshot();
    if snapshot.generation != generation {
      anyhow::bail!("第 {} 帧未产生结果, 检测器状态: {}", generation, state);
    }
    info!("推理完成，耗时: {:.2?}", now.elapsed());
    output.render_result(&snapshot)?;
    Ok(())
  }
}

/// 连续提交帧，同时在独立线程上轮询最新结果
///
/// 采集线程遇到在途帧时直接丢弃当前帧，消费线程只在结果序号变化时输出。
#[derive(Debug, Clone)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  poll_interval: Duration,
  handle_ctrlc: bool,
}

impl Default for ContinuousTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      poll_interval: DEFAULT_POLL_INTERVAL,
      handle_ctrlc: true,
    }
  }
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
    self.poll_interval = poll_interval;
    self
  }

  pub fn with_ctrlc(mut self, handle_ctrlc: bool) -> Self {
    self.handle_ctrlc = handle_ctrlc;
    self
  }
}

fn consume<O, RE>(
  snapshot: &Snapshot,
  last: &mut u64,
  output: &O,
) -> Result<(), anyhow::Error>
where
  O: Render<Snapshot, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  if snapshot.generation != *last {
    *last = snapshot.generation;
    output.render_result(snapshot)?;
  }
  Ok(())
}

impl<
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = PreparedFrame>,
  R: InferenceRuntime,
  O: Render<Snapshot, Error = RE> + Send + 'static,
> Task<I, R, O> for ContinuousTask
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, detector: Detector<R>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let stop = Arc::new(AtomicBool::new(false));

    if self.handle_ctrlc {
      let stop = Arc::clone(&stop);
      if let Err(err) = ctrlc::set_handler(move || {
        info!("收到中断信号，准备退出...");
        stop.store(true, Ordering::SeqCst);
      }) {
        warn!("无法设置 Ctrl-C 处理: {}", err);
      }
    }

    let done = Arc::new(AtomicBool::new(false));
    let consumer = {
      let detector = detector.clone();
      let done = Arc::clone(&done);
      let interval = self.poll_interval;
      thread::Builder::new()
        .name("xiling-consumer".into())
        .spawn(move || -> Result<(), anyhow::Error> {
          let mut last = 0;
          while !done.load(Ordering::SeqCst) {
            consume(&detector.snapshot(), &mut last, &output)?;
            thread::sleep(interval);
          }
          consume(&detector.snapshot(), &mut last, &output)
        })?
    };

    let mut frame_index = 0usize;
    let mut submitted = 0usize;
    let mut result: Result<(), anyhow::Error> = Ok(());
    for frame in input {
      if consumer.is_finished() {
        warn!("结果消费线程已退出，停止提交");
        break;
      }
      frame_index += 1;
      match detector.submit(frame) {
        Ok(generation) => {
          submitted += 1;
          debug!("第 {} 帧提交为序号 {}", frame_index, generation);
        }
        Err(err) if err.category() == ErrorCategory::Configuration => {
          result = Err(err.into());
          break;
        }
        Err(err) => debug!("跳过第 {} 帧: {}", frame_index, err),
      }

      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if stop.load(Ordering::SeqCst) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    let state = drain(&detector, DEFAULT_DRAIN_TIMEOUT);
    done.store(true, Ordering::SeqCst);
    let consumed = consumer
      .join()
      .map_err(|_| anyhow::anyhow!("结果消费线程异常退出"))?;

    info!(
      "任务完成: 读取 {} 帧, 提交 {} 帧, 检测器状态 {}",
      frame_index, submitted, state
    );
    result.and(consumed)
  }
}
