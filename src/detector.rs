// 该文件是 Xiling （西岭） 项目的一部分。
// src/detector.rs - 异步检测器与状态机
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
  fmt,
  sync::{
    Arc, Mutex, MutexGuard, PoisonError, Weak,
    atomic::{AtomicU64, Ordering},
  },
};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  broker::{ResultBroker, Snapshot},
  frame::{PreparedFrame, SourceSize},
  model::{ConfigError, DetectResult, ModelConfig, ModelSource},
  postprocess::{BindError, DecodeError, PostProcessor},
  runtime::{InferenceRuntime, RuntimeError, RuntimeLoader},
  tensor::Tensor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
  Uninitialized,
  Loading,
  Ready,
  Submitted,
  Decoding,
  Error,
}

impl fmt::Display for DetectorState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      DetectorState::Uninitialized => "未初始化",
      DetectorState::Loading => "加载中",
      DetectorState::Ready => "就绪",
      DetectorState::Submitted => "已提交",
      DetectorState::Decoding => "解码中",
      DetectorState::Error => "错误",
    };
    f.write_str(name)
  }
}

/// 错误类别，调用方只应依赖类别而不是具体变体
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
  /// 配置或绑定错误，需要修正配置后重新加载
  Configuration,
  /// 可以直接丢弃的瞬时情况
  Transient,
  /// 推理或解码失败，下一次调用可以重试
  Runtime,
}

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("输出绑定错误: {0}")]
  Bind(#[from] BindError),
  #[error("解码错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("推理运行时错误: {0}")]
  Runtime(#[from] RuntimeError),
  #[error("检测器未就绪, 当前状态: {0}")]
  NotReady(DetectorState),
  #[error("上一帧尚未完成")]
  Busy,
  #[error("输入帧尺寸不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  FrameSize {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

impl DetectorError {
  pub fn category(&self) -> ErrorCategory {
    match self {
      DetectorError::Config(_) | DetectorError::Bind(_) | DetectorError::FrameSize { .. } => {
        ErrorCategory::Configuration
      }
      DetectorError::Busy => ErrorCategory::Transient,
      DetectorError::Decode(_) | DetectorError::Runtime(_) | DetectorError::NotReady(_) => {
        ErrorCategory::Runtime
      }
    }
  }
}

type ErrorHook = Arc<dyn Fn(&DetectorError) + Send + Sync + 'static>;

struct Engine<R> {
  runtime: R,
  config: Arc<ModelConfig>,
  processor: Mutex<PostProcessor>,
}

struct Shared<R> {
  state: DetectorState,
  engine: Option<Arc<Engine<R>>>,
}

struct Inner<R> {
  shared: Mutex<Shared<R>>,
  broker: ResultBroker,
  generation: AtomicU64,
  on_error: Mutex<Option<ErrorHook>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 异步 YOLO 检测器
///
/// 采集线程调用 [`Detector::submit`]，推理线程在完成回调中解码并发布结果，
/// 消费线程随时调用 [`Detector::latest`] 读取最近一次的结果。
/// 同一时刻只允许一帧在途，在途期间的提交返回 [`DetectorError::Busy`]。
pub struct Detector<R: InferenceRuntime> {
  inner: Arc<Inner<R>>,
}

impl<R: InferenceRuntime> Clone for Detector<R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<R: InferenceRuntime> Default for Detector<R> {
  fn default() -> Self {
    Self::new()
  }
}

impl<R: InferenceRuntime> Detector<R> {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        shared: Mutex::new(Shared {
          state: DetectorState::Uninitialized,
          engine: None,
        }),
        broker: ResultBroker::new(),
        generation: AtomicU64::new(0),
        on_error: Mutex::new(None),
      }),
    }
  }

  /// 注册错误通知回调，替换之前注册的回调
  pub fn on_error<F>(&self, hook: F)
  where
    F: Fn(&DetectorError) + Send + Sync + 'static,
  {
    *lock(&self.inner.on_error) = Some(Arc::new(hook));
  }

  pub fn state(&self) -> DetectorState {
    lock(&self.inner.shared).state
  }

  pub fn config(&self) -> Option<Arc<ModelConfig>> {
    lock(&self.inner.shared)
      .engine
      .as_ref()
      .map(|engine| Arc::clone(&engine.config))
  }

  /// 通过加载器创建推理引擎并完成初始化
  pub fn load<L>(&self, loader: &L, source: &ModelSource) -> Result<(), DetectorError>
  where
    L: RuntimeLoader<Runtime = R>,
  {
    self.begin_loading();
    info!("加载模型: {}", source.model_path.display());
    let runtime = match loader.load(&source.model_path) {
      Ok(runtime) => runtime,
      Err(err) => return Err(self.fail_loading(err.into())),
    };
    self.initialize(runtime, source.config.clone())
  }

  /// 使用已经创建好的推理引擎初始化
  ///
  /// 失败时之前的引擎和解码器都会被释放，检测器进入错误状态。
  pub fn initialize(&self, runtime: R, config: ModelConfig) -> Result<(), DetectorError> {
    self.begin_loading();

    let config = Arc::new(config);
    let processor = match PostProcessor::new(Arc::clone(&config), &runtime.outputs()) {
      Ok(processor) => processor,
      Err(err) => return Err(self.fail_loading(err.into())),
    };
    info!(
      "检测器初始化完成: 输入 {}x{}, 候选 {}, 类别 {}",
      config.input_width,
      config.input_height,
      processor.num_boxes(),
      config.num_classes
    );

    let mut shared = lock(&self.inner.shared);
    shared.engine = Some(Arc::new(Engine {
      runtime,
      config,
      processor: Mutex::new(processor),
    }));
    shared.state = DetectorState::Ready;
    Ok(())
  }

  fn begin_loading(&self) {
    let mut shared = lock(&self.inner.shared);
    let previous = shared.engine.take();
    shared.state = DetectorState::Loading;
    drop(shared);
    // 释放旧引擎会等待其推理线程退出，不能持有状态锁
    drop(previous);
    self.inner.broker.reset();
  }

  fn fail_loading(&self, err: DetectorError) -> DetectorError {
    lock(&self.inner.shared).state = DetectorState::Error;
    self.inner.report(&err);
    err
  }

  /// 提交一帧进行推理，立即返回本帧的序号
  ///
  /// 只能在就绪状态（或解码失败后的错误状态）调用。
  pub fn submit(&self, frame: PreparedFrame) -> Result<u64, DetectorError> {
    let (engine, generation) = {
      let mut shared = lock(&self.inner.shared);
      let engine = match (shared.state, shared.engine.as_ref()) {
        (DetectorState::Ready | DetectorState::Error, Some(engine)) => Arc::clone(engine),
        (DetectorState::Submitted | DetectorState::Decoding, Some(_)) => {
          return Err(DetectorError::Busy);
        }
        (state, _) => return Err(DetectorError::NotReady(state)),
      };

      let expected = (engine.config.input_width, engine.config.input_height);
      let actual = (frame.width(), frame.height());
      if expected != actual {
        return Err(DetectorError::FrameSize { expected, actual });
      }

      shared.state = DetectorState::Submitted;
      (engine, self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1)
    };

    let source = frame.source();
    let weak = Arc::downgrade(&self.inner);
    let callback_engine = Arc::clone(&engine);
    let submitted = engine.runtime.run_async(
      frame.into_data(),
      Box::new(move |result| {
        on_inference_complete(weak, callback_engine, generation, source, result)
      }),
    );

    if let Err(err) = submitted {
      let err = DetectorError::from(err);
      self.inner.finish(&engine, DetectorState::Error);
      self.inner.report(&err);
      return Err(err);
    }

    debug!("提交第 {} 帧", generation);
    Ok(generation)
  }

  /// 最近一次成功解码的结果（拷贝）
  pub fn latest(&self) -> DetectResult {
    self.inner.broker.latest().result.clone()
  }

  /// 最近一次结果的共享快照，带有产生它的帧序号
  pub fn snapshot(&self) -> Arc<Snapshot> {
    self.inner.broker.latest()
  }
}

fn on_inference_complete<R: InferenceRuntime>(
  inner: Weak<Inner<R>>,
  engine: Arc<Engine<R>>,
  generation: u64,
  source: SourceSize,
  result: Result<Vec<Tensor>, RuntimeError>,
) {
  let Some(inner) = inner.upgrade() else {
    return;
  };
  inner.complete(&engine, generation, source, result);
}

impl<R: InferenceRuntime> Inner<R> {
  fn is_current(shared: &Shared<R>, engine: &Arc<Engine<R>>) -> bool {
    shared
      .engine
      .as_ref()
      .is_some_and(|current| Arc::ptr_eq(current, engine))
  }

  /// 仅当引擎仍是当前引擎时才切换状态
  fn finish(&self, engine: &Arc<Engine<R>>, state: DetectorState) -> bool {
    let mut shared = lock(&self.shared);
    if !Self::is_current(&shared, engine) {
      return false;
    }
    shared.state = state;
    true
  }

  fn complete(
    &self,
    engine: &Arc<Engine<R>>,
    generation: u64,
    source: SourceSize,
    result: Result<Vec<Tensor>, RuntimeError>,
  ) {
    if !self.finish(engine, DetectorState::Decoding) {
      debug!("模型已重新加载, 丢弃第 {} 帧的结果", generation);
      return;
    }

    let decoded = result.map_err(DetectorError::from).and_then(|tensors| {
      lock(&engine.processor)
        .process(&tensors, source)
        .map_err(DetectorError::from)
    });

    match decoded {
      Ok(result) => {
        debug!("第 {} 帧检测到 {} 个目标", generation, result.len());
        // 发布与切回就绪在同一把锁内完成
        let mut shared = lock(&self.shared);
        if Self::is_current(&shared, engine) {
          self.broker.publish(generation, result);
          shared.state = DetectorState::Ready;
        }
      }
      Err(err) => {
        if self.finish(engine, DetectorState::Error) {
          self.report(&err);
        }
      }
    }
  }

  fn report(&self, err: &DetectorError) {
    error!("检测器错误 ({:?}): {}", err.category(), err);
    // 回调可能重新注册回调，调用时不能持有锁
    let hook = lock(&self.on_error).clone();
    if let Some(hook) = hook {
      hook(err);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::mpsc::{self, Receiver, Sender},
    time::Duration,
  };

  use super::*;
  use crate::{
    model::{LayerSpec, PostProcessMode},
    runtime::WorkerRuntime,
    tensor::{DataType, TensorInfo},
  };

  const TIMEOUT: Duration = Duration::from_secs(5);

  fn config() -> ModelConfig {
    ModelConfig {
      input_width: 4,
      input_height: 4,
      conf_threshold: 0.25,
      score_threshold: 0.25,
      iou_threshold: 0.45,
      num_boxes: None,
      num_classes: 1,
      consolidated_output: "output".into(),
      class_names: vec!["person".into()],
      mode: PostProcessMode::Detection,
      layers: Vec::<LayerSpec>::new(),
      split_head: None,
    }
  }

  fn output_info() -> TensorInfo {
    TensorInfo::new("output", vec![1, 1, 6], DataType::Float32)
  }

  /// 推理函数等待测试线程放行，便于观察在途状态
  fn gated_runtime() -> (WorkerRuntime, Sender<Result<Vec<f32>, String>>) {
    let (tx, rx): (_, Receiver<Result<Vec<f32>, String>>) = mpsc::channel();
    let runtime = WorkerRuntime::spawn(vec![output_info()], move |_| {
      match rx.recv().map_err(|_| RuntimeError::Stopped)? {
        Ok(row) => Ok(vec![Tensor::from_f32("output", vec![1, 1, 6], &row)?]),
        Err(message) => Err(RuntimeError::Inference(message)),
      }
    })
    .unwrap();
    (runtime, tx)
  }

  fn frame() -> PreparedFrame {
    PreparedFrame::blank(4, 4, SourceSize::new(4, 4)).unwrap()
  }

  fn wait_for(detector: &Detector<WorkerRuntime>, state: DetectorState) {
    let start = std::time::Instant::now();
    while detector.state() != state {
      assert!(start.elapsed() < TIMEOUT, "state stuck at {}", detector.state());
      std::thread::sleep(Duration::from_millis(1));
    }
  }

  #[test]
  fn submit_before_initialize_is_rejected() {
    let detector = Detector::<WorkerRuntime>::new();
    assert!(matches!(
      detector.submit(frame()),
      Err(DetectorError::NotReady(DetectorState::Uninitialized))
    ));
  }

  #[test]
  fn frame_cycle_publishes_result() {
    let (runtime, gate) = gated_runtime();
    let detector = Detector::new();
    detector.initialize(runtime, config()).unwrap();
    assert_eq!(detector.state(), DetectorState::Ready);

    let generation = detector.submit(frame()).unwrap();
    assert_eq!(detector.state(), DetectorState::Submitted);
    assert!(matches!(detector.submit(frame()), Err(DetectorError::Busy)));

    gate.send(Ok(vec![2.0, 2.0, 2.0, 2.0, 0.9, 0.8])).unwrap();
    wait_for(&detector, DetectorState::Ready);

    let snapshot = detector.snapshot();
    assert_eq!(snapshot.generation, generation);
    assert_eq!(snapshot.result.len(), 1);
    assert_eq!(detector.latest().items[0].bbox, [1.0, 1.0, 3.0, 3.0]);
  }

  #[test]
  fn inference_failure_keeps_previous_result_and_allows_retry() {
    let (runtime, gate) = gated_runtime();
    let detector = Detector::new();
    let (err_tx, err_rx) = mpsc::channel();
    detector.on_error(move |err| {
      let _ = err_tx.send(err.category());
    });
    detector.initialize(runtime, config()).unwrap();

    detector.submit(frame()).unwrap();
    gate.send(Ok(vec![2.0, 2.0, 2.0, 2.0, 0.9, 0.8])).unwrap();
    wait_for(&detector, DetectorState::Ready);

    detector.submit(frame()).unwrap();
    gate.send(Err("npu timeout".into())).unwrap();
    assert_eq!(err_rx.recv_timeout(TIMEOUT).unwrap(), ErrorCategory::Runtime);
    wait_for(&detector, DetectorState::Error);
    assert_eq!(detector.latest().len(), 1);

    detector.submit(frame()).unwrap();
    gate.send(Ok(vec![0.0; 6])).unwrap();
    wait_for(&detector, DetectorState::Ready);
    assert!(detector.latest().is_empty());
  }

  #[test]
  fn bind_failure_tears_down_engine() {
    let (runtime, _gate) = gated_runtime();
    let detector = Detector::new();
    detector.initialize(runtime, config()).unwrap();

    let (other, _other_gate) = gated_runtime();
    let mut broken = config();
    broken.consolidated_output = "missing".into();
    let err = detector.initialize(other, broken).unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert_eq!(detector.state(), DetectorState::Error);
    assert!(detector.config().is_none());
    assert!(matches!(
      detector.submit(frame()),
      Err(DetectorError::NotReady(DetectorState::Error))
    ));
  }

  #[test]
  fn error_hook_may_replace_itself() {
    let detector = Detector::<WorkerRuntime>::new();
    let (tx, rx) = mpsc::channel();
    let handle = detector.clone();
    detector.on_error(move |_| {
      let tx = tx.clone();
      handle.on_error(move |err| {
        let _ = tx.send(err.category());
      });
    });

    let (done_tx, done_rx) = mpsc::channel();
    let worker = detector.clone();
    std::thread::spawn(move || {
      let (runtime, _gate) = gated_runtime();
      let mut broken = config();
      broken.consolidated_output = "missing".into();
      let _ = done_tx.send(worker.initialize(runtime, broken).is_err());
    });
    assert!(done_rx.recv_timeout(TIMEOUT).unwrap());
    assert!(rx.try_recv().is_err());

    let (runtime, _gate) = gated_runtime();
    let mut broken = config();
    broken.consolidated_output = "missing".into();
    assert!(detector.initialize(runtime, broken).is_err());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ErrorCategory::Configuration);
  }

  #[test]
  fn frame_with_wrong_size_is_rejected() {
    let (runtime, _gate) = gated_runtime();
    let detector = Detector::new();
    detector.initialize(runtime, config()).unwrap();
    let frame = PreparedFrame::blank(8, 8, SourceSize::new(8, 8)).unwrap();
    assert!(matches!(
      detector.submit(frame),
      Err(DetectorError::FrameSize { .. })
    ));
    assert_eq!(detector.state(), DetectorState::Ready);
  }
}
