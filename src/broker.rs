// 该文件是 Xiling （西岭） 项目的一部分。
// src/broker.rs - 最新检测结果的单槽缓存
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

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;

use crate::model::DetectResult;

/// 某一帧的检测结果快照，发布后不可变
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
  /// 产生该结果的提交序号，0 表示尚无结果
  pub generation: u64,
  pub result: DetectResult,
}

/// 单槽覆盖式结果缓存
///
/// 推理回调线程写，消费线程读，锁只在交换 `Arc` 时持有。
/// 序号比当前快照旧的发布会被丢弃，因此乱序完成不会让结果倒退。
#[derive(Debug, Default)]
pub struct ResultBroker {
  slot: Mutex<Arc<Snapshot>>,
}

impl ResultBroker {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Arc<Snapshot>> {
    // 快照替换是单次赋值，锁中毒时数据仍然完整
    self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// 发布一帧结果，返回是否被采纳
  pub fn publish(&self, generation: u64, result: DetectResult) -> bool {
    let snapshot = Arc::new(Snapshot { generation, result });
    let mut slot = self.lock();
    if generation < slot.generation {
      debug!(
        "丢弃过期结果: 序号 {} < 当前 {}",
        generation, slot.generation
      );
      return false;
    }
    *slot = snapshot;
    true
  }

  /// 当前缓存的快照，可能是若干帧之前的结果
  pub fn latest(&self) -> Arc<Snapshot> {
    Arc::clone(&self.lock())
  }

  pub fn generation(&self) -> u64 {
    self.lock().generation
  }

  /// 清空缓存，重新加载模型时使用
  pub fn reset(&self) {
    *self.lock() = Arc::new(Snapshot::default());
  }
}
