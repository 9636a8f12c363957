// 该文件是 Hexi （河西） 项目的一部分。
// src/sync.rs - 完成闩锁
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

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 一次性完成闩锁。
///
/// 创建时处于“未释放”状态，持有者调用 [`Latch::release`] 写入结果后，
/// 所有阻塞在 [`Latch::wait`] 上的读者被唤醒；之后的读取立即返回同一个结果。
/// 单条目闩锁与整批屏障都基于它。
#[derive(Debug)]
pub struct Latch<T> {
  value: Mutex<Option<T>>,
  cond: Condvar,
}

impl<T: Clone> Default for Latch<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone> Latch<T> {
  pub fn new() -> Self {
    Latch {
      value: Mutex::new(None),
      cond: Condvar::new(),
    }
  }

  /// 释放闩锁。重复释放时保留第一次的结果，返回是否由本次释放。
  pub fn release(&self, value: T) -> bool {
    let mut slot = lock(&self.value);
    if slot.is_some() {
      return false;
    }
    *slot = Some(value);
    self.cond.notify_all();
    true
  }

  pub fn is_released(&self) -> bool {
    lock(&self.value).is_some()
  }

  pub fn try_get(&self) -> Option<T> {
    lock(&self.value).clone()
  }

  /// 阻塞直到闩锁被释放
  pub fn wait(&self) -> T {
    let mut slot = lock(&self.value);
    loop {
      if let Some(value) = slot.as_ref() {
        return value.clone();
      }
      slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
    }
  }

  pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
    let slot = lock(&self.value);
    let (slot, _) = self
      .cond
      .wait_timeout_while(slot, timeout, |slot| slot.is_none())
      .unwrap_or_else(PoisonError::into_inner);
    slot.clone()
  }
}
