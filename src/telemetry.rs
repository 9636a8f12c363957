// 该文件是 Hexi （河西） 项目的一部分。
// src/telemetry.rs - 周转时间统计
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

use std::time::Duration;

use crate::session::{BACKEND_SLOTS, BackendId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemState {
  #[default]
  Pending,
  Assigned,
  Completed,
  Failed,
}

/// 单个条目的状态与周转时间
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchItem {
  pub index: usize,
  pub backend_id: BackendId,
  pub state: ItemState,
  /// 从批次开始到该条目完成的毫秒数
  pub turnaround_ms: f64,
}

pub(crate) fn millis(duration: Duration) -> f64 {
  duration.as_secs_f64() * 1000.0
}

/// 一个已完成批次的汇总
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchReport {
  pub items: Vec<BatchItem>,
  pub sum_turnaround_ms: f64,
  pub max_turnaround_ms: f64,
  /// 整个批次的墙钟耗时
  pub elapsed_ms: f64,
}

impl BatchReport {
  pub fn new(items: Vec<BatchItem>, elapsed: Duration) -> Self {
    let (sum, max) = items
      .iter()
      .filter(|item| item.state == ItemState::Completed)
      .fold((0.0f64, 0.0f64), |(sum, max), item| {
        (sum + item.turnaround_ms, max.max(item.turnaround_ms))
      });
    BatchReport {
      items,
      sum_turnaround_ms: sum,
      max_turnaround_ms: max,
      elapsed_ms: millis(elapsed),
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn mean_turnaround_ms(&self) -> f64 {
    if self.items.is_empty() {
      0.0
    } else {
      self.sum_turnaround_ms / self.items.len() as f64
    }
  }

  pub fn count(&self, backend: BackendId) -> usize {
    self.items.iter().filter(|item| item.backend_id == backend).count()
  }

  /// 按 [`BackendId::SCHEDULABLE`] 排列的条目数
  pub fn counts(&self) -> [usize; BACKEND_SLOTS] {
    BackendId::SCHEDULABLE.map(|backend| self.count(backend))
  }
}
