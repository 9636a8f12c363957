// 该文件是 Hexi （河西） 项目的一部分。
// src/scheduler.rs - 批次调度
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

use thiserror::Error;
use tracing::debug;

use crate::session::{BACKEND_SLOTS, BackendFamily, BackendId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
  #[error("后端 {backend} 的代价系数无效: {value} (必须为正数)")]
  InvalidCoefficient { backend: BackendId, value: f64 },
  #[error("代价系数过多: 最多 {max} 个, 实际 {actual} 个")]
  TooManyCoefficients { max: usize, actual: usize },
  #[error("没有可用的后端")]
  NoUsableBackend,
}

/// 各后端单条目平均耗时的估计，越小越快。
///
/// 顺序与 [`BackendId::SCHEDULABLE`] 一致；不可用的后端取 `f64::INFINITY`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostTable {
  coefficients: [f64; BACKEND_SLOTS],
}

impl Default for CostTable {
  fn default() -> Self {
    CostTable {
      coefficients: [1.0; BACKEND_SLOTS],
    }
  }
}

impl From<[f64; BACKEND_SLOTS]> for CostTable {
  fn from(coefficients: [f64; BACKEND_SLOTS]) -> Self {
    CostTable { coefficients }
  }
}

impl CostTable {
  /// 从按优先级排列的列表构造，未给出的后端取 1.0
  pub fn from_slice(values: &[f64]) -> Result<Self, ScheduleError> {
    if values.len() > BACKEND_SLOTS {
      return Err(ScheduleError::TooManyCoefficients {
        max: BACKEND_SLOTS,
        actual: values.len(),
      });
    }
    let mut table = CostTable::default();
    table.coefficients[..values.len()].copy_from_slice(values);
    table.validate()?;
    Ok(table)
  }

  pub fn get(&self, backend: BackendId) -> f64 {
    backend
      .slot()
      .map(|slot| self.coefficients[slot])
      .unwrap_or(f64::INFINITY)
  }

  pub fn coefficients(&self) -> &[f64; BACKEND_SLOTS] {
    &self.coefficients
  }

  /// 零、负数和 NaN 视为配置错误；正无穷表示该后端不参与调度。
  pub fn validate(&self) -> Result<(), ScheduleError> {
    validate(&self.coefficients)
  }

  /// 把不可用后端的系数置为正无穷
  pub fn restricted_to(&self, available: &[bool; BACKEND_SLOTS]) -> [f64; BACKEND_SLOTS] {
    let mut coefficients = self.coefficients;
    for (c, &ok) in coefficients.iter_mut().zip(available) {
      if !ok {
        *c = f64::INFINITY;
      }
    }
    coefficients
  }
}

fn validate(coefficients: &[f64; BACKEND_SLOTS]) -> Result<(), ScheduleError> {
  for (&backend, &value) in BackendId::SCHEDULABLE.iter().zip(coefficients) {
    // NaN 也落在这里
    if !(value > 0.0) {
      return Err(ScheduleError::InvalidCoefficient { backend, value });
    }
  }
  Ok(())
}

/// 一个批次的划分：条目下标到后端的映射
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchPlan {
  assignments: Vec<BackendId>,
}

impl BatchPlan {
  pub fn len(&self) -> usize {
    self.assignments.len()
  }

  pub fn is_empty(&self) -> bool {
    self.assignments.is_empty()
  }

  pub fn backend_of(&self, index: usize) -> BackendId {
    self.assignments.get(index).copied().unwrap_or_default()
  }

  pub fn assignments(&self) -> &[BackendId] {
    &self.assignments
  }

  /// 分配给 `backend` 的条目，升序
  pub fn partition(&self, backend: BackendId) -> Vec<usize> {
    self
      .assignments
      .iter()
      .enumerate()
      .filter(|&(_, &b)| b == backend)
      .map(|(index, _)| index)
      .collect()
  }

  pub fn count(&self, backend: BackendId) -> usize {
    self.assignments.iter().filter(|&&b| b == backend).count()
  }

  pub fn counts(&self) -> [usize; BACKEND_SLOTS] {
    BackendId::SCHEDULABLE.map(|backend| self.count(backend))
  }

  pub fn routes_to(&self, family: BackendFamily) -> bool {
    self.assignments.iter().any(|b| b.family() == Some(family))
  }
}

/// 贪心加权划分。
///
/// 依次处理每个条目，计算各后端再多处理一个条目后的预计完成时间
/// `(k[j] + 1) * c[j]`，取最小者；相等时按 [`BackendId::SCHEDULABLE`] 的顺序取靠前者。
/// 这是对异构后端完成时间的在线近似，不回溯，复杂度为 O(条目数 × 后端数)。
pub fn plan(
  batch_size: usize,
  coefficients: &[f64; BACKEND_SLOTS],
) -> Result<BatchPlan, ScheduleError> {
  validate(coefficients)?;

  let mut counts = [0usize; BACKEND_SLOTS];
  let mut assignments = Vec::with_capacity(batch_size);
  for _ in 0..batch_size {
    let mut best: Option<(usize, f64)> = None;
    for (slot, &c) in coefficients.iter().enumerate() {
      if c.is_infinite() {
        continue;
      }
      // 有限系数的预计时间溢出时饱和，后端仍然可用
      let projected = ((counts[slot] + 1) as f64 * c).min(f64::MAX);
      if best.is_none_or(|(_, min)| projected < min) {
        best = Some((slot, projected));
      }
    }
    let (slot, _) = best.ok_or(ScheduleError::NoUsableBackend)?;
    counts[slot] += 1;
    assignments.push(BackendId::SCHEDULABLE[slot]);
  }

  debug!("批次划分 ({} 个条目): {:?}", batch_size, counts);
  Ok(BatchPlan { assignments })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  const INF: f64 = f64::INFINITY;

  fn check_coverage(plan: &BatchPlan, n: usize) {
    let mut seen = HashSet::new();
    for backend in BackendId::SCHEDULABLE {
      for index in plan.partition(backend) {
        assert!(seen.insert(index), "条目 {} 被重复分配", index);
      }
    }
    assert_eq!(seen.len(), n);
    assert!((0..n).all(|i| seen.contains(&i)));
  }

  #[test]
  fn partition_covers_every_item_once() {
    let tables = [
      [1.0; BACKEND_SLOTS],
      [1.0, 2.0, INF, INF, INF],
      [INF, INF, 3.0, 3.0, 3.0],
      [0.5, 7.0, 2.0, 9.0, 1.5],
      [INF, 1.0, INF, INF, INF],
    ];
    for costs in tables {
      for n in [0, 1, 2, 7, 64, 333] {
        let plan = plan(n, &costs).unwrap();
        assert_eq!(plan.len(), n);
        check_coverage(&plan, n);
      }
    }
  }

  #[test]
  fn share_follows_throughput() {
    let plan = plan(1000, &[1.0, 2.0, INF, INF, INF]).unwrap();
    assert_eq!(plan.count(BackendId::Software), 667);
    assert_eq!(plan.count(BackendId::Npu), 333);

    let plan = super::plan(1000, &[INF, INF, 1.0, 3.0, INF]).unwrap();
    let fast = plan.count(BackendId::Streaming1) as f64;
    let slow = plan.count(BackendId::Streaming2) as f64;
    assert!((fast / slow - 3.0).abs() < 0.05);
  }

  #[test]
  fn ties_follow_priority_order() {
    let plan = plan(7, &[1.0; BACKEND_SLOTS]).unwrap();
    assert_eq!(
      plan.assignments(),
      &[
        BackendId::Software,
        BackendId::Npu,
        BackendId::Streaming1,
        BackendId::Streaming2,
        BackendId::Streaming3,
        BackendId::Software,
        BackendId::Npu,
      ]
    );
  }

  #[test]
  fn unavailable_backends_get_nothing() {
    let plan = plan(10, &[INF, 1.0, INF, INF, INF]).unwrap();
    assert_eq!(plan.count(BackendId::Npu), 10);
    assert!(!plan.routes_to(BackendFamily::Software));
    assert!(plan.partition(BackendId::Software).is_empty());
  }

  #[test]
  fn huge_coefficients_saturate() {
    let single = plan(3, &[INF, INF, 1e308, INF, INF]).unwrap();
    assert_eq!(single.count(BackendId::Streaming1), 3);

    // 两者都饱和后按优先级取靠前者
    let pair = plan(4, &[INF, 1e308, 1e308, INF, INF]).unwrap();
    assert_eq!(pair.assignments()[0], BackendId::Npu);
    assert_eq!(pair.assignments()[1], BackendId::Streaming1);
    assert_eq!(pair.count(BackendId::Npu) + pair.count(BackendId::Streaming1), 4);
  }

  #[test]
  fn rejects_bad_coefficients() {
    assert!(matches!(
      plan(4, &[0.0, 1.0, 1.0, 1.0, 1.0]),
      Err(ScheduleError::InvalidCoefficient {
        backend: BackendId::Software,
        ..
      })
    ));
    assert!(matches!(
      plan(4, &[1.0, 1.0, -2.0, 1.0, 1.0]),
      Err(ScheduleError::InvalidCoefficient {
        backend: BackendId::Streaming1,
        ..
      })
    ));
    assert!(plan(4, &[1.0, f64::NAN, 1.0, 1.0, 1.0]).is_err());
    assert_eq!(plan(4, &[INF; BACKEND_SLOTS]), Err(ScheduleError::NoUsableBackend));
    assert_eq!(plan(0, &[INF; BACKEND_SLOTS]).map(|p| p.len()), Ok(0));
  }

  #[test]
  fn cost_table_from_slice() {
    let table = CostTable::from_slice(&[2.0, 3.0]).unwrap();
    assert_eq!(table.get(BackendId::Npu), 3.0);
    assert_eq!(table.get(BackendId::Streaming2), 1.0);
    assert_eq!(table.get(BackendId::None), INF);
    assert!(CostTable::from_slice(&[1.0; 6]).is_err());
    assert!(CostTable::from_slice(&[1.0, 0.0]).is_err());

    let restricted = table.restricted_to(&[false, true, true, false, false]);
    assert_eq!(restricted, [INF, 3.0, 1.0, INF, INF]);
  }
}
