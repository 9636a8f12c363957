// 该文件是 Hexi （河西） 项目的一部分。
// src/threshold.rs - 检测分数阈值
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

use crate::{
  scheduler::BatchPlan,
  session::BackendFamily,
};

/// 未配置时各检测头的分数阈值
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.001;

/// 默认检测头数
pub const DEFAULT_DETECTION_HEADS: usize = 2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdError {
  #[error("检测头 {head} 的分数阈值无效: {value}")]
  InvalidValue { head: usize, value: f32 },
}

/// 每个检测头的原始阈值与放宽阈值。
///
/// 负数表示“未设置”，选择时保持当前值不变。
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreThresholds {
  original: Vec<Option<f32>>,
  relaxed: Vec<Option<f32>>,
  current: Vec<f32>,
}

impl Default for ScoreThresholds {
  fn default() -> Self {
    ScoreThresholds {
      original: vec![None; DEFAULT_DETECTION_HEADS],
      relaxed: vec![None; DEFAULT_DETECTION_HEADS],
      current: vec![DEFAULT_SCORE_THRESHOLD; DEFAULT_DETECTION_HEADS],
    }
  }
}

fn parse(values: &[f32], heads: usize) -> Result<Vec<Option<f32>>, ThresholdError> {
  let mut parsed = vec![None; heads];
  for (head, &value) in values.iter().enumerate() {
    if value.is_nan() || value > 1.0 {
      return Err(ThresholdError::InvalidValue { head, value });
    }
    parsed[head] = (value >= 0.0).then_some(value);
  }
  Ok(parsed)
}

impl ScoreThresholds {
  pub fn new(original: &[f32], relaxed: &[f32]) -> Result<Self, ThresholdError> {
    let mut thresholds = ScoreThresholds::default();
    thresholds.set(original, relaxed)?;
    Ok(thresholds)
  }

  /// 重新配置阈值，当前阈值回到原始值
  pub fn set(&mut self, original: &[f32], relaxed: &[f32]) -> Result<(), ThresholdError> {
    let heads = self.current.len().max(original.len()).max(relaxed.len());
    let original = parse(original, heads)?;
    let relaxed = parse(relaxed, heads)?;

    self.current.resize(heads, DEFAULT_SCORE_THRESHOLD);
    for (current, value) in self.current.iter_mut().zip(&original) {
      if let Some(value) = value {
        *current = *value;
      }
    }
    self.original = original;
    self.relaxed = relaxed;
    debug!("分数阈值: {:?}", self.current);
    Ok(())
  }

  pub fn current(&self) -> &[f32] {
    &self.current
  }

  pub fn heads(&self) -> usize {
    self.current.len()
  }

  /// 按批次划分选出有效阈值，不修改当前阈值。
  ///
  /// 只要有条目交给软件解释器或 NPU，就使用放宽阈值；全部交给流式设备时使用原始阈值。
  /// 未设置的检测头保持当前值。
  pub fn select(&self, plan: &BatchPlan) -> Selection {
    let relax = plan.routes_to(BackendFamily::Software) || plan.routes_to(BackendFamily::Npu);
    let chosen = if relax { &self.relaxed } else { &self.original };
    let current = self
      .current
      .iter()
      .zip(chosen)
      .map(|(&current, value)| value.unwrap_or(current))
      .collect();
    Selection {
      current,
      device: chosen.first().copied().flatten(),
    }
  }

  /// 采用一次选择的结果
  pub fn commit(&mut self, selection: Selection) {
    self.current = selection.current;
  }
}

/// 一次阈值选择的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
  /// 选择后各检测头的阈值
  pub current: Vec<f32>,
  /// 推送给流式设备过滤阶段的阈值，取第一个检测头；未设置时设备保留自身阈值
  pub device: Option<f32>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::scheduler::plan;

  const INF: f64 = f64::INFINITY;

  #[test]
  fn defaults_when_unset() {
    let thresholds = ScoreThresholds::default();
    assert_eq!(thresholds.current(), &[0.001, 0.001]);
  }

  fn choose(thresholds: &mut ScoreThresholds, plan: &BatchPlan) -> Option<f32> {
    let selection = thresholds.select(plan);
    let device = selection.device;
    thresholds.commit(selection);
    device
  }

  #[test]
  fn relaxed_when_software_or_npu_is_used() {
    let mut thresholds = ScoreThresholds::new(&[0.25, 0.3], &[0.1, -1.0]).unwrap();
    assert_eq!(thresholds.current(), &[0.25, 0.3]);

    let mixed = plan(4, &[1.0, INF, 1.0, INF, INF]).unwrap();
    assert_eq!(choose(&mut thresholds, &mixed), Some(0.1));
    assert_eq!(thresholds.current(), &[0.1, 0.3]);

    let npu = plan(4, &[INF, 1.0, 1.0, INF, INF]).unwrap();
    assert_eq!(choose(&mut thresholds, &npu), Some(0.1));
    assert_eq!(thresholds.current(), &[0.1, 0.3]);

    let streaming = plan(4, &[INF, INF, 1.0, 1.0, 1.0]).unwrap();
    assert_eq!(choose(&mut thresholds, &streaming), Some(0.25));
    assert_eq!(thresholds.current(), &[0.25, 0.3]);
  }

  #[test]
  fn unset_original_keeps_current() {
    let mut thresholds = ScoreThresholds::new(&[-1.0], &[0.05]).unwrap();
    assert_eq!(thresholds.current(), &[0.001, 0.001]);

    let mixed = plan(2, &[1.0, 1.0, INF, INF, INF]).unwrap();
    assert_eq!(choose(&mut thresholds, &mixed), Some(0.05));
    assert_eq!(thresholds.current(), &[0.05, 0.001]);

    // 原始阈值未设置，回到流式设备时保持放宽后的值，也不推送
    let streaming = plan(2, &[INF, INF, 1.0, INF, INF]).unwrap();
    assert_eq!(choose(&mut thresholds, &streaming), None);
    assert_eq!(thresholds.current(), &[0.05, 0.001]);
  }

  #[test]
  fn unconfigured_heads_push_nothing() {
    let thresholds = ScoreThresholds::default();
    let streaming = plan(3, &[INF, INF, 1.0, INF, INF]).unwrap();
    assert_eq!(thresholds.select(&streaming).device, None);

    // 只设置第二个检测头时，设备阈值仍未设置
    let thresholds = ScoreThresholds::new(&[-1.0, 0.4], &[]).unwrap();
    assert_eq!(thresholds.select(&streaming).device, None);
  }

  #[test]
  fn select_leaves_current_until_commit() {
    let thresholds = ScoreThresholds::new(&[0.25], &[0.1]).unwrap();
    let mixed = plan(2, &[1.0, INF, 1.0, INF, INF]).unwrap();
    let selection = thresholds.select(&mixed);
    assert_eq!(selection.current, vec![0.1, 0.001]);
    assert_eq!(thresholds.current(), &[0.25, 0.001]);
  }

  #[test]
  fn rejects_invalid_values() {
    assert!(matches!(
      ScoreThresholds::new(&[f32::NAN], &[]),
      Err(ThresholdError::InvalidValue { head: 0, .. })
    ));
    assert_eq!(
      ScoreThresholds::new(&[0.2], &[0.1, 1.5]),
      Err(ThresholdError::InvalidValue {
        head: 1,
        value: 1.5
      })
    );
  }
}
