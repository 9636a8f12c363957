// 该文件是 Hexi （河西） 项目的一部分。
// src/task.rs - 批次任务
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

use std::{sync::mpsc, thread, time::Duration};

use tracing::{info, warn};

use crate::{
  engine::Engine,
  session::{BACKEND_SLOTS, BackendId},
  telemetry::BatchReport,
};

/// 统计平均值时跳过的预热批次数
const WARMUP_BATCHES: usize = 2;

pub trait Task: Sized {
  type Error;
  fn run_task(self, engine: &mut Engine) -> Result<TaskSummary, Self::Error>;
}

/// 一组批次的周转时间汇总
#[derive(Debug, Clone, Default)]
pub struct TaskSummary {
  pub batches: Vec<BatchReport>,
}

impl TaskSummary {
  /// 去掉预热批次后的部分；批次不足时使用全部
  pub fn steady(&self) -> &[BatchReport] {
    if self.batches.len() > WARMUP_BATCHES {
      &self.batches[WARMUP_BATCHES..]
    } else {
      &self.batches
    }
  }

  fn mean(&self, f: impl Fn(&BatchReport) -> f64) -> f64 {
    let steady = self.steady();
    if steady.is_empty() {
      return 0.0;
    }
    steady.iter().map(f).sum::<f64>() / steady.len() as f64
  }

  pub fn mean_sum_turnaround_ms(&self) -> f64 {
    self.mean(|r| r.sum_turnaround_ms)
  }

  pub fn mean_max_turnaround_ms(&self) -> f64 {
    self.mean(|r| r.max_turnaround_ms)
  }

  pub fn mean_elapsed_ms(&self) -> f64 {
    self.mean(|r| r.elapsed_ms)
  }

  /// 全部批次中各后端处理的条目数
  pub fn backend_counts(&self) -> [usize; BACKEND_SLOTS] {
    let mut counts = [0; BACKEND_SLOTS];
    for report in &self.batches {
      for (total, count) in counts.iter_mut().zip(report.counts()) {
        *total += count;
      }
    }
    counts
  }
}

fn run_batch(engine: &mut Engine, index: usize) -> anyhow::Result<BatchReport> {
  engine.invoke()?;
  let report = engine.wait_batch()?;
  info!(
    "({}) 批次完成, 总周转 {:.2} ms, 最大 {:.2} ms",
    index, report.sum_turnaround_ms, report.max_turnaround_ms
  );
  Ok(report)
}

pub struct OneShotTask;

impl Task for OneShotTask {
  type Error = anyhow::Error;

  fn run_task(self, engine: &mut Engine) -> Result<TaskSummary, Self::Error> {
    info!("开始任务...");
    let report = run_batch(engine, 0)?;
    Ok(TaskSummary {
      batches: vec![report],
    })
  }
}

#[derive(Debug)]
pub struct RepeatShotTask {
  repeat: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    RepeatShotTask { repeat: 1000 }
  }
}

impl RepeatShotTask {
  pub fn with_repeat(mut self, repeat: usize) -> Self {
    self.repeat = repeat.max(1);
    self
  }
}

impl Task for RepeatShotTask {
  type Error = anyhow::Error;

  fn run_task(self, engine: &mut Engine) -> Result<TaskSummary, Self::Error> {
    info!("开始任务, 重复 {} 次...", self.repeat);
    let mut summary = TaskSummary::default();
    for i in 0..self.repeat {
      summary.batches.push(run_batch(engine, i)?);
    }

    warn!(
      "平均总周转: {:.2} ms, 平均最大周转: {:.2} ms",
      summary.mean_sum_turnaround_ms(),
      summary.mean_max_turnaround_ms()
    );
    Ok(summary)
  }
}

#[derive(Default, Debug)]
pub struct ContinuousTask {
  batch_number: Option<usize>,
}

impl ContinuousTask {
  pub fn with_batch_number(mut self, batch_number: Option<usize>) -> Self {
    self.batch_number = batch_number;
    self
  }
}

impl Task for ContinuousTask {
  type Error = anyhow::Error;

  fn run_task(self, engine: &mut Engine) -> Result<TaskSummary, Self::Error> {
    info!("开始任务...");
    let (tx, rx) = mpsc::channel();

    let installed = ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    });
    if let Err(e) = installed {
      warn!("无法注册中断处理: {}", e);
    }

    let mut summary = TaskSummary::default();
    loop {
      let index = summary.batches.len();
      summary.batches.push(run_batch(engine, index)?);
      if self.batch_number.is_some_and(|n| summary.batches.len() >= n) {
        info!("达到指定批次数 {}, 退出任务循环", summary.batches.len());
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    info!(
      "任务完成, 共 {} 个批次, 软件解释器处理 {} 个条目",
      summary.batches.len(),
      summary.backend_counts()[0]
    );
    Ok(summary)
  }
}

/// 按后端名称列出条目数，供日志和报告使用
pub fn describe_counts(counts: &[usize; BACKEND_SLOTS]) -> Vec<(BackendId, usize)> {
  BackendId::SCHEDULABLE.into_iter().zip(counts.iter().copied()).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{binding::ModelSource, session::simulated::SimulatedFactory};
  use std::sync::Arc;

  fn report(sum: f64) -> BatchReport {
    BatchReport {
      sum_turnaround_ms: sum,
      max_turnaround_ms: sum / 2.0,
      ..Default::default()
    }
  }

  #[test]
  fn steady_state_skips_warmup() {
    let summary = TaskSummary {
      batches: vec![report(100.0), report(50.0), report(4.0), report(6.0)],
    };
    assert_eq!(summary.steady().len(), 2);
    assert_eq!(summary.mean_sum_turnaround_ms(), 5.0);
    assert_eq!(summary.mean_max_turnaround_ms(), 2.5);

    let short = TaskSummary {
      batches: vec![report(2.0)],
    };
    assert_eq!(short.mean_sum_turnaround_ms(), 2.0);
    assert_eq!(TaskSummary::default().mean_elapsed_ms(), 0.0);
  }

  #[test]
  fn repeat_and_continuous_tasks() {
    let source = ModelSource::new("m.tflitehef").batch_size(6);
    let mut engine = Engine::bind(&source, Arc::new(SimulatedFactory::default())).unwrap();

    let summary = RepeatShotTask::default().with_repeat(4).run_task(&mut engine).unwrap();
    assert_eq!(summary.batches.len(), 4);
    assert_eq!(summary.backend_counts().iter().sum::<usize>(), 24);

    let summary = ContinuousTask::default()
      .with_batch_number(Some(3))
      .run_task(&mut engine)
      .unwrap();
    assert_eq!(summary.batches.len(), 3);

    let summary = OneShotTask.run_task(&mut engine).unwrap();
    assert_eq!(
      describe_counts(&summary.backend_counts()),
      vec![
        (BackendId::Software, 2),
        (BackendId::Npu, 0),
        (BackendId::Streaming1, 2),
        (BackendId::Streaming2, 1),
        (BackendId::Streaming3, 1),
      ]
    );
  }
}
