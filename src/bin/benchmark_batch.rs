// 该文件是 Hexi （河西） 项目的一部分。
// src/bin/benchmark_batch.rs - 批次基准测试
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
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::info;
use url::Url;

use hexi::{
  FromUrl,
  binding::ModelSource,
  engine::Engine,
  scheduler::CostTable,
  session::{BackendFactory, BackendId, simulated::SimulatedFactory},
  task::{ContinuousTask, RepeatShotTask, Task, TaskSummary, describe_counts},
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
  /// 进程内模拟后端
  Simulated,
  /// Rockchip NPU 运行时（需要 rknpu 特性）
  Rknpu,
}

/// Hexi 批次基准测试参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// 模型地址，例如 model:///models/yolo.tflitehef?batch=8
  #[arg(long, value_name = "MODEL")]
  model: Url,
  /// 后端实现
  #[arg(long, value_enum, default_value = "simulated")]
  backend: Backend,
  /// 代价系数，顺序为 software,npu,streaming-1,streaming-2,streaming-3
  #[arg(long, value_delimiter = ',')]
  costs: Vec<f64>,
  /// 原始分数阈值，负数表示不设置
  #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
  thresholds: Vec<f32>,
  /// 放宽后的分数阈值，负数表示不设置
  #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
  relaxed: Vec<f32>,
  /// 重复批次数
  #[arg(long, default_value_t = 100)]
  repeat: usize,
  /// 持续运行直到收到中断信号
  #[arg(long)]
  continuous: bool,
  /// 持续运行时的最大批次数
  #[arg(long)]
  batches: Option<usize>,
  /// 模拟后端的单条目耗时（毫秒），顺序同 --costs
  #[arg(long, value_delimiter = ',')]
  latency_ms: Vec<u64>,
  /// RKNPU 输入形状，例如 1,640,640,3
  #[arg(long, value_delimiter = ',')]
  input_shape: Vec<i64>,
  /// RKNPU 输出形状，可重复，例如 --output-shape 1,84,8400
  #[arg(long)]
  output_shape: Vec<String>,
  /// 计时报告输出路径（JSON）
  #[arg(long, value_name = "REPORT")]
  report: Option<PathBuf>,
}

fn simulated(args: &Args) -> SimulatedFactory {
  BackendId::SCHEDULABLE
    .into_iter()
    .zip(args.latency_ms.iter())
    .fold(SimulatedFactory::default(), |factory, (backend, &ms)| {
      factory.latency(backend, Duration::from_millis(ms))
    })
}

#[cfg(feature = "rknpu")]
fn rknpu(args: &Args) -> Result<Arc<dyn BackendFactory>> {
  use hexi::{
    session::rknpu::RknpuFactory,
    tensor::{ElementType, TensorDescriptor},
  };

  let input = TensorDescriptor::allocate("input", args.input_shape.clone(), ElementType::U8)?;
  let outputs = args
    .output_shape
    .iter()
    .enumerate()
    .map(|(i, shape)| -> Result<TensorDescriptor> {
      let shape = shape
        .split(',')
        .map(|d| d.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()?;
      Ok(TensorDescriptor::allocate(
        format!("output{}", i),
        shape,
        ElementType::F32,
      )?)
    })
    .collect::<Result<Vec<_>>>()?;
  Ok(Arc::new(RknpuFactory::new(vec![input], outputs)?))
}

#[cfg(not(feature = "rknpu"))]
fn rknpu(_args: &Args) -> Result<Arc<dyn BackendFactory>> {
  bail!("未启用 rknpu 特性")
}

fn write_report(args: &Args, engine: &Engine, summary: &TaskSummary, path: &Path) -> Result<()> {
  let batches: Vec<_> = summary
    .batches
    .iter()
    .map(|report| {
      json!({
        "sum_turnaround_ms": report.sum_turnaround_ms,
        "max_turnaround_ms": report.max_turnaround_ms,
        "elapsed_ms": report.elapsed_ms,
        "counts": report.counts(),
      })
    })
    .collect();
  let counts: serde_json::Map<_, _> = describe_counts(&summary.backend_counts())
    .into_iter()
    .map(|(backend, count)| (backend.to_string(), json!(count)))
    .collect();

  let value = json!({
    "timestamp": Utc::now().to_rfc3339(),
    "model": args.model.as_str(),
    "batch_size": engine.batch_size(),
    "costs": engine.scheduler_params().coefficients(),
    "score_thresholds": engine.score_thresholds(),
    "mean_sum_turnaround_ms": summary.mean_sum_turnaround_ms(),
    "mean_max_turnaround_ms": summary.mean_max_turnaround_ms(),
    "mean_elapsed_ms": summary.mean_elapsed_ms(),
    "backend_counts": counts,
    "batches": batches,
  });
  std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
  info!("计时报告已写入 {}", path.display());
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("模型地址: {}", args.model);

  let source = ModelSource::from_url(&args.model)?;
  let factory: Arc<dyn BackendFactory> = match args.backend {
    Backend::Simulated => Arc::new(simulated(&args)),
    Backend::Rknpu => rknpu(&args)?,
  };

  let mut engine = Engine::bind(&source, factory)?;
  for backend in engine.backends() {
    match backend.delegate {
      Some(delegate) => info!("后端: {} (代理 {})", backend.id, delegate),
      None => info!("后端: {}", backend.id),
    }
  }
  if !args.costs.is_empty() {
    engine.set_scheduler_params(CostTable::from_slice(&args.costs)?)?;
  }
  if !args.thresholds.is_empty() || !args.relaxed.is_empty() {
    engine.set_score_thresholds(&args.thresholds, &args.relaxed)?;
  }

  // 每个条目的首个元素写入条目编号
  for index in 0..engine.inputs().len() {
    let len = engine.inputs()[index].item_len();
    for item in 0..engine.batch_size() {
      let tag = (item % 256) as u8;
      let mut data = vec![0u8; len];
      data[0] = tag;
      if engine.write_input(index, item, &data).is_err() {
        let mut data = vec![0f32; len];
        data[0] = tag as f32;
        engine.write_input(index, item, &data)?;
      }
    }
  }

  let summary = if args.continuous {
    ContinuousTask::default()
      .with_batch_number(args.batches)
      .run_task(&mut engine)?
  } else {
    if args.repeat == 0 {
      bail!("--repeat 必须大于 0");
    }
    RepeatShotTask::default()
      .with_repeat(args.repeat)
      .run_task(&mut engine)?
  };

  for (backend, count) in describe_counts(&summary.backend_counts()) {
    info!("{}: {} 个条目", backend, count);
  }
  if let Some(path) = &args.report {
    write_report(&args, &engine, &summary, path)?;
  }

  Ok(())
}
