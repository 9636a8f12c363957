// 该文件是 Hexi （河西） 项目的一部分。
// src/engine.rs - 推理引擎
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

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  binding::{self, BackendInfo, BindError, Binding, BindingMode, ModelSource},
  coordinator::{Batch, BatchError, Coordinator, ItemOutcome},
  scheduler::{self, CostTable, ScheduleError},
  session::{BackendFactory, BackendId, SessionError},
  sync::lock,
  telemetry::{BatchItem, BatchReport},
  tensor::{Element, TensorDescriptor, TensorError},
  threshold::{ScoreThresholds, ThresholdError},
  unified::{IoError, UnifiedIo},
};

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("绑定错误: {0}")]
  Bind(#[from] BindError),
  #[error("调度错误: {0}")]
  Schedule(#[from] ScheduleError),
  #[error("阈值错误: {0}")]
  Threshold(#[from] ThresholdError),
  #[error("缓冲区错误: {0}")]
  Io(#[from] IoError),
  #[error("张量错误: {0}")]
  Tensor(#[from] TensorError),
  #[error("后端会话错误: {0}")]
  Session(#[from] SessionError),
  #[error("批次失败: {0}")]
  Batch(#[from] BatchError),
  #[error("无法启动协调线程: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("批次大小必须大于 0")]
  ZeroBatch,
  #[error("尚未调用 invoke")]
  NoBatch,
  #[error("条目 {index} 超出批次范围 {batch}")]
  ItemOutOfRange { index: usize, batch: usize },
  #[error("条目 {index} 在 {backend} 上失败: {reason}")]
  ItemFailed {
    index: usize,
    backend: BackendId,
    reason: String,
  },
}

/// 异构批量推理引擎。
///
/// 持有一次模型绑定、统一输入输出缓冲区、调度与阈值配置，以及当前批次。
/// [`Engine::invoke`] 只负责划分与派发，立即返回；调用方随后逐条目等待结果。
pub struct Engine {
  binding: Binding,
  io: Arc<UnifiedIo>,
  coordinator: Coordinator,
  costs: CostTable,
  thresholds: ScoreThresholds,
  batch_size: usize,
  current: Option<Arc<Batch>>,
}

impl Engine {
  pub fn bind(source: &ModelSource, factory: Arc<dyn BackendFactory>) -> Result<Self, EngineError> {
    let batch_size = source.options().batch_size;
    if batch_size == 0 {
      return Err(EngineError::ZeroBatch);
    }

    let binding = binding::bind(source, factory)?;
    let inputs = binding
      .inputs()
      .iter()
      .map(|t| t.with_leading_dim(batch_size))
      .collect::<Result<Vec<_>, _>>()?;
    let outputs = binding
      .outputs()
      .iter()
      .map(|t| t.with_leading_dim(batch_size))
      .collect::<Result<Vec<_>, _>>()?;
    let io = Arc::new(UnifiedIo::new(inputs, outputs));

    let dedicated = binding
      .dedicated
      .iter()
      .map(|d| (d.worker.handle(), d.range.clone()))
      .collect();
    let coordinator = Coordinator::new(io.clone(), dedicated, binding.lanes.clone());

    let backends: Vec<_> = binding.backends().iter().map(|b| b.id.to_string()).collect();
    info!(
      "引擎就绪: 批次大小 {}, 后端 [{}]",
      batch_size,
      backends.join(", ")
    );

    Ok(Engine {
      binding,
      io,
      coordinator,
      costs: CostTable::default(),
      thresholds: ScoreThresholds::default(),
      batch_size,
      current: None,
    })
  }

  pub fn mode(&self) -> BindingMode {
    self.binding.mode()
  }

  /// 可调度的后端及软件解释器挂载的代理
  pub fn backends(&self) -> Vec<BackendInfo> {
    self.binding.backends()
  }

  /// 设置各后端的代价系数，不可用的后端始终按正无穷处理
  pub fn set_scheduler_params(&mut self, costs: CostTable) -> Result<(), EngineError> {
    costs.validate()?;
    // 至少要有一个可用后端的系数有限
    scheduler::plan(1, &costs.restricted_to(&self.binding.available()))?;
    debug!("代价系数: {:?}", costs.coefficients());
    self.costs = costs;
    Ok(())
  }

  pub fn scheduler_params(&self) -> CostTable {
    self.costs
  }

  pub fn set_score_thresholds(&mut self, original: &[f32], relaxed: &[f32]) -> Result<(), EngineError> {
    self.thresholds.set(original, relaxed)?;
    Ok(())
  }

  /// 当前有效的分数阈值，按检测头排列
  pub fn score_thresholds(&self) -> Vec<f32> {
    self.thresholds.current().to_vec()
  }

  pub fn batch_size(&self) -> usize {
    self.batch_size
  }

  /// 调整批次大小，统一缓冲区重新分配
  pub fn resize_batch(&mut self, batch_size: usize) -> Result<(), EngineError> {
    if batch_size == 0 {
      return Err(EngineError::ZeroBatch);
    }
    self.settle();
    self.io.resize(batch_size)?;
    self.batch_size = batch_size;
    self.current = None;
    info!("批次大小调整为 {}", batch_size);
    Ok(())
  }

  /// 统一输入的描述，首维为 1
  pub fn inputs(&self) -> &[TensorDescriptor] {
    self.binding.inputs()
  }

  /// 统一输出的描述，首维为 1
  pub fn outputs(&self) -> &[TensorDescriptor] {
    self.binding.outputs()
  }

  fn check_item(&self, index: usize) -> Result<(), EngineError> {
    if index >= self.batch_size {
      return Err(EngineError::ItemOutOfRange {
        index,
        batch: self.batch_size,
      });
    }
    Ok(())
  }

  /// 写入第 `index` 个统一输入中条目 `item` 的数据
  pub fn write_input<T: Element>(&self, index: usize, item: usize, data: &[T]) -> Result<(), EngineError> {
    self.check_item(item)?;
    self.io.input_mut(index)?.write_item(item, data)?;
    Ok(())
  }

  /// 读取第 `index` 个统一输出中条目 `item` 的数据。
  ///
  /// 当前批次中该条目尚未完成时阻塞等待。
  pub fn read_output<T: Element>(&self, index: usize, item: usize) -> Result<Vec<T>, EngineError> {
    self.check_item(item)?;
    if self.current.is_some() {
      self.item_backend(item)?;
    }
    let output = self.io.output(index)?;
    Ok(output.item::<T>(item)?.to_vec())
  }

  /// 等待仍在执行的上一个批次，忽略其结果
  fn settle(&self) {
    if let Some(batch) = &self.current {
      if let Err(e) = batch.wait() {
        warn!("上一个批次失败: {}", e);
      }
    }
  }

  /// 划分当前批次并异步派发，立即返回。
  ///
  /// 上一个批次仍在执行时先等待它结束。
  pub fn invoke(&mut self) -> Result<(), EngineError> {
    self.settle();

    let plan = scheduler::plan(
      self.batch_size,
      &self.costs.restricted_to(&self.binding.available()),
    )?;

    // 流式设备在派发前更新过滤阶段的阈值，推送成功后才采用新的选择
    let selection = self.thresholds.select(&plan);
    if let Some(threshold) = selection.device {
      for lane in self.binding.lanes.iter().filter(|l| l.backend.is_streaming()) {
        lock(&lane.session).set_score_threshold(threshold)?;
      }
    }
    self.thresholds.commit(selection);

    let batch = Arc::new(Batch::new(plan));
    self.coordinator.dispatch(batch.clone())?;
    debug!("批次已派发: {} 个条目", batch.len());
    self.current = Some(batch);
    Ok(())
  }

  fn batch(&self) -> Result<&Arc<Batch>, EngineError> {
    self.current.as_ref().ok_or(EngineError::NoBatch)
  }

  /// 阻塞到条目 `index` 完成，返回处理它的后端
  pub fn item_backend(&self, index: usize) -> Result<BackendId, EngineError> {
    let batch = self.batch()?;
    let outcome = batch.wait_item(index).ok_or(EngineError::ItemOutOfRange {
      index,
      batch: batch.len(),
    })?;
    let backend = batch.plan().backend_of(index);
    match outcome {
      ItemOutcome::Completed { .. } => Ok(backend),
      ItemOutcome::Failed { reason } => Err(EngineError::ItemFailed {
        index,
        backend,
        reason,
      }),
    }
  }

  pub fn is_software_output(&self, index: usize) -> Result<bool, EngineError> {
    Ok(self.item_backend(index)? == BackendId::Software)
  }

  pub fn is_npu_output(&self, index: usize) -> Result<bool, EngineError> {
    Ok(self.item_backend(index)? == BackendId::Npu)
  }

  pub fn is_streaming_output(&self, index: usize) -> Result<bool, EngineError> {
    Ok(self.item_backend(index)?.is_streaming())
  }

  /// 条目状态快照，不阻塞
  pub fn item(&self, index: usize) -> Option<BatchItem> {
    self.current.as_ref()?.item(index)
  }

  /// 阻塞到当前批次结束
  pub fn wait_batch(&self) -> Result<BatchReport, EngineError> {
    Ok(self.batch()?.wait()?)
  }

  /// 当前批次所有条目周转时间之和（毫秒）
  pub fn sum_turnaround(&self) -> Result<f64, EngineError> {
    Ok(self.wait_batch()?.sum_turnaround_ms)
  }

  /// 当前批次最大的条目周转时间（毫秒）
  pub fn max_turnaround(&self) -> Result<f64, EngineError> {
    Ok(self.wait_batch()?.max_turnaround_ms)
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    self.settle();
  }
}
