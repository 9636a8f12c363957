// 该文件是 Hexi （河西） 项目的一部分。
// src/coordinator.rs - 批次协调
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
  sync::{Arc, Mutex},
  thread,
  time::Instant,
};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  scheduler::BatchPlan,
  session::{BackendId, BackendSession},
  sync::{Latch, lock},
  telemetry::{BatchItem, BatchReport, ItemState, millis},
  unified::{IoRange, UnifiedIo},
};

pub mod dedicated;

use dedicated::{DedicatedHandle, Job};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
  #[error("{backend} 处理条目 {index} 失败: {reason}")]
  Invoke {
    backend: BackendId,
    index: usize,
    reason: String,
  },
  #[error("{0} 工作线程 panic")]
  WorkerPanicked(BackendId),
  #[error("{0} 工作线程已停止")]
  WorkerStopped(BackendId),
  #[error("无法启动 {backend} 工作线程: {reason}")]
  Spawn { backend: BackendId, reason: String },
}

impl BatchError {
  pub fn backend(&self) -> BackendId {
    match self {
      BatchError::Invoke { backend, .. } | BatchError::Spawn { backend, .. } => *backend,
      BatchError::WorkerPanicked(backend) | BatchError::WorkerStopped(backend) => *backend,
    }
  }
}

/// 单个条目的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
  Completed { turnaround_ms: f64 },
  Failed { reason: String },
}

/// 一次 `invoke` 的全部状态：划分、逐条目闩锁和整批屏障。
///
/// 每次调用都新建一个，旧批次的读者仍然持有旧的 `Arc`，不会被新批次影响。
#[derive(Debug)]
pub struct Batch {
  plan: BatchPlan,
  started: Instant,
  items: Vec<Latch<ItemOutcome>>,
  barrier: Latch<Result<BatchReport, BatchError>>,
}

impl Batch {
  pub fn new(plan: BatchPlan) -> Self {
    let items = (0..plan.len()).map(|_| Latch::new()).collect();
    Batch {
      plan,
      started: Instant::now(),
      items,
      barrier: Latch::new(),
    }
  }

  pub fn plan(&self) -> &BatchPlan {
    &self.plan
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// 阻塞到条目 `index` 完成或失败；越界返回 `None`
  pub fn wait_item(&self, index: usize) -> Option<ItemOutcome> {
    self.items.get(index).map(Latch::wait)
  }

  /// 条目当前状态的快照，不阻塞
  pub fn item(&self, index: usize) -> Option<BatchItem> {
    let latch = self.items.get(index)?;
    let backend_id = self.plan.backend_of(index);
    let (state, turnaround_ms) = match latch.try_get() {
      Some(ItemOutcome::Completed { turnaround_ms }) => (ItemState::Completed, turnaround_ms),
      Some(ItemOutcome::Failed { .. }) => (ItemState::Failed, 0.0),
      None if backend_id == BackendId::None => (ItemState::Pending, 0.0),
      None => (ItemState::Assigned, 0.0),
    };
    Some(BatchItem {
      index,
      backend_id,
      state,
      turnaround_ms,
    })
  }

  /// 阻塞到整批结束
  pub fn wait(&self) -> Result<BatchReport, BatchError> {
    self.barrier.wait()
  }

  pub fn is_finished(&self) -> bool {
    self.barrier.is_released()
  }

  fn complete(&self, index: usize) {
    let turnaround_ms = millis(self.started.elapsed());
    if let Some(latch) = self.items.get(index) {
      latch.release(ItemOutcome::Completed { turnaround_ms });
    }
  }

  fn fail(&self, index: usize, reason: &str) {
    if let Some(latch) = self.items.get(index) {
      latch.release(ItemOutcome::Failed {
        reason: reason.to_string(),
      });
    }
  }

  fn report(&self) -> BatchReport {
    let items = (0..self.items.len()).filter_map(|i| self.item(i)).collect();
    BatchReport::new(items, self.started.elapsed())
  }

  fn finish(&self, result: Result<BatchReport, BatchError>) {
    self.barrier.release(result);
  }
}

/// 按升序处理一个后端分到的条目。
///
/// 某个条目失败时，该条目与其后尚未处理的条目都以失败释放，并返回错误。
pub(crate) fn drive(
  session: &mut dyn BackendSession,
  io: &UnifiedIo,
  range: &IoRange,
  batch: &Batch,
  items: &[usize],
) -> Result<(), BatchError> {
  let backend = session.backend();
  for (position, &index) in items.iter().enumerate() {
    match session.run_item(io, range, index) {
      Ok(()) => batch.complete(index),
      Err(e) => {
        let reason = e.to_string();
        error!("{} 处理条目 {} 失败: {}", backend, index, reason);
        for &rest in &items[position..] {
          batch.fail(rest, &reason);
        }
        return Err(BatchError::Invoke {
          backend,
          index,
          reason,
        });
      }
    }
  }
  Ok(())
}

/// 可以在调用期线程上使用的会话
pub(crate) type SharedSession = Arc<Mutex<Box<dyn BackendSession + Send>>>;

#[derive(Clone)]
pub(crate) struct Lane {
  pub backend: BackendId,
  pub session: SharedSession,
  pub range: IoRange,
}

/// 把一个批次派发给各后端并汇总结果
#[derive(Clone)]
pub(crate) struct Coordinator {
  io: Arc<UnifiedIo>,
  dedicated: Vec<(DedicatedHandle, IoRange)>,
  lanes: Vec<Lane>,
}

impl Coordinator {
  pub fn new(
    io: Arc<UnifiedIo>,
    dedicated: Vec<(DedicatedHandle, IoRange)>,
    lanes: Vec<Lane>,
  ) -> Self {
    Coordinator {
      io,
      dedicated,
      lanes,
    }
  }

  /// 启动一个分离的协调线程，立即返回
  pub fn dispatch(&self, batch: Arc<Batch>) -> std::io::Result<()> {
    let coordinator = self.clone();
    thread::Builder::new()
      .name("hexi-coordinator".to_string())
      .spawn(move || coordinator.coordinate(&batch))?;
    Ok(())
  }

  fn serves(&self, backend: BackendId) -> bool {
    self.dedicated.iter().any(|(handle, _)| handle.backend() == backend)
      || self.lanes.iter().any(|lane| lane.backend == backend)
  }

  fn coordinate(&self, batch: &Arc<Batch>) {
    let plan = batch.plan();
    let mut failures = Vec::new();

    for backend in BackendId::SCHEDULABLE {
      if plan.count(backend) > 0 && !self.serves(backend) {
        failures.push(BatchError::WorkerStopped(backend));
      }
    }

    // 持久工作线程上的份额先派发，之后只在它们的结束信号上等待
    let mut submitted = Vec::new();
    for (handle, range) in &self.dedicated {
      let items = plan.partition(handle.backend());
      if items.is_empty() {
        continue;
      }
      debug!("{} 分到 {} 个条目", handle.backend(), items.len());
      let job = Job {
        batch: batch.clone(),
        io: self.io.clone(),
        range: range.clone(),
        items,
      };
      match handle.submit(job) {
        Ok(()) => submitted.push(handle),
        Err(e) => failures.push(e),
      }
    }

    thread::scope(|scope| {
      let mut workers = Vec::new();
      for lane in &self.lanes {
        let items = plan.partition(lane.backend);
        if items.is_empty() {
          continue;
        }
        debug!("{} 分到 {} 个条目", lane.backend, items.len());
        let io = &self.io;
        let spawned = thread::Builder::new()
          .name(format!("hexi-{}", lane.backend))
          .spawn_scoped(scope, move || {
            let mut session = lock(&lane.session);
            drive(session.as_mut(), io, &lane.range, batch, &items)
          });
        match spawned {
          Ok(worker) => workers.push((lane.backend, worker)),
          Err(e) => failures.push(BatchError::Spawn {
            backend: lane.backend,
            reason: e.to_string(),
          }),
        }
      }

      for handle in submitted {
        if let Err(e) = handle.collect() {
          failures.push(e);
        }
      }

      for (backend, worker) in workers {
        match worker.join() {
          Ok(Ok(())) => {}
          Ok(Err(e)) => failures.push(e),
          Err(_) => failures.push(BatchError::WorkerPanicked(backend)),
        }
      }
    });

    // 没有被任何工作线程释放的条目不能让读者永远阻塞
    if let Some(first) = failures.first() {
      let reason = first.to_string();
      for index in 0..batch.len() {
        batch.fail(index, &reason);
      }
    }

    let result = match failures.into_iter().next() {
      None => {
        let report = batch.report();
        info!(
          "批次完成: {} 个条目, 总周转 {:.2} ms, 最大 {:.2} ms",
          report.len(),
          report.sum_turnaround_ms,
          report.max_turnaround_ms
        );
        Ok(report)
      }
      Some(e) => {
        error!("批次失败: {}", e);
        Err(e)
      }
    };
    batch.finish(result);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    scheduler::plan,
    coordinator::dedicated::DedicatedWorker,
    session::{BackendFactory, Invoke, NpuSession, StreamingSession, simulated::SimulatedFactory},
  };
  use std::{path::Path, time::Duration};

  const INF: f64 = f64::INFINITY;

  /// NPU 在持久工作线程上，流式设备 1 作为调用期线程
  fn setup(factory: &SimulatedFactory, batch_size: usize) -> (Coordinator, DedicatedWorker) {
    let npu_factory = factory.clone();
    let (worker, (npu_input, npu_output)) = DedicatedWorker::spawn(BackendId::Npu, move || {
      let native = npu_factory.npu(Path::new("m.mxq"))?;
      let layout = (native.inputs()[0].clone(), native.outputs()[0].clone());
      let session: Box<dyn BackendSession> = Box::new(NpuSession::new(native));
      Ok((session, layout))
    })
    .unwrap();
    let stream = factory.streaming(Path::new("m.hef"), 0).unwrap();
    let stream = StreamingSession::new(0, stream).unwrap();

    // 两个后端共用同一段统一输出，输出形状一致
    let io = Arc::new(UnifiedIo::new(
      vec![
        npu_input.with_leading_dim(batch_size).unwrap(),
        stream.inputs()[0].with_leading_dim(batch_size).unwrap(),
      ],
      vec![npu_output.with_leading_dim(batch_size).unwrap()],
    ));
    let stream: Box<dyn BackendSession + Send> = Box::new(stream);
    let dedicated = vec![(
      worker.handle(),
      IoRange {
        inputs: 0..1,
        outputs: 0..1,
      },
    )];
    let lanes = vec![Lane {
      backend: BackendId::Streaming1,
      session: Arc::new(Mutex::new(stream)),
      range: IoRange {
        inputs: 1..2,
        outputs: 0..1,
      },
    }];
    (Coordinator::new(io, dedicated, lanes), worker)
  }

  #[test]
  fn every_item_completes_with_its_backend() {
    let factory = SimulatedFactory::default()
      .latency(BackendId::Npu, Duration::from_millis(2))
      .latency(BackendId::Streaming1, Duration::from_millis(2));
    let (coordinator, _worker) = setup(&factory, 6);
    for item in 0..6 {
      coordinator.io.input_mut(0).unwrap().write_item(item, &[item as f32, 0.0, 0.0, 0.0]).unwrap();
      coordinator.io.input_mut(1).unwrap().write_item(item, &[item as u8, 0, 0, 0]).unwrap();
    }

    let batch = Arc::new(Batch::new(plan(6, &[INF, 1.0, 1.0, INF, INF]).unwrap()));
    coordinator.dispatch(batch.clone()).unwrap();
    let report = batch.wait().unwrap();

    assert_eq!(report.count(BackendId::Npu), 3);
    assert_eq!(report.count(BackendId::Streaming1), 3);
    let output = coordinator.io.output(0).unwrap();
    for item in 0..6 {
      assert!(matches!(batch.wait_item(item), Some(ItemOutcome::Completed { .. })));
      let code = match batch.plan().backend_of(item) {
        BackendId::Npu => 2.0,
        _ => 3.0,
      };
      assert_eq!(output.item::<f32>(item).unwrap(), &[item as f32, code]);
    }
    let sum: f64 = report.items.iter().map(|item| item.turnaround_ms).sum();
    assert!((report.sum_turnaround_ms - sum).abs() < 1e-9);
  }

  #[test]
  fn failure_releases_remaining_items() {
    let factory = SimulatedFactory::default().fail_on(BackendId::Npu, 1);
    let (coordinator, _worker) = setup(&factory, 8);
    let batch = Arc::new(Batch::new(plan(8, &[INF, 1.0, 1.0, INF, INF]).unwrap()));
    coordinator.dispatch(batch.clone()).unwrap();

    let error = batch.wait().unwrap_err();
    assert_eq!(error.backend(), BackendId::Npu);
    assert!(matches!(error, BatchError::Invoke { index: 2, .. }));

    let npu = batch.plan().partition(BackendId::Npu);
    assert!(matches!(batch.wait_item(npu[0]), Some(ItemOutcome::Completed { .. })));
    for &index in &npu[1..] {
      assert!(matches!(batch.wait_item(index), Some(ItemOutcome::Failed { .. })));
    }
    for index in batch.plan().partition(BackendId::Streaming1) {
      assert_eq!(batch.item(index).unwrap().state, ItemState::Completed);
    }
  }

  #[test]
  fn software_share_without_worker_fails() {
    let factory = SimulatedFactory::default();
    let (coordinator, _worker) = setup(&factory, 2);
    let batch = Arc::new(Batch::new(plan(2, &[1.0, INF, INF, INF, INF]).unwrap()));
    coordinator.dispatch(batch.clone()).unwrap();
    assert_eq!(
      batch.wait(),
      Err(BatchError::WorkerStopped(BackendId::Software))
    );
    assert!(matches!(batch.wait_item(1), Some(ItemOutcome::Failed { .. })));
    assert_eq!(batch.wait_item(2), None);
  }
}
