// 该文件是 Hexi （河西） 项目的一部分。
// tests/engine.rs - 引擎集成测试
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
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use hexi::{
  FromUrl,
  binding::ModelSource,
  engine::{Engine, EngineError},
  session::{
    BackendFactory, BackendId, Delegate,
    simulated::{SimulatedFactory, backend_code},
  },
  telemetry::ItemState,
};
use url::Url;

const INF: f64 = f64::INFINITY;

fn source(url: &str) -> ModelSource {
  ModelSource::from_url(&Url::parse(url).unwrap()).unwrap()
}

/// 在所有统一输入中写入条目标记
fn tag_items(engine: &Engine, offset: usize) {
  for item in 0..engine.batch_size() {
    let tag = (item + offset) as u8;
    for index in 0..engine.inputs().len() {
      let len = engine.inputs()[index].item_len();
      let mut bytes = vec![0u8; len];
      bytes[0] = tag;
      if engine.write_input(index, item, &bytes).is_err() {
        let mut floats = vec![0f32; len];
        floats[0] = tag as f32;
        engine.write_input(index, item, &floats).unwrap();
      }
    }
  }
}

/// 混合绑定中软件解释器的输出在 0，主加速器的输出在 1
fn output_index(backend: BackendId) -> usize {
  if backend == BackendId::Software { 0 } else { 1 }
}

#[test]
fn every_item_is_processed_exactly_once() {
  let factory = SimulatedFactory::default()
    .latency(BackendId::Software, Duration::from_millis(1))
    .latency(BackendId::Streaming1, Duration::from_millis(1))
    .latency(BackendId::Streaming2, Duration::from_millis(1));
  let ledger = factory.ledger();
  let mut engine = Engine::bind(
    &source("model:///m/yolo.tflitehef?devices=2&batch=100"),
    Arc::new(factory),
  )
  .unwrap();
  assert_eq!(engine.backends().len(), 3);

  tag_items(&engine, 0);
  engine.invoke().unwrap();
  let report = engine.wait_batch().unwrap();

  let counts = ledger.tag_counts();
  assert_eq!(ledger.invocations().len(), 100);
  for tag in 0..100u32 {
    assert_eq!(counts.get(&tag), Some(&1), "条目 {} 的调用次数", tag);
  }
  assert_eq!(report.count(BackendId::Software) + report.count(BackendId::Streaming1) + report.count(BackendId::Streaming2), 100);

  for item in 0..100 {
    let backend = engine.item_backend(item).unwrap();
    let output = engine.read_output::<f32>(output_index(backend), item).unwrap();
    assert_eq!(output, vec![item as f32, backend_code(backend)]);
  }
}

#[test]
fn pinned_sessions_stay_on_their_threads() {
  let factory = SimulatedFactory::default();
  let ledger = factory.ledger();
  let mut engine = Engine::bind(&source("model:///m/yolo.tflitemxq?batch=8"), Arc::new(factory)).unwrap();

  for _ in 0..3 {
    engine.invoke().unwrap();
    engine.wait_batch().unwrap();
  }

  let threads = ledger.software_threads();
  assert_eq!(threads.len(), 1);
  assert_ne!(threads[0], thread::current().id());
  let software: Vec<_> = ledger
    .invocations()
    .into_iter()
    .filter(|call| call.backend == BackendId::Software)
    .collect();
  assert_eq!(software.len(), 12);
  assert!(software.iter().all(|call| call.thread == threads[0]));

  // NPU 会话同样留在自己的线程上，不随每个批次换线程
  let npu: Vec<_> = ledger
    .invocations()
    .into_iter()
    .filter(|call| call.backend == BackendId::Npu)
    .collect();
  assert_eq!(npu.len(), 12);
  assert!(npu.iter().all(|call| call.thread == npu[0].thread));
  assert_ne!(npu[0].thread, threads[0]);
  assert_ne!(npu[0].thread, thread::current().id());
}

#[test]
fn readiness_blocks_until_the_item_is_done() {
  let factory = SimulatedFactory::default().latency(BackendId::Npu, Duration::from_millis(100));
  let mut engine = Engine::bind(&source("model:///m/yolo.mxq?batch=2"), Arc::new(factory)).unwrap();

  let start = Instant::now();
  engine.invoke().unwrap();
  assert!(start.elapsed() < Duration::from_millis(100));
  assert_eq!(engine.item(0).unwrap().state, ItemState::Assigned);
  assert_eq!(engine.item(0).unwrap().backend_id, BackendId::Npu);

  assert_eq!(engine.item_backend(0).unwrap(), BackendId::Npu);
  assert!(start.elapsed() >= Duration::from_millis(90));
  assert!(engine.is_npu_output(1).unwrap());
  assert!(start.elapsed() >= Duration::from_millis(190));
  assert_eq!(engine.item(1).unwrap().state, ItemState::Completed);
}

#[test]
fn telemetry_waits_for_the_last_worker() {
  let factory = SimulatedFactory::default()
    .latency(BackendId::Software, Duration::from_millis(10))
    .latency(BackendId::Npu, Duration::from_millis(40));
  let mut engine = Engine::bind(&source("model:///m/yolo.tflitemxq?batch=6"), Arc::new(factory)).unwrap();

  let start = Instant::now();
  engine.invoke().unwrap();
  let sum = engine.sum_turnaround().unwrap();
  // NPU 分到 3 个条目，串行执行
  assert!(start.elapsed() >= Duration::from_millis(110));

  let report = engine.wait_batch().unwrap();
  let total: f64 = report.items.iter().map(|item| item.turnaround_ms).sum();
  assert!((sum - total).abs() < 1e-9);
  let max = report
    .items
    .iter()
    .map(|item| item.turnaround_ms)
    .fold(0.0, f64::max);
  assert_eq!(engine.max_turnaround().unwrap(), max);
  assert!(max >= 110.0);
  assert!(report.items.iter().all(|item| item.state == ItemState::Completed));
}

#[test]
fn proportional_share_through_the_engine() {
  let mut engine = Engine::bind(
    &source("model:///m/yolo.tflitemxq?batch=300"),
    Arc::new(SimulatedFactory::default()),
  )
  .unwrap();
  engine.set_scheduler_params([1.0, 2.0, 1.0, 1.0, 1.0].into()).unwrap();
  engine.invoke().unwrap();
  let report = engine.wait_batch().unwrap();
  assert_eq!(report.count(BackendId::Software), 200);
  assert_eq!(report.count(BackendId::Npu), 100);
  // 流式设备不可用，系数被忽略
  assert_eq!(report.count(BackendId::Streaming1), 0);
}

#[test]
fn thresholds_follow_the_plan() {
  let factory = SimulatedFactory::default();
  let ledger = factory.ledger();
  let mut engine = Engine::bind(&source("model:///m/yolo.tflitehef?batch=4"), Arc::new(factory)).unwrap();
  engine.set_score_thresholds(&[0.5, 0.4], &[0.2, -1.0]).unwrap();
  assert_eq!(engine.score_thresholds(), vec![0.5, 0.4]);

  // 有条目交给软件解释器：放宽
  engine.invoke().unwrap();
  engine.wait_batch().unwrap();
  assert_eq!(engine.score_thresholds(), vec![0.2, 0.4]);
  for backend in [BackendId::Streaming1, BackendId::Streaming2, BackendId::Streaming3] {
    assert_eq!(ledger.thresholds(backend), vec![0.2]);
  }

  // 只用流式设备：恢复原始阈值
  engine.set_scheduler_params([INF, 1.0, 1.0, 1.0, 1.0].into()).unwrap();
  engine.invoke().unwrap();
  engine.wait_batch().unwrap();
  assert_eq!(engine.score_thresholds(), vec![0.5, 0.4]);
  assert_eq!(ledger.thresholds(BackendId::Streaming2), vec![0.5]);
}

#[test]
fn rebinding_the_same_model_is_independent() {
  let factory = Arc::new(SimulatedFactory::default().latency(BackendId::Software, Duration::from_millis(1)));
  let ledger = factory.ledger();
  let source = source("model:///m/yolo.tflitehef?devices=1&batch=20");

  let workers: Vec<_> = [0usize, 100]
    .into_iter()
    .map(|offset| {
      let source = source.clone();
      let factory: Arc<dyn BackendFactory> = factory.clone();
      thread::spawn(move || {
        let mut engine = Engine::bind(&source, factory).unwrap();
        for _ in 0..3 {
          tag_items(&engine, offset);
          engine.invoke().unwrap();
          engine.wait_batch().unwrap();
          for item in 0..20 {
            let backend = engine.item_backend(item).unwrap();
            let output = engine.read_output::<f32>(output_index(backend), item).unwrap();
            assert_eq!(output[0], (item + offset) as f32);
          }
        }
      })
    })
    .collect();
  for worker in workers {
    worker.join().unwrap();
  }

  // 每个绑定有自己的软件解释器线程，每个条目标记在各自的三个批次中各出现一次
  assert_eq!(ledger.software_threads().len(), 2);
  assert_ne!(ledger.software_threads()[0], ledger.software_threads()[1]);
  assert_eq!(ledger.invocations().len(), 120);
  let counts = ledger.tag_counts();
  for tag in (0..20u32).chain(100..120) {
    assert_eq!(counts.get(&tag), Some(&3), "条目标记 {}", tag);
  }
}

#[test]
fn failure_releases_latches_as_failed() {
  let factory = SimulatedFactory::default().fail_on(BackendId::Streaming1, 0);
  let mut engine = Engine::bind(&source("model:///m/yolo.hef?devices=2&batch=6"), Arc::new(factory)).unwrap();
  engine.invoke().unwrap();

  assert!(matches!(engine.wait_batch(), Err(EngineError::Batch(_))));
  assert!(engine.sum_turnaround().is_err());
  for item in 0..6 {
    match engine.item_backend(item) {
      Ok(backend) => assert_eq!(backend, BackendId::Streaming2),
      Err(EngineError::ItemFailed { backend, .. }) => assert_eq!(backend, BackendId::Streaming1),
      Err(e) => panic!("意外的错误: {}", e),
    }
    let state = engine.item(item).unwrap().state;
    assert!(state == ItemState::Completed || state == ItemState::Failed);
  }

  // 故障只注入在第一次调用，下一批次恢复正常
  engine.invoke().unwrap();
  assert_eq!(engine.wait_batch().unwrap().len(), 6);
}

#[test]
fn delegate_fallback_and_exclusion() {
  let factory = SimulatedFactory::default().delegates(&[Delegate::Dsp, Delegate::Cpu]);
  let engine = Engine::bind(&source("model:///m/yolo.tflitemxq"), Arc::new(factory)).unwrap();
  assert_eq!(engine.backends()[0].delegate, Some(Delegate::Dsp));

  // 混合模式下 CPU 不在默认代理列表中，软件解释器被排除
  let factory = SimulatedFactory::default().delegates(&[Delegate::Cpu]);
  let mut engine = Engine::bind(&source("model:///m/yolo.tflitemxq?batch=5"), Arc::new(factory)).unwrap();
  assert!(engine.backends().iter().all(|b| b.id != BackendId::Software));
  engine.set_scheduler_params([0.1, 10.0, 1.0, 1.0, 1.0].into()).unwrap();
  engine.invoke().unwrap();
  assert_eq!(engine.wait_batch().unwrap().count(BackendId::Npu), 5);
  assert!(!engine.is_software_output(0).unwrap());

  // 显式允许 CPU 时软件解释器保留
  let factory = SimulatedFactory::default().delegates(&[Delegate::Cpu]);
  let engine = Engine::bind(
    &source("model:///m/yolo.tflitemxq?delegate=gpu,cpu"),
    Arc::new(factory),
  )
  .unwrap();
  assert_eq!(engine.backends()[0].delegate, Some(Delegate::Cpu));
}
