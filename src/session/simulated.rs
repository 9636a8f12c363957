// 该文件是 Hexi （河西） 项目的一部分。
// src/session/simulated.rs - 模拟后端
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

//! 进程内的模拟后端，用于测试和基准程序。
//!
//! 每个会话只有一个输入，默认一个长度为 2 的 `f32` 输出：
//! 输出的第 0 个元素是输入的第 0 个元素（条目标记），第 1 个元素是
//! [`backend_code`] 给出的后端编码，借此可以核对每个条目由谁处理。
//! 流式设备可以配置多个输出流，每个流内容相同。

use std::{
  collections::HashMap,
  path::Path,
  sync::{Arc, Mutex},
  thread::{self, ThreadId},
  time::Duration,
};

use tracing::{debug, warn};

use crate::{
  session::{
    BACKEND_SLOTS, BackendFactory, BackendId, Delegate, Invoke, SessionError, Stream,
  },
  sync::lock,
  tensor::{ElementType, TensorBuffer, TensorDescriptor, TensorError},
};

const SIMULATED_OUTPUT_LEN: i64 = 2;

/// 输出中记录的后端编码
pub fn backend_code(backend: BackendId) -> f32 {
  match backend {
    BackendId::None => 0.0,
    BackendId::Software => 1.0,
    BackendId::Npu => 2.0,
    BackendId::Streaming1 => 3.0,
    BackendId::Streaming2 => 4.0,
    BackendId::Streaming3 => 5.0,
  }
}

/// 一次模拟调用的记录
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
  pub backend: BackendId,
  pub tag: f32,
  pub thread: ThreadId,
}

/// 模拟后端共享的调用账本
#[derive(Debug, Default)]
pub struct Ledger {
  invocations: Mutex<Vec<Invocation>>,
  thresholds: Mutex<HashMap<BackendId, Vec<f32>>>,
  software_threads: Mutex<Vec<ThreadId>>,
}

impl Ledger {
  pub fn invocations(&self) -> Vec<Invocation> {
    lock(&self.invocations).clone()
  }

  /// 各条目标记被调用的次数
  pub fn tag_counts(&self) -> HashMap<u32, usize> {
    let mut counts = HashMap::new();
    for invocation in lock(&self.invocations).iter() {
      *counts.entry(invocation.tag as u32).or_insert(0) += 1;
    }
    counts
  }

  /// 推送到流式设备上的阈值，按输出流编号排列
  pub fn thresholds(&self, backend: BackendId) -> Vec<f32> {
    lock(&self.thresholds).get(&backend).cloned().unwrap_or_default()
  }

  /// 构造软件会话时所在的线程
  pub fn software_threads(&self) -> Vec<ThreadId> {
    lock(&self.software_threads).clone()
  }

  pub fn clear(&self) {
    lock(&self.invocations).clear();
  }

  fn record(&self, backend: BackendId, tag: f32) {
    lock(&self.invocations).push(Invocation {
      backend,
      tag,
      thread: thread::current().id(),
    });
  }
}

/// 模拟后端工厂
#[derive(Debug, Clone)]
pub struct SimulatedFactory {
  item_len: i64,
  interpreter_input: ElementType,
  streaming_input: ElementType,
  streaming_outputs: usize,
  latency: [Duration; BACKEND_SLOTS],
  delegates: Vec<Delegate>,
  npu_available: bool,
  devices: usize,
  failures: Vec<(BackendId, usize)>,
  reject_thresholds: bool,
  ledger: Arc<Ledger>,
}

impl Default for SimulatedFactory {
  fn default() -> Self {
    SimulatedFactory {
      item_len: 4,
      interpreter_input: ElementType::F32,
      streaming_input: ElementType::U8,
      streaming_outputs: 1,
      latency: [Duration::ZERO; BACKEND_SLOTS],
      delegates: vec![Delegate::Gpu, Delegate::Dsp, Delegate::Cpu],
      npu_available: true,
      devices: 3,
      failures: Vec::new(),
      reject_thresholds: false,
      ledger: Arc::new(Ledger::default()),
    }
  }
}

impl SimulatedFactory {
  /// 每个条目的输入元素个数
  pub fn item_len(mut self, item_len: usize) -> Self {
    self.item_len = item_len.max(1) as i64;
    self
  }

  /// 流式设备的输出流个数
  pub fn streaming_outputs(mut self, outputs: usize) -> Self {
    self.streaming_outputs = outputs.max(1);
    self
  }

  /// 单条目处理耗时
  pub fn latency(mut self, backend: BackendId, latency: Duration) -> Self {
    if let Some(slot) = backend.slot() {
      self.latency[slot] = latency;
    }
    self
  }

  /// 可以成功挂载的代理
  pub fn delegates(mut self, delegates: &[Delegate]) -> Self {
    self.delegates = delegates.to_vec();
    self
  }

  pub fn npu_available(mut self, available: bool) -> Self {
    self.npu_available = available;
    self
  }

  pub fn devices(mut self, devices: usize) -> Self {
    self.devices = devices;
    self
  }

  /// 让 `backend` 的第 `nth` 次调用（从 0 开始）失败
  pub fn fail_on(mut self, backend: BackendId, nth: usize) -> Self {
    self.failures.push((backend, nth));
    self
  }

  /// 流式设备拒绝设置分数阈值
  pub fn reject_thresholds(mut self) -> Self {
    self.reject_thresholds = true;
    self
  }

  pub fn ledger(&self) -> Arc<Ledger> {
    self.ledger.clone()
  }

  fn latency_of(&self, backend: BackendId) -> Duration {
    backend.slot().map(|s| self.latency[s]).unwrap_or_default()
  }

  fn failure_of(&self, backend: BackendId) -> Option<usize> {
    self
      .failures
      .iter()
      .find(|(b, _)| *b == backend)
      .map(|&(_, nth)| nth)
  }

  fn core(&self, backend: BackendId, input: ElementType) -> Result<SimulatedCore, SessionError> {
    let outputs = if backend.is_streaming() { self.streaming_outputs } else { 1 };
    Ok(SimulatedCore {
      backend,
      latency: self.latency_of(backend),
      fail_at: self.failure_of(backend),
      calls: 0,
      ledger: self.ledger.clone(),
      inputs: vec![TensorDescriptor::allocate(
        "input",
        vec![1, self.item_len],
        input,
      )?],
      outputs: (0..outputs)
        .map(|i| {
          TensorDescriptor::allocate(
            format!("output{}", i),
            vec![1, SIMULATED_OUTPUT_LEN],
            ElementType::F32,
          )
        })
        .collect::<Result<Vec<_>, TensorError>>()?,
    })
  }
}

struct SimulatedCore {
  backend: BackendId,
  latency: Duration,
  fail_at: Option<usize>,
  calls: usize,
  ledger: Arc<Ledger>,
  inputs: Vec<TensorDescriptor>,
  outputs: Vec<TensorDescriptor>,
}

fn first_element(tensor: &TensorDescriptor) -> f32 {
  match tensor.buffer() {
    TensorBuffer::U8(data) => data.first().copied().unwrap_or_default() as f32,
    TensorBuffer::U16(data) => data.first().copied().unwrap_or_default() as f32,
    TensorBuffer::F32(data) => data.first().copied().unwrap_or_default(),
  }
}

impl SimulatedCore {
  fn compute(&mut self) -> Result<(), SessionError> {
    let call = self.calls;
    self.calls += 1;
    if self.fail_at == Some(call) {
      warn!("{}: 模拟第 {} 次调用失败", self.backend, call);
      return Err(SessionError::Invoke(format!(
        "{} 模拟故障 (第 {} 次调用)",
        self.backend, call
      )));
    }
    if !self.latency.is_zero() {
      thread::sleep(self.latency);
    }
    let tag = first_element(&self.inputs[0]);
    self.ledger.record(self.backend, tag);
    for output in &mut self.outputs {
      output.write_item(0, &[tag, backend_code(self.backend)])?;
    }
    Ok(())
  }
}

/// 模拟的解释器/NPU 会话，只能在创建它的线程上调用
pub struct SimulatedInvoke {
  core: SimulatedCore,
  owner: Option<ThreadId>,
}

impl Invoke for SimulatedInvoke {
  fn inputs(&self) -> &[TensorDescriptor] {
    &self.core.inputs
  }

  fn inputs_mut(&mut self) -> &mut [TensorDescriptor] {
    &mut self.core.inputs
  }

  fn outputs(&self) -> &[TensorDescriptor] {
    &self.core.outputs
  }

  fn invoke(&mut self) -> Result<(), SessionError> {
    if let Some(owner) = self.owner {
      if owner != thread::current().id() {
        return Err(SessionError::Invoke(
          "会话只能在创建它的线程上使用".to_string(),
        ));
      }
    }
    self.core.compute()
  }
}

/// 模拟的流式设备
pub struct SimulatedStream {
  core: SimulatedCore,
  thresholds: Vec<f32>,
  reject_thresholds: bool,
}

impl Stream for SimulatedStream {
  fn input_frames(&self) -> Result<Vec<TensorDescriptor>, SessionError> {
    Ok(self.core.inputs.clone())
  }

  fn output_frames(&self) -> Result<Vec<TensorDescriptor>, SessionError> {
    Ok(self.core.outputs.clone())
  }

  fn write(&mut self, index: usize, frame: &TensorDescriptor) -> Result<(), SessionError> {
    let slot = self.core.inputs.get_mut(index).ok_or(SessionError::Stream {
      index,
      reason: "没有这个输入流".to_string(),
    })?;
    slot.copy_item_from(0, frame, 0)?;
    Ok(())
  }

  fn read(&mut self, index: usize, frame: &mut TensorDescriptor) -> Result<(), SessionError> {
    // 输入流写满后，第一次读取触发计算
    if index == 0 {
      self.core.compute()?;
    }
    let slot = self.core.outputs.get(index).ok_or(SessionError::Stream {
      index,
      reason: "没有这个输出流".to_string(),
    })?;
    frame.copy_item_from(0, slot, 0)?;
    Ok(())
  }

  fn set_score_threshold(&mut self, index: usize, threshold: f32) -> Result<(), SessionError> {
    if self.reject_thresholds {
      return Err(SessionError::Stream {
        index,
        reason: format!("拒绝分数阈值 {}", threshold),
      });
    }
    if index >= self.thresholds.len() {
      self.thresholds.resize(index + 1, 0.0);
    }
    self.thresholds[index] = threshold;
    lock(&self.core.ledger.thresholds).insert(self.core.backend, self.thresholds.clone());
    Ok(())
  }
}

impl BackendFactory for SimulatedFactory {
  fn software(
    &self,
    path: &Path,
    delegate: Delegate,
    threads: Option<usize>,
  ) -> Result<Box<dyn Invoke>, SessionError> {
    if !self.delegates.contains(&delegate) {
      return Err(SessionError::DelegateRejected(
        delegate,
        "模拟环境中不可用".to_string(),
      ));
    }
    debug!(
      "模拟软件会话: {} (代理 {}, 线程数 {:?})",
      path.display(),
      delegate,
      threads
    );
    lock(&self.ledger.software_threads).push(thread::current().id());
    Ok(Box::new(SimulatedInvoke {
      core: self.core(BackendId::Software, self.interpreter_input)?,
      owner: Some(thread::current().id()),
    }))
  }

  fn npu(&self, path: &Path) -> Result<Box<dyn Invoke>, SessionError> {
    if !self.npu_available {
      return Err(SessionError::Unavailable(format!(
        "无法打开 NPU 设备 ({})",
        path.display()
      )));
    }
    Ok(Box::new(SimulatedInvoke {
      core: self.core(BackendId::Npu, self.interpreter_input)?,
      owner: Some(thread::current().id()),
    }))
  }

  fn streaming_devices(&self) -> Result<usize, SessionError> {
    Ok(self.devices)
  }

  fn streaming(&self, path: &Path, device: usize) -> Result<Box<dyn Stream + Send>, SessionError> {
    let backend = BackendId::streaming(device)
      .filter(|_| device < self.devices)
      .ok_or_else(|| {
        SessionError::Unavailable(format!("流式设备 {} 不存在 ({})", device, path.display()))
      })?;
    Ok(Box::new(SimulatedStream {
      core: self.core(backend, self.streaming_input)?,
      thresholds: Vec::new(),
      reject_thresholds: self.reject_thresholds,
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn invoke_echoes_tag_and_backend() {
    let factory = SimulatedFactory::default();
    let mut session = factory.npu(Path::new("a.mxq")).unwrap();
    session.inputs_mut()[0].write_item(0, &[9.0f32, 0.0, 0.0, 0.0]).unwrap();
    session.invoke().unwrap();
    assert_eq!(session.outputs()[0].view::<f32>().unwrap(), &[9.0, 2.0]);
    assert_eq!(factory.ledger().tag_counts().get(&9), Some(&1));
  }

  #[test]
  fn software_session_is_thread_affine() {
    let factory = SimulatedFactory::default();
    let mut session = SimulatedInvoke {
      core: factory.core(BackendId::Software, ElementType::F32).unwrap(),
      owner: Some(thread::current().id()),
    };
    session.invoke().unwrap();

    // 换一个线程调用应当失败
    let failed = thread::spawn(move || session.invoke().is_err())
      .join()
      .unwrap();
    assert!(failed);
  }

  #[test]
  fn rejected_delegate_and_missing_device() {
    let factory = SimulatedFactory::default().delegates(&[Delegate::Dsp]).devices(1);
    assert!(matches!(
      factory.software(Path::new("a.tflite"), Delegate::Gpu, None),
      Err(SessionError::DelegateRejected(Delegate::Gpu, _))
    ));
    assert!(factory.software(Path::new("a.tflite"), Delegate::Dsp, None).is_ok());
    assert!(factory.streaming(Path::new("a.hef"), 0).is_ok());
    assert!(matches!(
      factory.streaming(Path::new("a.hef"), 1),
      Err(SessionError::Unavailable(_))
    ));
  }

  #[test]
  fn injected_failure_hits_the_nth_call() {
    let factory = SimulatedFactory::default().fail_on(BackendId::Npu, 1);
    let mut session = factory.npu(Path::new("a.mxq")).unwrap();
    assert!(session.invoke().is_ok());
    assert!(matches!(session.invoke(), Err(SessionError::Invoke(_))));
    assert!(session.invoke().is_ok());
  }

  #[test]
  fn stream_records_thresholds() {
    let factory = SimulatedFactory::default();
    let mut stream = factory.streaming(Path::new("a.hef"), 2).unwrap();
    stream.set_score_threshold(0, 0.25).unwrap();
    assert_eq!(factory.ledger().thresholds(BackendId::Streaming3), vec![0.25]);

    let mut input = stream.input_frames().unwrap().remove(0);
    input.write_item(0, &[5u8, 0, 0, 0]).unwrap();
    stream.write(0, &input).unwrap();
    let mut output = stream.output_frames().unwrap().remove(0);
    stream.read(0, &mut output).unwrap();
    assert_eq!(output.view::<f32>().unwrap(), &[5.0, 5.0]);
  }
}
