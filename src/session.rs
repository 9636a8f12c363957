// 该文件是 Hexi （河西） 项目的一部分。
// src/session.rs - 后端会话
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

use std::{fmt, path::Path, str::FromStr};

use thiserror::Error;
use tracing::debug;

use crate::{
  tensor::{TensorDescriptor, TensorError},
  unified::{IoError, IoRange, UnifiedIo},
};

pub mod simulated;

#[cfg(feature = "rknpu")]
pub mod rknpu;

/// 最多同时使用的流式加速设备数
pub const MAX_STREAMING_DEVICES: usize = 3;

/// 可参与调度的后端数
pub const BACKEND_SLOTS: usize = 2 + MAX_STREAMING_DEVICES;

/// 条目的来源标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendId {
  #[default]
  None,
  Software,
  Npu,
  Streaming1,
  Streaming2,
  Streaming3,
}

/// 后端类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendFamily {
  Software,
  Npu,
  Streaming,
}

impl BackendId {
  /// 调度优先级顺序，平局时靠前者胜出
  pub const SCHEDULABLE: [BackendId; BACKEND_SLOTS] = [
    BackendId::Software,
    BackendId::Npu,
    BackendId::Streaming1,
    BackendId::Streaming2,
    BackendId::Streaming3,
  ];

  pub fn streaming(device: usize) -> Option<BackendId> {
    match device {
      0 => Some(BackendId::Streaming1),
      1 => Some(BackendId::Streaming2),
      2 => Some(BackendId::Streaming3),
      _ => None,
    }
  }

  /// 在 [`BackendId::SCHEDULABLE`] 中的位置
  pub fn slot(self) -> Option<usize> {
    BackendId::SCHEDULABLE.iter().position(|&b| b == self)
  }

  pub fn family(self) -> Option<BackendFamily> {
    match self {
      BackendId::None => None,
      BackendId::Software => Some(BackendFamily::Software),
      BackendId::Npu => Some(BackendFamily::Npu),
      BackendId::Streaming1 | BackendId::Streaming2 | BackendId::Streaming3 => {
        Some(BackendFamily::Streaming)
      }
    }
  }

  pub fn is_streaming(self) -> bool {
    self.family() == Some(BackendFamily::Streaming)
  }
}

impl fmt::Display for BackendId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      BackendId::None => "none",
      BackendId::Software => "software",
      BackendId::Npu => "npu",
      BackendId::Streaming1 => "streaming-1",
      BackendId::Streaming2 => "streaming-2",
      BackendId::Streaming3 => "streaming-3",
    };
    f.write_str(name)
  }
}

/// 软件解释器的加速代理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delegate {
  Gpu,
  Dsp,
  /// 不挂载代理，直接在 CPU 上解释执行
  Cpu,
}

impl fmt::Display for Delegate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Delegate::Gpu => f.write_str("gpu"),
      Delegate::Dsp => f.write_str("dsp"),
      Delegate::Cpu => f.write_str("cpu"),
    }
  }
}

impl FromStr for Delegate {
  type Err = SessionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "gpu" => Ok(Delegate::Gpu),
      "dsp" | "hexagon" => Ok(Delegate::Dsp),
      "cpu" | "none" => Ok(Delegate::Cpu),
      other => Err(SessionError::Unsupported(format!("未知的代理: {}", other))),
    }
  }
}

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("后端不可用: {0}")]
  Unavailable(String),
  #[error("代理 {0} 挂载失败: {1}")]
  DelegateRejected(Delegate, String),
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] std::io::Error),
  #[error("推理执行失败: {0}")]
  Invoke(String),
  #[error("流 {index} 读写失败: {reason}")]
  Stream { index: usize, reason: String },
  #[error("张量错误: {0}")]
  Tensor(#[from] TensorError),
  #[error("缓冲区错误: {0}")]
  Io(#[from] IoError),
  #[error("不支持的操作: {0}")]
  Unsupported(String),
}

/// 单次调用能力：先写入会话自身的输入张量，再整体调用一次。
///
/// 解释器与 NPU 运行时都属于这一类。
pub trait Invoke {
  fn inputs(&self) -> &[TensorDescriptor];
  fn inputs_mut(&mut self) -> &mut [TensorDescriptor];
  fn outputs(&self) -> &[TensorDescriptor];
  fn invoke(&mut self) -> Result<(), SessionError>;
}

/// 流式能力：逐帧写入输入流，再从输出流读取结果。
///
/// 设备自带的过滤阶段可以在派发前调整分数阈值。
pub trait Stream {
  /// 输入流的帧描述，首维为 1
  fn input_frames(&self) -> Result<Vec<TensorDescriptor>, SessionError>;
  /// 输出流的帧描述，首维为 1
  fn output_frames(&self) -> Result<Vec<TensorDescriptor>, SessionError>;
  fn write(&mut self, index: usize, frame: &TensorDescriptor) -> Result<(), SessionError>;
  fn read(&mut self, index: usize, frame: &mut TensorDescriptor) -> Result<(), SessionError>;
  fn set_score_threshold(&mut self, index: usize, threshold: f32) -> Result<(), SessionError>;
}

/// 各类后端会话的统一接口：按条目完成 复制输入/调用/复制输出。
pub trait BackendSession {
  fn backend(&self) -> BackendId;
  /// 会话自身的输入描述（首维为 1）
  fn inputs(&self) -> &[TensorDescriptor];
  /// 会话自身的输出描述（首维为 1）
  fn outputs(&self) -> &[TensorDescriptor];
  fn run_item(&mut self, io: &UnifiedIo, range: &IoRange, item: usize) -> Result<(), SessionError>;

  /// 推送过滤阶段的分数阈值，仅流式设备需要
  fn set_score_threshold(&mut self, _threshold: f32) -> Result<(), SessionError> {
    Ok(())
  }

  /// 会话是否只能在创建它的线程上使用
  fn requires_dedicated_thread(&self) -> bool {
    false
  }
}

fn invoke_item(
  native: &mut dyn Invoke,
  io: &UnifiedIo,
  range: &IoRange,
  item: usize,
) -> Result<(), SessionError> {
  io.copy_in(range, item, native.inputs_mut())?;
  native.invoke()?;
  io.copy_out(range, item, native.outputs())?;
  Ok(())
}

/// 软件解释器会话，可挂载 GPU 或 DSP 代理。
///
/// 代理上下文与创建线程绑定，因此该会话在持久工作线程上构建并一直留在那里，
/// 不要求 `Send`。
pub struct SoftwareSession {
  delegate: Delegate,
  native: Box<dyn Invoke>,
}

impl SoftwareSession {
  pub fn new(delegate: Delegate, native: Box<dyn Invoke>) -> Self {
    SoftwareSession { delegate, native }
  }

  pub fn delegate(&self) -> Delegate {
    self.delegate
  }
}

impl BackendSession for SoftwareSession {
  fn backend(&self) -> BackendId {
    BackendId::Software
  }

  fn inputs(&self) -> &[TensorDescriptor] {
    self.native.inputs()
  }

  fn outputs(&self) -> &[TensorDescriptor] {
    self.native.outputs()
  }

  fn run_item(&mut self, io: &UnifiedIo, range: &IoRange, item: usize) -> Result<(), SessionError> {
    invoke_item(self.native.as_mut(), io, range, item)
  }

  fn requires_dedicated_thread(&self) -> bool {
    true
  }
}

/// NPU 运行时会话。
///
/// 运行时上下文同样留在创建它的持久工作线程上。
pub struct NpuSession {
  native: Box<dyn Invoke>,
}

impl NpuSession {
  pub fn new(native: Box<dyn Invoke>) -> Self {
    NpuSession { native }
  }
}

impl BackendSession for NpuSession {
  fn backend(&self) -> BackendId {
    BackendId::Npu
  }

  fn inputs(&self) -> &[TensorDescriptor] {
    self.native.inputs()
  }

  fn outputs(&self) -> &[TensorDescriptor] {
    self.native.outputs()
  }

  fn run_item(&mut self, io: &UnifiedIo, range: &IoRange, item: usize) -> Result<(), SessionError> {
    invoke_item(self.native.as_mut(), io, range, item)
  }

  fn requires_dedicated_thread(&self) -> bool {
    true
  }
}

/// 单个流式加速设备上的会话
pub struct StreamingSession {
  backend: BackendId,
  native: Box<dyn Stream + Send>,
  inputs: Vec<TensorDescriptor>,
  outputs: Vec<TensorDescriptor>,
}

impl StreamingSession {
  pub fn new(device: usize, native: Box<dyn Stream + Send>) -> Result<Self, SessionError> {
    let backend = BackendId::streaming(device).ok_or_else(|| {
      SessionError::Unsupported(format!(
        "流式设备编号 {} 超过上限 {}",
        device, MAX_STREAMING_DEVICES
      ))
    })?;
    let inputs = native.input_frames()?;
    let outputs = native.output_frames()?;
    debug!(
      "{}: {} 个输入流, {} 个输出流",
      backend,
      inputs.len(),
      outputs.len()
    );
    Ok(StreamingSession {
      backend,
      native,
      inputs,
      outputs,
    })
  }
}

impl BackendSession for StreamingSession {
  fn backend(&self) -> BackendId {
    self.backend
  }

  fn inputs(&self) -> &[TensorDescriptor] {
    &self.inputs
  }

  fn outputs(&self) -> &[TensorDescriptor] {
    &self.outputs
  }

  fn run_item(&mut self, io: &UnifiedIo, range: &IoRange, item: usize) -> Result<(), SessionError> {
    io.copy_in(range, item, &mut self.inputs)?;
    for (index, frame) in self.inputs.iter().enumerate() {
      self.native.write(index, frame)?;
    }
    for (index, frame) in self.outputs.iter_mut().enumerate() {
      self.native.read(index, frame)?;
    }
    io.copy_out(range, item, &self.outputs)?;
    Ok(())
  }

  fn set_score_threshold(&mut self, threshold: f32) -> Result<(), SessionError> {
    for index in 0..self.outputs.len() {
      self.native.set_score_threshold(index, threshold)?;
    }
    Ok(())
  }
}

/// 构造各类原生会话的工厂。
///
/// 绑定过程只通过这个接口接触具体运行时；软件与 NPU 会话在各自的持久工作线程上构造，
/// 所以工厂本身需要跨线程共享。
pub trait BackendFactory: Send + Sync {
  fn software(
    &self,
    path: &Path,
    delegate: Delegate,
    threads: Option<usize>,
  ) -> Result<Box<dyn Invoke>, SessionError>;

  /// 在 NPU 工作线程上调用，返回的会话不离开该线程
  fn npu(&self, path: &Path) -> Result<Box<dyn Invoke>, SessionError>;

  /// 当前可发现的流式设备数
  fn streaming_devices(&self) -> Result<usize, SessionError>;

  fn streaming(&self, path: &Path, device: usize) -> Result<Box<dyn Stream + Send>, SessionError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backend_slots_follow_priority() {
    assert_eq!(BackendId::Software.slot(), Some(0));
    assert_eq!(BackendId::Npu.slot(), Some(1));
    assert_eq!(BackendId::Streaming3.slot(), Some(4));
    assert_eq!(BackendId::None.slot(), None);
    assert_eq!(BackendId::streaming(1), Some(BackendId::Streaming2));
    assert_eq!(BackendId::streaming(3), None);
    assert!(BackendId::Streaming1.is_streaming());
    assert!(!BackendId::Npu.is_streaming());
    assert_eq!(BackendId::None.family(), None);
  }

  #[test]
  fn delegate_parsing() {
    assert_eq!("GPU".parse::<Delegate>().unwrap(), Delegate::Gpu);
    assert_eq!("hexagon".parse::<Delegate>().unwrap(), Delegate::Dsp);
    assert_eq!(" cpu ".parse::<Delegate>().unwrap(), Delegate::Cpu);
    assert!("tpu".parse::<Delegate>().is_err());
  }

  #[test]
  fn streaming_threshold_reaches_every_output() {
    use crate::session::simulated::SimulatedFactory;

    let factory = SimulatedFactory::default().streaming_outputs(2);
    let native = factory.streaming(Path::new("m.hef"), 1).unwrap();
    let mut session = StreamingSession::new(1, native).unwrap();
    assert_eq!(session.outputs().len(), 2);

    session.set_score_threshold(0.25).unwrap();
    assert_eq!(factory.ledger().thresholds(BackendId::Streaming2), vec![0.25, 0.25]);
  }
}
