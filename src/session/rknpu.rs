// 该文件是 Hexi （河西） 项目的一部分。
// src/session/rknpu.rs - RKNPU 后端
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

//! 以 Rockchip NPU 运行时作为 NPU 会话。
//!
//! 运行时只接受 `u8` NHWC 输入，输出按 `f32` 读取；
//! 输入输出的形状由调用方按模型给出。

use std::path::Path;

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, info};

use crate::{
  session::{BackendFactory, Delegate, Invoke, SessionError, Stream},
  tensor::{ElementType, TensorDescriptor},
};

fn rknn_error(context: &str) -> impl FnOnce(rknpu::Error) -> SessionError + '_ {
  move |e| SessionError::Invoke(format!("{}: {}", context, e))
}

/// 只提供 NPU 会话的工厂
pub struct RknpuFactory {
  inputs: Vec<TensorDescriptor>,
  outputs: Vec<TensorDescriptor>,
}

impl RknpuFactory {
  /// `inputs` 必须为 `u8`，`outputs` 必须为 `f32`，首维均为 1
  pub fn new(
    inputs: Vec<TensorDescriptor>,
    outputs: Vec<TensorDescriptor>,
  ) -> Result<Self, SessionError> {
    if let Some(t) = inputs.iter().find(|t| t.element_type() != ElementType::U8) {
      return Err(SessionError::Unsupported(format!("RKNPU 输入必须为 u8: {}", t)));
    }
    if let Some(t) = outputs.iter().find(|t| t.element_type() != ElementType::F32) {
      return Err(SessionError::Unsupported(format!("RKNPU 输出必须为 f32: {}", t)));
    }
    Ok(RknpuFactory { inputs, outputs })
  }
}

/// RKNPU 会话，上下文在 NPU 工作线程上创建并只在该线程上使用
pub struct RknpuInvoke {
  context: Context,
  inputs: Vec<TensorDescriptor>,
  outputs: Vec<TensorDescriptor>,
}

impl Invoke for RknpuInvoke {
  fn inputs(&self) -> &[TensorDescriptor] {
    &self.inputs
  }

  fn inputs_mut(&mut self) -> &mut [TensorDescriptor] {
    &mut self.inputs
  }

  fn outputs(&self) -> &[TensorDescriptor] {
    &self.outputs
  }

  fn invoke(&mut self) -> Result<(), SessionError> {
    for (index, tensor) in self.inputs.iter().enumerate() {
      self
        .context
        .set_input(
          index as _,
          tensor.view::<u8>()?,
          TensorFormat::NHWC,
          TensorType::UInt8,
        )
        .map_err(rknn_error("设置输入失败"))?;
    }

    self.context.run().map_err(rknn_error("推理失败"))?;

    let output = self.context.get_outputs().map_err(rknn_error("获取输出失败"))?;
    for (index, tensor) in self.outputs.iter_mut().enumerate() {
      let data = output.get_f32(index).map_err(rknn_error("读取输出失败"))?;
      let slot = tensor.view_mut::<f32>()?;
      if data.len() != slot.len() {
        return Err(SessionError::Invoke(format!(
          "第 {} 个输出长度为 {}, 预期 {}",
          index,
          data.len(),
          slot.len()
        )));
      }
      slot.copy_from_slice(data);
    }
    Ok(())
  }
}

impl BackendFactory for RknpuFactory {
  fn software(
    &self,
    _path: &Path,
    delegate: Delegate,
    _threads: Option<usize>,
  ) -> Result<Box<dyn Invoke>, SessionError> {
    Err(SessionError::DelegateRejected(
      delegate,
      "RKNPU 不提供软件解释器".to_string(),
    ))
  }

  fn npu(&self, path: &Path) -> Result<Box<dyn Invoke>, SessionError> {
    info!("加载模型文件: {}", path.display());
    let data = std::fs::read(path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      data.len() as f64 / (1024.0 * 1024.0)
    );

    let context = Context::new(&data, InitFlags::default()).map_err(rknn_error("创建上下文失败"))?;
    let num_inputs = context.num_inputs().map_err(rknn_error("无法获取输入数量"))? as usize;
    let num_outputs = context.num_outputs().map_err(rknn_error("无法获取输出数量"))? as usize;
    if num_inputs != self.inputs.len() || num_outputs != self.outputs.len() {
      return Err(SessionError::Unsupported(format!(
        "模型有 {} 个输入 {} 个输出, 预期 {} 个输入 {} 个输出",
        num_inputs,
        num_outputs,
        self.inputs.len(),
        self.outputs.len()
      )));
    }
    info!("RKNPU 上下文已创建");

    Ok(Box::new(RknpuInvoke {
      context,
      inputs: self.inputs.clone(),
      outputs: self.outputs.clone(),
    }))
  }

  fn streaming_devices(&self) -> Result<usize, SessionError> {
    Ok(0)
  }

  fn streaming(&self, path: &Path, device: usize) -> Result<Box<dyn Stream + Send>, SessionError> {
    Err(SessionError::Unavailable(format!(
      "RKNPU 没有流式设备 {} ({})",
      device,
      path.display()
    )))
  }
}
