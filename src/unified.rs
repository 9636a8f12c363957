// 该文件是 Hexi （河西） 项目的一部分。
// src/unified.rs - 统一输入输出缓冲区
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

use std::ops::Range;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::tensor::{TensorDescriptor, TensorError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IoError {
  #[error("输入索引 {0} 超出范围")]
  InputOutOfRange(usize),
  #[error("输出索引 {0} 超出范围")]
  OutputOutOfRange(usize),
  #[error(transparent)]
  Tensor(#[from] TensorError),
}

/// 某个后端在统一索引空间中占用的输入、输出区间
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IoRange {
  pub inputs: Range<usize>,
  pub outputs: Range<usize>,
}

/// 一个绑定的统一输入输出缓冲区，首维为批次。
///
/// 每个张量各自加读写锁，工作线程只在复制单个条目时持锁；
/// 批次划分互不相交，因此同一条目切片只会有一个写入者。
#[derive(Debug)]
pub struct UnifiedIo {
  inputs: Vec<RwLock<TensorDescriptor>>,
  outputs: Vec<RwLock<TensorDescriptor>>,
}

impl UnifiedIo {
  pub fn new(inputs: Vec<TensorDescriptor>, outputs: Vec<TensorDescriptor>) -> Self {
    UnifiedIo {
      inputs: inputs.into_iter().map(RwLock::new).collect(),
      outputs: outputs.into_iter().map(RwLock::new).collect(),
    }
  }

  pub fn num_inputs(&self) -> usize {
    self.inputs.len()
  }

  pub fn num_outputs(&self) -> usize {
    self.outputs.len()
  }

  pub fn input(&self, index: usize) -> Result<RwLockReadGuard<'_, TensorDescriptor>, IoError> {
    let tensor = self.inputs.get(index).ok_or(IoError::InputOutOfRange(index))?;
    Ok(tensor.read().unwrap_or_else(PoisonError::into_inner))
  }

  pub fn input_mut(&self, index: usize) -> Result<RwLockWriteGuard<'_, TensorDescriptor>, IoError> {
    let tensor = self.inputs.get(index).ok_or(IoError::InputOutOfRange(index))?;
    Ok(tensor.write().unwrap_or_else(PoisonError::into_inner))
  }

  pub fn output(&self, index: usize) -> Result<RwLockReadGuard<'_, TensorDescriptor>, IoError> {
    let tensor = self.outputs.get(index).ok_or(IoError::OutputOutOfRange(index))?;
    Ok(tensor.read().unwrap_or_else(PoisonError::into_inner))
  }

  pub fn output_mut(
    &self,
    index: usize,
  ) -> Result<RwLockWriteGuard<'_, TensorDescriptor>, IoError> {
    let tensor = self.outputs.get(index).ok_or(IoError::OutputOutOfRange(index))?;
    Ok(tensor.write().unwrap_or_else(PoisonError::into_inner))
  }

  /// 把条目 `item` 的输入切片复制到后端自身的输入张量
  pub fn copy_in(
    &self,
    range: &IoRange,
    item: usize,
    native: &mut [TensorDescriptor],
  ) -> Result<(), IoError> {
    for (tensor, index) in native.iter_mut().zip(range.inputs.clone()) {
      let unified = self.input(index)?;
      tensor.copy_item_from(0, &unified, item)?;
    }
    Ok(())
  }

  /// 把后端自身的输出写回统一输出缓冲区中条目 `item` 的位置
  pub fn copy_out(
    &self,
    range: &IoRange,
    item: usize,
    native: &[TensorDescriptor],
  ) -> Result<(), IoError> {
    for (tensor, index) in native.iter().zip(range.outputs.clone()) {
      let mut unified = self.output_mut(index)?;
      unified.copy_item_from(item, tensor, 0)?;
    }
    Ok(())
  }

  /// 调整所有张量的批次维度
  pub fn resize(&self, batch_size: usize) -> Result<(), IoError> {
    for index in 0..self.inputs.len() {
      self.input_mut(index)?.resize_leading_dim(batch_size)?;
    }
    for index in 0..self.outputs.len() {
      self.output_mut(index)?.resize_leading_dim(batch_size)?;
    }
    Ok(())
  }

  pub fn input_descriptors(&self) -> Vec<TensorDescriptor> {
    self
      .inputs
      .iter()
      .map(|t| t.read().unwrap_or_else(PoisonError::into_inner).clone())
      .collect()
  }

  pub fn output_descriptors(&self) -> Vec<TensorDescriptor> {
    self
      .outputs
      .iter()
      .map(|t| t.read().unwrap_or_else(PoisonError::into_inner).clone())
      .collect()
  }
}
