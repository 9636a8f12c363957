// 该文件是 Hexi （河西） 项目的一部分。
// src/tensor.rs - 张量描述
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

use std::fmt;

use thiserror::Error;

/// 张量元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
  U8,
  U16,
  F32,
}

impl ElementType {
  /// 单个元素的字节数
  pub fn size(self) -> usize {
    match self {
      ElementType::U8 => 1,
      ElementType::U16 => 2,
      ElementType::F32 => 4,
    }
  }
}

impl fmt::Display for ElementType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ElementType::U8 => write!(f, "u8"),
      ElementType::U16 => write!(f, "u16"),
      ElementType::F32 => write!(f, "f32"),
    }
  }
}

/// 量化参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantization {
  pub scale: f32,
  pub zero_point: i32,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
  #[error("张量 {name} 的形状无效: {shape:?}")]
  InvalidShape { name: String, shape: Vec<i64> },
  #[error("张量 {name} 元素类型不匹配: 期望 {expected}, 实际 {actual}")]
  TypeMismatch {
    name: String,
    expected: ElementType,
    actual: ElementType,
  },
  #[error("张量 {name} 的条目 {index} 超出批次大小 {batch}")]
  ItemOutOfRange {
    name: String,
    index: usize,
    batch: usize,
  },
  #[error("张量 {name} 数据长度不匹配: 期望 {expected}, 实际 {actual}")]
  LengthMismatch {
    name: String,
    expected: usize,
    actual: usize,
  },
}

/// 张量独占的数据缓冲区
#[derive(Debug, Clone, PartialEq)]
pub enum TensorBuffer {
  U8(Box<[u8]>),
  U16(Box<[u16]>),
  F32(Box<[f32]>),
}

impl TensorBuffer {
  fn zeroed(element_type: ElementType, len: usize) -> Self {
    match element_type {
      ElementType::U8 => TensorBuffer::U8(vec![0; len].into_boxed_slice()),
      ElementType::U16 => TensorBuffer::U16(vec![0; len].into_boxed_slice()),
      ElementType::F32 => TensorBuffer::F32(vec![0.0; len].into_boxed_slice()),
    }
  }

  pub fn element_type(&self) -> ElementType {
    match self {
      TensorBuffer::U8(_) => ElementType::U8,
      TensorBuffer::U16(_) => ElementType::U16,
      TensorBuffer::F32(_) => ElementType::F32,
    }
  }

  pub fn len(&self) -> usize {
    match self {
      TensorBuffer::U8(data) => data.len(),
      TensorBuffer::U16(data) => data.len(),
      TensorBuffer::F32(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 可以直接作为张量元素访问的类型
pub trait Element: Copy + Default + Send + Sync + 'static {
  const TYPE: ElementType;
  fn slice(buffer: &TensorBuffer) -> Option<&[Self]>;
  fn slice_mut(buffer: &mut TensorBuffer) -> Option<&mut [Self]>;
}

macro_rules! impl_element {
  ($ty:ty, $variant:ident) => {
    impl Element for $ty {
      const TYPE: ElementType = ElementType::$variant;

      fn slice(buffer: &TensorBuffer) -> Option<&[Self]> {
        match buffer {
          TensorBuffer::$variant(data) => Some(data),
          _ => None,
        }
      }

      fn slice_mut(buffer: &mut TensorBuffer) -> Option<&mut [Self]> {
        match buffer {
          TensorBuffer::$variant(data) => Some(data),
          _ => None,
        }
      }
    }
  };
}

impl_element!(u8, U8);
impl_element!(u16, U16);
impl_element!(f32, F32);

/// 与后端无关的张量描述：形状、元素类型、量化参数、名称以及独占的缓冲区。
///
/// 缓冲区长度始终等于各维度乘积；首维视为批次维度。
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
  name: String,
  shape: Vec<i64>,
  quantization: Option<Quantization>,
  buffer: TensorBuffer,
}

fn element_count(name: &str, shape: &[i64]) -> Result<usize, TensorError> {
  if shape.is_empty() || shape.iter().any(|&d| d <= 0) {
    return Err(TensorError::InvalidShape {
      name: name.to_string(),
      shape: shape.to_vec(),
    });
  }
  Ok(shape.iter().map(|&d| d as usize).product())
}

impl TensorDescriptor {
  pub fn allocate(
    name: impl Into<String>,
    shape: Vec<i64>,
    element_type: ElementType,
  ) -> Result<Self, TensorError> {
    let name = name.into();
    let len = element_count(&name, &shape)?;
    Ok(TensorDescriptor {
      name,
      shape,
      quantization: None,
      buffer: TensorBuffer::zeroed(element_type, len),
    })
  }

  pub fn with_quantization(mut self, quantization: Quantization) -> Self {
    self.quantization = Some(quantization);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn shape(&self) -> &[i64] {
    &self.shape
  }

  pub fn element_type(&self) -> ElementType {
    self.buffer.element_type()
  }

  pub fn quantization(&self) -> Option<Quantization> {
    self.quantization
  }

  pub fn element_count(&self) -> usize {
    self.buffer.len()
  }

  pub fn byte_len(&self) -> usize {
    self.buffer.len() * self.element_type().size()
  }

  pub fn buffer(&self) -> &TensorBuffer {
    &self.buffer
  }

  /// 首维大小
  pub fn batch_size(&self) -> usize {
    self.shape[0] as usize
  }

  /// 单个条目（首维切片）的元素个数
  pub fn item_len(&self) -> usize {
    self.shape[1..].iter().map(|&d| d as usize).product()
  }

  /// 重新分配缓冲区，使首维等于 `n`，保留元素类型与其余维度
  pub fn resize_leading_dim(&mut self, n: usize) -> Result<(), TensorError> {
    let mut shape = self.shape.clone();
    shape[0] = n as i64;
    let len = element_count(&self.name, &shape)?;
    self.buffer = TensorBuffer::zeroed(self.element_type(), len);
    self.shape = shape;
    Ok(())
  }

  /// 复制元数据并以新的首维分配一块新缓冲区
  pub fn with_leading_dim(&self, n: usize) -> Result<Self, TensorError> {
    let mut tensor = TensorDescriptor {
      name: self.name.clone(),
      shape: self.shape.clone(),
      quantization: self.quantization,
      buffer: TensorBuffer::zeroed(self.element_type(), 0),
    };
    tensor.resize_leading_dim(n)?;
    Ok(tensor)
  }

  fn type_mismatch(&self, expected: ElementType) -> TensorError {
    TensorError::TypeMismatch {
      name: self.name.clone(),
      expected,
      actual: self.element_type(),
    }
  }

  pub fn view<T: Element>(&self) -> Result<&[T], TensorError> {
    T::slice(&self.buffer).ok_or_else(|| self.type_mismatch(T::TYPE))
  }

  pub fn view_mut<T: Element>(&mut self) -> Result<&mut [T], TensorError> {
    let actual = self.element_type();
    let TensorDescriptor { name, buffer, .. } = self;
    T::slice_mut(buffer).ok_or_else(|| TensorError::TypeMismatch {
      name: name.clone(),
      expected: T::TYPE,
      actual,
    })
  }

  fn item_range(&self, index: usize) -> Result<std::ops::Range<usize>, TensorError> {
    if index >= self.batch_size() {
      return Err(TensorError::ItemOutOfRange {
        name: self.name.clone(),
        index,
        batch: self.batch_size(),
      });
    }
    let len = self.item_len();
    Ok(index * len..(index + 1) * len)
  }

  pub fn item<T: Element>(&self, index: usize) -> Result<&[T], TensorError> {
    let range = self.item_range(index)?;
    Ok(&self.view::<T>()?[range])
  }

  pub fn item_mut<T: Element>(&mut self, index: usize) -> Result<&mut [T], TensorError> {
    let range = self.item_range(index)?;
    Ok(&mut self.view_mut::<T>()?[range])
  }

  /// 把 `src` 的第 `src_index` 个条目复制到本张量的第 `index` 个条目，
  /// 两者的元素类型与条目长度必须一致。
  pub fn copy_item_from(
    &mut self,
    index: usize,
    src: &TensorDescriptor,
    src_index: usize,
  ) -> Result<(), TensorError> {
    if self.element_type() != src.element_type() {
      return Err(src.type_mismatch(self.element_type()));
    }
    if self.item_len() != src.item_len() {
      return Err(TensorError::LengthMismatch {
        name: self.name.clone(),
        expected: self.item_len(),
        actual: src.item_len(),
      });
    }
    let dst_range = self.item_range(index)?;
    let src_range = src.item_range(src_index)?;
    match (&mut self.buffer, &src.buffer) {
      (TensorBuffer::U8(dst), TensorBuffer::U8(src)) => {
        dst[dst_range].copy_from_slice(&src[src_range])
      }
      (TensorBuffer::U16(dst), TensorBuffer::U16(src)) => {
        dst[dst_range].copy_from_slice(&src[src_range])
      }
      (TensorBuffer::F32(dst), TensorBuffer::F32(src)) => {
        dst[dst_range].copy_from_slice(&src[src_range])
      }
      _ => unreachable!("元素类型已检查"),
    }
    Ok(())
  }

  /// 按条目写入一段数据
  pub fn write_item<T: Element>(&mut self, index: usize, data: &[T]) -> Result<(), TensorError> {
    let expected = self.item_len();
    if data.len() != expected {
      return Err(TensorError::LengthMismatch {
        name: self.name.clone(),
        expected,
        actual: data.len(),
      });
    }
    self.item_mut::<T>(index)?.copy_from_slice(data);
    Ok(())
  }
}

impl fmt::Display for TensorDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {:?} {}", self.name, self.shape, self.element_type())?;
    if let Some(q) = self.quantization {
      write!(f, " (scale={}, zero_point={})", q.scale, q.zero_point)?;
    }
    Ok(())
  }
}
