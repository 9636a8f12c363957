// 该文件是 Hexi （河西） 项目的一部分。
// src/lib.rs - 库主文件
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

//! # Hexi 异构批量推理引擎
//!
//! 将一个批次中的独立推理条目按吞吐比例分配到软件解释器（可选 GPU/DSP 代理）、
//! NPU 运行时以及若干流式加速设备上并发执行，并允许调用方逐条等待结果、
//! 查询结果来自哪个后端。
//!
//! ```no_run
//! use std::sync::Arc;
//! use hexi::{FromUrl, binding::ModelSource, engine::Engine, session::simulated::SimulatedFactory};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = ModelSource::from_url(&Url::parse("model:///models/yolo.tflitehef?batch=8")?)?;
//! let mut engine = Engine::bind(&source, Arc::new(SimulatedFactory::default()))?;
//! engine.set_scheduler_params([1.0, 1.0, 2.0, 2.0, 2.0].into())?;
//! engine.invoke()?;
//! for item in 0..engine.batch_size() {
//!   println!("{} <- {}", item, engine.item_backend(item)?);
//! }
//! println!("总耗时: {:.2} ms", engine.sum_turnaround()?);
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod coordinator;
pub mod engine;
pub mod scheduler;
pub mod session;
pub mod sync;
pub mod task;
pub mod telemetry;
pub mod tensor;
pub mod threshold;
pub mod unified;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}
