// 该文件是 Hexi （河西） 项目的一部分。
// src/binding.rs - 模型绑定
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

//! 由模型文件后缀决定要构造哪些后端会话：
//!
//! | 后缀          | 模式                | 实际文件                          |
//! |---------------|---------------------|-----------------------------------|
//! | `.tflite`     | 仅软件解释器        | 自身                              |
//! | `.mxq`        | 仅 NPU              | 自身                              |
//! | `.hef`        | 仅流式设备          | 自身                              |
//! | `.tflitemxq`  | 软件解释器 + NPU    | `<stem>.tflite` + `<stem>.mxq`    |
//! | `.tflitehef`  | 软件解释器 + 流式设备 | `<stem>.tflite` + `<stem>.hef`  |
//!
//! ```no_run
//! use hexi::{FromUrl, binding::ModelSource};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("model:///models/yolo.tflitehef?delegate=dsp,gpu&devices=2&batch=16")?;
//! let source = ModelSource::from_url(&url)?;
//! # Ok(())
//! # }
//! ```

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  coordinator::{Lane, dedicated::DedicatedWorker},
  session::{
    BACKEND_SLOTS, BackendFactory, BackendFamily, BackendId, BackendSession, Delegate,
    MAX_STREAMING_DEVICES, NpuSession, SessionError, SoftwareSession, StreamingSession,
  },
  tensor::TensorDescriptor,
  unified::IoRange,
};

#[derive(Error, Debug)]
pub enum BindError {
  #[error("模型路径必须使用 {0} 方案")]
  Scheme(&'static str),
  #[error("无法识别的模型文件: {0}")]
  UnknownSuffix(PathBuf),
  #[error("无效的参数 {key}={value}")]
  InvalidOption { key: String, value: String },
  #[error("构造 {backend} 会话失败: {source}")]
  Session {
    backend: BackendId,
    #[source]
    source: SessionError,
  },
  #[error("没有发现可用的流式设备")]
  NoStreamingDevice,
  #[error("{0} 的输入输出布局与其他流式设备不一致")]
  LayoutMismatch(BackendId),
}

impl BindError {
  fn session(backend: BackendId) -> impl FnOnce(SessionError) -> BindError {
    move |source| BindError::Session { backend, source }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
  SoftwareOnly,
  NpuOnly,
  StreamingOnly,
  SoftwareNpu,
  SoftwareStreaming,
}

impl BindingMode {
  pub fn uses_software(self) -> bool {
    matches!(
      self,
      BindingMode::SoftwareOnly | BindingMode::SoftwareNpu | BindingMode::SoftwareStreaming
    )
  }

  pub fn is_hybrid(self) -> bool {
    matches!(self, BindingMode::SoftwareNpu | BindingMode::SoftwareStreaming)
  }

  /// 除软件解释器外的主加速器
  pub fn primary(self) -> Option<BackendFamily> {
    match self {
      BindingMode::SoftwareOnly => None,
      BindingMode::NpuOnly | BindingMode::SoftwareNpu => Some(BackendFamily::Npu),
      BindingMode::StreamingOnly | BindingMode::SoftwareStreaming => Some(BackendFamily::Streaming),
    }
  }
}

/// 后缀解析出的实际模型文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
  pub mode: BindingMode,
  pub software: Option<PathBuf>,
  pub primary: Option<PathBuf>,
}

impl ModelArtifacts {
  pub fn resolve(path: &Path) -> Result<Self, BindError> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let (mode, software, primary) = match extension {
      "tflite" => (BindingMode::SoftwareOnly, Some(path.to_path_buf()), None),
      "mxq" => (BindingMode::NpuOnly, None, Some(path.to_path_buf())),
      "hef" => (BindingMode::StreamingOnly, None, Some(path.to_path_buf())),
      "tflitemxq" => (
        BindingMode::SoftwareNpu,
        Some(path.with_extension("tflite")),
        Some(path.with_extension("mxq")),
      ),
      "tflitehef" => (
        BindingMode::SoftwareStreaming,
        Some(path.with_extension("tflite")),
        Some(path.with_extension("hef")),
      ),
      _ => return Err(BindError::UnknownSuffix(path.to_path_buf())),
    };
    Ok(ModelArtifacts {
      mode,
      software,
      primary,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOptions {
  /// 混合模式下依次尝试的代理
  pub delegates: Vec<Delegate>,
  /// 解释器线程数
  pub threads: Option<usize>,
  /// 最多使用的流式设备数
  pub max_devices: usize,
  /// 初始批次大小
  pub batch_size: usize,
}

impl Default for BindOptions {
  fn default() -> Self {
    BindOptions {
      delegates: vec![Delegate::Gpu, Delegate::Dsp],
      threads: None,
      max_devices: MAX_STREAMING_DEVICES,
      batch_size: 1,
    }
  }
}

/// 模型来源：文件路径加绑定参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
  path: PathBuf,
  options: BindOptions,
}

fn invalid(key: &str, value: &str) -> BindError {
  BindError::InvalidOption {
    key: key.to_string(),
    value: value.to_string(),
  }
}

fn parse_count(key: &str, value: &str) -> Result<usize, BindError> {
  value
    .parse::<usize>()
    .ok()
    .filter(|&n| n > 0)
    .ok_or_else(|| invalid(key, value))
}

impl FromUrl for ModelSource {
  type Error = BindError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(BindError::Scheme(Self::SCHEME));
    }

    let query: HashMap<_, _> = url.query_pairs().collect();
    let mut options = BindOptions::default();
    if let Some(value) = query.get("delegate") {
      options.delegates = value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<Delegate>().map_err(|_| invalid("delegate", value)))
        .collect::<Result<_, _>>()?;
    }
    if let Some(value) = query.get("threads") {
      options.threads = Some(parse_count("threads", value)?);
    }
    if let Some(value) = query.get("devices") {
      let devices = value
        .parse::<usize>()
        .ok()
        .filter(|&n| n <= MAX_STREAMING_DEVICES)
        .ok_or_else(|| invalid("devices", value))?;
      options.max_devices = devices;
    }
    if let Some(value) = query.get("batch") {
      options.batch_size = parse_count("batch", value)?;
    }

    Ok(ModelSource {
      path: PathBuf::from(url.path()),
      options,
    })
  }
}

impl FromUrlWithScheme for ModelSource {
  const SCHEME: &'static str = "model";
}

impl ModelSource {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    ModelSource {
      path: path.into(),
      options: BindOptions::default(),
    }
  }

  pub fn delegates(mut self, delegates: &[Delegate]) -> Self {
    self.options.delegates = delegates.to_vec();
    self
  }

  pub fn threads(mut self, threads: usize) -> Self {
    self.options.threads = Some(threads);
    self
  }

  pub fn max_devices(mut self, devices: usize) -> Self {
    self.options.max_devices = devices.min(MAX_STREAMING_DEVICES);
    self
  }

  pub fn batch_size(mut self, batch_size: usize) -> Self {
    self.options.batch_size = batch_size;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn options(&self) -> &BindOptions {
    &self.options
  }
}

/// 可调度的后端及其代理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInfo {
  pub id: BackendId,
  pub delegate: Option<Delegate>,
}

/// 后端会话自身的输入输出描述
struct Layout {
  delegate: Option<Delegate>,
  inputs: Vec<TensorDescriptor>,
  outputs: Vec<TensorDescriptor>,
}

impl Layout {
  fn of(session: &dyn BackendSession, delegate: Option<Delegate>) -> Self {
    Layout {
      delegate,
      inputs: session.inputs().to_vec(),
      outputs: session.outputs().to_vec(),
    }
  }
}

/// 会话留在自己持久工作线程上的后端（软件解释器、NPU）
pub(crate) struct DedicatedBackend {
  pub backend: BackendId,
  pub worker: DedicatedWorker,
  pub delegate: Option<Delegate>,
  pub range: IoRange,
}

/// 一次绑定的结果：各后端会话和统一输入输出布局（首维为 1）
pub struct Binding {
  pub(crate) mode: BindingMode,
  pub(crate) dedicated: Vec<DedicatedBackend>,
  pub(crate) lanes: Vec<Lane>,
  pub(crate) inputs: Vec<TensorDescriptor>,
  pub(crate) outputs: Vec<TensorDescriptor>,
}

impl Binding {
  pub fn mode(&self) -> BindingMode {
    self.mode
  }

  pub fn inputs(&self) -> &[TensorDescriptor] {
    &self.inputs
  }

  pub fn outputs(&self) -> &[TensorDescriptor] {
    &self.outputs
  }

  pub fn backends(&self) -> Vec<BackendInfo> {
    self
      .dedicated
      .iter()
      .map(|d| BackendInfo {
        id: d.backend,
        delegate: d.delegate,
      })
      .chain(self.lanes.iter().map(|lane| BackendInfo {
        id: lane.backend,
        delegate: None,
      }))
      .collect()
  }

  /// 按 [`BackendId::SCHEDULABLE`] 排列的可用性
  pub fn available(&self) -> [bool; BACKEND_SLOTS] {
    let backends = self.backends();
    BackendId::SCHEDULABLE.map(|id| backends.iter().any(|b| b.id == id))
  }
}

fn spawn_software(
  path: PathBuf,
  delegates: Vec<Delegate>,
  threads: Option<usize>,
  factory: Arc<dyn BackendFactory>,
) -> Result<(DedicatedWorker, Layout), SessionError> {
  DedicatedWorker::spawn(BackendId::Software, move || {
    let mut last = None;
    for delegate in delegates {
      match factory.software(&path, delegate, threads) {
        Ok(native) => {
          info!("软件解释器已挂载代理 {}: {}", delegate, path.display());
          let session = SoftwareSession::new(delegate, native);
          let layout = Layout::of(&session, Some(session.delegate()));
          let session: Box<dyn BackendSession> = Box::new(session);
          return Ok((session, layout));
        }
        Err(e) => {
          warn!("代理 {} 不可用: {}", delegate, e);
          last = Some(e);
        }
      }
    }
    Err(last.unwrap_or_else(|| SessionError::Unavailable("没有可尝试的代理".to_string())))
  })
}

fn spawn_npu(
  path: PathBuf,
  factory: Arc<dyn BackendFactory>,
) -> Result<(DedicatedWorker, Layout), SessionError> {
  DedicatedWorker::spawn(BackendId::Npu, move || {
    let native = factory.npu(&path)?;
    info!("NPU 会话已创建: {}", path.display());
    let session = NpuSession::new(native);
    let layout = Layout::of(&session, None);
    let session: Box<dyn BackendSession> = Box::new(session);
    Ok((session, layout))
  })
}

fn same_layout(a: &[TensorDescriptor], b: &[TensorDescriptor]) -> bool {
  a.len() == b.len()
    && a
      .iter()
      .zip(b)
      .all(|(x, y)| x.shape() == y.shape() && x.element_type() == y.element_type())
}

/// 打开所有流式设备，要求它们的输入输出布局一致
fn bind_streaming(
  path: &Path,
  options: &BindOptions,
  factory: &dyn BackendFactory,
) -> Result<Vec<(BackendId, Box<dyn BackendSession + Send>)>, BindError> {
  let discovered = factory
    .streaming_devices()
    .map_err(BindError::session(BackendId::Streaming1))?;
  let devices = discovered.min(options.max_devices).min(MAX_STREAMING_DEVICES);
  info!("发现 {} 个流式设备, 使用 {} 个", discovered, devices);
  if devices == 0 {
    return Err(BindError::NoStreamingDevice);
  }

  let mut sessions: Vec<(BackendId, Box<dyn BackendSession + Send>)> = Vec::new();
  for device in 0..devices {
    let backend = BackendId::streaming(device).unwrap_or_default();
    let native = factory
      .streaming(path, device)
      .map_err(BindError::session(backend))?;
    let session = StreamingSession::new(device, native).map_err(BindError::session(backend))?;
    if let Some((_, first)) = sessions.first() {
      if !same_layout(first.inputs(), session.inputs())
        || !same_layout(first.outputs(), session.outputs())
      {
        return Err(BindError::LayoutMismatch(backend));
      }
    }
    let session: Box<dyn BackendSession + Send> = Box::new(session);
    sessions.push((backend, session));
  }
  Ok(sessions)
}

/// 把一个后端的输入输出追加到统一布局，返回它占用的区间
fn place(
  inputs: &mut Vec<TensorDescriptor>,
  outputs: &mut Vec<TensorDescriptor>,
  own_inputs: &[TensorDescriptor],
  own_outputs: &[TensorDescriptor],
) -> IoRange {
  let range = IoRange {
    inputs: inputs.len()..inputs.len() + own_inputs.len(),
    outputs: outputs.len()..outputs.len() + own_outputs.len(),
  };
  inputs.extend_from_slice(own_inputs);
  outputs.extend_from_slice(own_outputs);
  range
}

/// 按模型来源构造所有后端会话。
///
/// 软件解释器与 NPU 会话各自在持久工作线程上创建；混合模式下所有代理都挂载失败时，
/// 软件解释器不参与调度，仅记录警告。统一布局中软件解释器在前，主加速器在后。
pub fn bind(source: &ModelSource, factory: Arc<dyn BackendFactory>) -> Result<Binding, BindError> {
  let artifacts = ModelArtifacts::resolve(source.path())?;
  let options = source.options();
  info!("绑定模型 {} ({:?})", source.path().display(), artifacts.mode);

  let mut built = Vec::new();
  if let Some(path) = &artifacts.software {
    let mut delegates = options.delegates.clone();
    if !artifacts.mode.is_hybrid() && !delegates.contains(&Delegate::Cpu) {
      delegates.push(Delegate::Cpu);
    }
    match spawn_software(path.clone(), delegates, options.threads, factory.clone()) {
      Ok((worker, layout)) => built.push((BackendId::Software, worker, layout)),
      Err(e) if artifacts.mode.is_hybrid() => {
        warn!("软件解释器不可用, 不参与调度: {}", e);
      }
      Err(e) => {
        return Err(BindError::Session {
          backend: BackendId::Software,
          source: e,
        });
      }
    }
  }

  let mut streaming = Vec::new();
  match (artifacts.mode.primary(), &artifacts.primary) {
    (Some(BackendFamily::Npu), Some(path)) => {
      let (worker, layout) =
        spawn_npu(path.clone(), factory.clone()).map_err(BindError::session(BackendId::Npu))?;
      built.push((BackendId::Npu, worker, layout));
    }
    (Some(BackendFamily::Streaming), Some(path)) => {
      streaming = bind_streaming(path, options, factory.as_ref())?;
    }
    _ => {}
  }

  let mut inputs = Vec::new();
  let mut outputs = Vec::new();
  let dedicated: Vec<_> = built
    .into_iter()
    .map(|(backend, worker, layout)| DedicatedBackend {
      backend,
      worker,
      delegate: layout.delegate,
      range: place(&mut inputs, &mut outputs, &layout.inputs, &layout.outputs),
    })
    .collect();

  // 所有流式设备运行同一个模型，共用一段统一索引
  let mut lanes = Vec::new();
  if let Some((_, first)) = streaming.first() {
    let range = place(&mut inputs, &mut outputs, first.inputs(), first.outputs());
    for (backend, session) in streaming {
      lanes.push(Lane {
        backend,
        session: Arc::new(Mutex::new(session)),
        range: range.clone(),
      });
    }
  }

  debug!(
    "统一布局: {} 个输入, {} 个输出",
    inputs.len(),
    outputs.len()
  );

  Ok(Binding {
    mode: artifacts.mode,
    dedicated,
    lanes,
    inputs,
    outputs,
  })
}
