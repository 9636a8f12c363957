// 该文件是 Hexi （河西） 项目的一部分。
// src/coordinator/dedicated.rs - 持久工作线程
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

//! 与线程绑定的会话（软件解释器、NPU）在这里创建并一直留在这里。
//!
//! 工作线程平时停在“开始”条件变量上；协调线程放入一个任务并唤醒它，
//! 随后在“结束”条件变量上等待它交回结果。

use std::{
  sync::{Arc, Condvar, Mutex, PoisonError, mpsc},
  thread::{self, JoinHandle},
};

use tracing::{debug, error, info};

use super::{Batch, BatchError, drive};
use crate::{
  session::{BackendId, BackendSession, SessionError},
  sync::lock,
  unified::{IoRange, UnifiedIo},
};

pub(crate) struct Job {
  pub batch: Arc<Batch>,
  pub io: Arc<UnifiedIo>,
  pub range: IoRange,
  pub items: Vec<usize>,
}

#[derive(Default)]
struct State {
  job: Option<Job>,
  done: Option<Result<(), BatchError>>,
  shutdown: bool,
  stopped: bool,
}

struct Handoff {
  state: Mutex<State>,
  start: Condvar,
  end: Condvar,
}

/// 线程退出（包括 panic 展开）时通知等待方
struct ExitGuard(Arc<Handoff>);

impl Drop for ExitGuard {
  fn drop(&mut self) {
    let mut state = lock(&self.0.state);
    state.stopped = true;
    self.0.end.notify_all();
  }
}

/// 持久工作线程的所有者，析构时停止并回收线程
pub struct DedicatedWorker {
  handle: DedicatedHandle,
  thread: Option<JoinHandle<()>>,
}

/// 向持久工作线程派发任务的句柄
#[derive(Clone)]
pub struct DedicatedHandle {
  backend: BackendId,
  handoff: Arc<Handoff>,
}

impl DedicatedWorker {
  /// 启动工作线程并在其上调用 `build` 构造会话。
  ///
  /// `build` 除会话外还可返回任意描述信息 `T`，构造完成后交回调用方；
  /// 构造失败时线程退出，错误原样返回。
  pub fn spawn<F, T>(backend: BackendId, build: F) -> Result<(Self, T), SessionError>
  where
    F: FnOnce() -> Result<(Box<dyn BackendSession>, T), SessionError> + Send + 'static,
    T: Send + 'static,
  {
    let handoff = Arc::new(Handoff {
      state: Mutex::new(State::default()),
      start: Condvar::new(),
      end: Condvar::new(),
    });
    let (tx, rx) = mpsc::channel();

    let thread = {
      let handoff = handoff.clone();
      thread::Builder::new()
        .name(format!("hexi-{}", backend))
        .spawn(move || {
          let _guard = ExitGuard(handoff.clone());
          let session = match build() {
            Ok((session, describe)) => {
              let _ = tx.send(Ok(describe));
              session
            }
            Err(e) => {
              let _ = tx.send(Err(e));
              return;
            }
          };
          serve(backend, session, &handoff);
        })
        .map_err(|e| SessionError::Unavailable(format!("无法启动 {} 工作线程: {}", backend, e)))?
    };

    let worker = DedicatedWorker {
      handle: DedicatedHandle { backend, handoff },
      thread: Some(thread),
    };
    match rx.recv() {
      Ok(Ok(describe)) => {
        info!("{} 持久工作线程已就绪", backend);
        Ok((worker, describe))
      }
      Ok(Err(e)) => Err(e),
      Err(_) => Err(SessionError::Unavailable(format!(
        "{} 工作线程在构造会话时退出",
        backend
      ))),
    }
  }

  pub fn handle(&self) -> DedicatedHandle {
    self.handle.clone()
  }

  pub fn shutdown(&mut self) {
    {
      let mut state = lock(&self.handle.handoff.state);
      state.shutdown = true;
      self.handle.handoff.start.notify_all();
    }
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        error!("{} 工作线程异常退出", self.handle.backend);
      }
      debug!("{} 工作线程已回收", self.handle.backend);
    }
  }
}

impl Drop for DedicatedWorker {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn serve(backend: BackendId, mut session: Box<dyn BackendSession>, handoff: &Handoff) {
  loop {
    let job = {
      let mut state = lock(&handoff.state);
      loop {
        if state.shutdown {
          return;
        }
        if let Some(job) = state.job.take() {
          break job;
        }
        state = handoff
          .start
          .wait(state)
          .unwrap_or_else(PoisonError::into_inner);
      }
    };

    debug!("{} 开始处理 {} 个条目", backend, job.items.len());
    let result = drive(session.as_mut(), &job.io, &job.range, &job.batch, &job.items);

    let mut state = lock(&handoff.state);
    state.done = Some(result);
    handoff.end.notify_all();
  }
}

impl DedicatedHandle {
  pub fn backend(&self) -> BackendId {
    self.backend
  }

  /// 派发一个任务，不等待结果。
  ///
  /// 同一时刻只有一个批次在执行，因此不会有两个任务争用同一个工作线程。
  pub(crate) fn submit(&self, job: Job) -> Result<(), BatchError> {
    let mut state = lock(&self.handoff.state);
    if state.stopped || state.shutdown {
      return Err(BatchError::WorkerStopped(self.backend));
    }
    state.done = None;
    state.job = Some(job);
    self.handoff.start.notify_all();
    Ok(())
  }

  /// 阻塞到工作线程交回上一次 [`DedicatedHandle::submit`] 的结果
  pub(crate) fn collect(&self) -> Result<(), BatchError> {
    let mut state = lock(&self.handoff.state);
    loop {
      if let Some(result) = state.done.take() {
        return result;
      }
      if state.stopped {
        return Err(BatchError::WorkerStopped(self.backend));
      }
      state = self
        .handoff
        .end
        .wait(state)
        .unwrap_or_else(PoisonError::into_inner);
    }
  }
}
