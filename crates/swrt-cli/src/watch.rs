//! `run --watch`: re-run the script when a source file next to it changes.
//!
//! Each run gets a fresh [`Runtime`] on its own thread. A change event is
//! debounced, the current run is interrupted and joined, then the script
//! starts again. Failed runs are reported and the watch continues.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use swrt::{InterruptHandle, Runtime};
use tracing::{debug, warn};

use crate::Printer;

/// Changes inside this window are coalesced into one reload.
pub(crate) const DEBOUNCE: Duration = Duration::from_millis(500);

/// File types that trigger a reload.
const WATCHED_EXTENSIONS: &[&str] = &["js", "ts", "tsx", "json"];

enum Signal {
    Changed(PathBuf),
    Finished(u64, swrt::Result<()>),
}

/// One script run on its own thread.
struct ActiveRun {
    interrupt: Option<InterruptHandle>,
    thread: JoinHandle<()>,
}

impl ActiveRun {
    fn start<F>(generation: u64, script: &Path, make_runtime: &Arc<F>, tx: &Sender<Signal>) -> Self
    where
        F: Fn() -> swrt::Result<Runtime> + Send + Sync + 'static,
    {
        let (handle_tx, handle_rx) = mpsc::channel();
        let script = script.to_path_buf();
        let make_runtime = make_runtime.clone();
        let tx = tx.clone();
        let thread = thread::spawn(move || {
            let result = make_runtime().and_then(|runtime| {
                let _ = handle_tx.send(runtime.interrupt_handle());
                runtime.run_file(&script)
            });
            let _ = tx.send(Signal::Finished(generation, result));
        });
        // Nothing arrives when the runtime could not be built.
        let interrupt = handle_rx.recv().ok();
        Self { interrupt, thread }
    }

    fn stop(self) {
        if let Some(interrupt) = &self.interrupt {
            interrupt.interrupt();
        }
        if self.thread.join().is_err() {
            warn!("script thread panicked");
        }
    }
}

/// Run `script`, then re-run it after every change until the process is
/// killed.
pub(crate) fn watch<F>(out: &Printer, script: &Path, make_runtime: F) -> Result<()>
where
    F: Fn() -> swrt::Result<Runtime> + Send + Sync + 'static,
{
    let dir = script
        .parent()
        .with_context(|| format!("无法确定监控目录: {}", script.display()))?;
    let (tx, rx) = mpsc::channel();

    let changes = tx.clone();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| match event {
        Ok(event) => {
            if let Some(path) = reload_trigger(&event) {
                let _ = changes.send(Signal::Changed(path));
            }
        }
        Err(err) => warn!(error = %err, "file watcher error"),
    })
    .context("创建文件监控器失败")?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("添加文件监控失败: {}", dir.display()))?;

    let make_runtime = Arc::new(make_runtime);
    let mut generation = 0;
    out.verbose(format!("🚀 正在运行: {}", script.display()));
    out.verbose("👀 正在监控文件变化... (按 Ctrl+C 退出)");
    let mut current = Some(ActiveRun::start(generation, script, &make_runtime, &tx));

    let mut reload: Option<(Instant, PathBuf)> = None;
    loop {
        let signal = match &reload {
            Some((deadline, _)) => {
                match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(signal) => Some(signal),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => bail!("文件监控已停止"),
                }
            }
            None => Some(rx.recv().context("文件监控已停止")?),
        };

        match signal {
            Some(Signal::Changed(path)) => {
                debug!(path = %path.display(), "source changed");
                reload = Some((Instant::now() + DEBOUNCE, path));
            }
            Some(Signal::Finished(id, result)) if id == generation => match result {
                Ok(()) => out.verbose("✅ 执行完成"),
                Err(swrt::Error::Interrupted) => {}
                Err(err) => eprintln!("❌ 运行失败: {err}"),
            },
            Some(Signal::Finished(..)) => {}
            None => {
                let Some((_, path)) = reload.take() else {
                    continue;
                };
                out.normal(format!("🔄 检测到文件变化: {}", path.display()));
                if let Some(run) = current.take() {
                    run.stop();
                }
                generation += 1;
                current = Some(ActiveRun::start(generation, script, &make_runtime, &tx));
            }
        }
    }
}

/// The watched source file touched by a create or content/rename event.
fn reload_trigger(event: &Event) -> Option<PathBuf> {
    let relevant = match &event.kind {
        EventKind::Create(_) => true,
        EventKind::Modify(kind) => !matches!(kind, ModifyKind::Metadata(_)),
        _ => false,
    };
    if !relevant {
        return None;
    }
    event.paths.iter().find(|path| is_watched(path)).cloned()
}

fn is_watched(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| WATCHED_EXTENSIONS.contains(&ext))
}
