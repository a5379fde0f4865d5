//! Engine event loop.
//!
//! The engine is single-threaded. Native work runs on the worker pool; each
//! task posts a [`Completion`] back over a channel and the loop runs the
//! matching continuation on the engine thread, which is the only place
//! promises are settled and script callbacks are invoked.
//!
//! One loop iteration:
//! 1. drain engine jobs (promise reactions)
//! 2. fire at most one due timer
//! 3. dispatch one finished worker task
//! 4. if nothing is ready, block until the next timer deadline or completion

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use rquickjs::function::Rest;
use rquickjs::{CatchResultExt, Context, Ctx, Exception, Function, Persistent, Value};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

type Payload = Box<dyn Any + Send>;
type Continuation = Box<dyn for<'js> FnOnce(Ctx<'js>, Payload) -> rquickjs::Result<()>>;

/// Result of a worker task; `payload` is `None` when the task panicked.
struct Completion {
    id: u64,
    payload: Option<Payload>,
}

struct Timer {
    deadline: Instant,
    interval: Option<Duration>,
    callback: Persistent<Function<'static>>,
    args: Vec<Persistent<Value<'static>>>,
}

/// Stop request shared between the engine thread and interrupt handles.
#[derive(Default)]
pub(crate) struct Interrupt {
    requested: AtomicBool,
    wake: Notify,
}

impl Interrupt {
    pub(crate) fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Timers, in-flight worker tasks and their continuations.
pub(crate) struct EventLoop {
    handle: Handle,
    interrupt: Arc<Interrupt>,
    tx: UnboundedSender<Completion>,
    rx: RefCell<UnboundedReceiver<Completion>>,
    pending: RefCell<HashMap<u64, Continuation>>,
    timers: RefCell<BTreeMap<u64, Timer>>,
    next_id: Cell<u64>,
}

impl EventLoop {
    pub(crate) fn new(handle: Handle, interrupt: Arc<Interrupt>) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            handle,
            interrupt,
            tx,
            rx: RefCell::new(rx),
            pending: RefCell::new(HashMap::new()),
            timers: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Run `future` on the worker pool; `on_complete` receives its output on
    /// the engine thread.
    pub(crate) fn spawn<T, Fut, F>(&self, future: Fut, on_complete: F)
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        F: for<'js> FnOnce(Ctx<'js>, T) -> rquickjs::Result<()> + 'static,
    {
        let id = self.next_id();
        let continuation: Continuation = Box::new(move |ctx, payload: Payload| {
            match payload.downcast::<T>() {
                Ok(value) => on_complete(ctx, *value),
                Err(_) => Err(Exception::throw_message(&ctx, "unexpected worker result type")),
            }
        });
        self.pending.borrow_mut().insert(id, continuation);

        let tx = self.tx.clone();
        self.handle.spawn(async move {
            let payload = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .ok()
                .map(|value| Box::new(value) as Payload);
            let _ = tx.send(Completion { id, payload });
        });
    }

    /// Schedule `callback(...args)` after `delay`, repeating when `repeat`.
    pub(crate) fn add_timer<'js>(
        &self,
        ctx: &Ctx<'js>,
        callback: Function<'js>,
        args: Vec<Value<'js>>,
        delay: Duration,
        repeat: bool,
    ) -> u64 {
        let id = self.next_id();
        let timer = Timer {
            deadline: Instant::now() + delay,
            interval: repeat.then_some(delay),
            callback: Persistent::save(ctx, callback),
            args: args.into_iter().map(|a| Persistent::save(ctx, a)).collect(),
        };
        self.timers.borrow_mut().insert(id, timer);
        id
    }

    pub(crate) fn clear_timer(&self, id: u64) {
        self.timers.borrow_mut().remove(&id);
    }

    /// Number of timers plus in-flight worker tasks.
    pub(crate) fn outstanding(&self) -> usize {
        self.timers.borrow().len() + self.pending.borrow().len()
    }

    /// Drive the loop until no job, timer or worker task remains.
    pub(crate) fn run(&self, engine: &rquickjs::Runtime, context: &Context) -> Result<()> {
        loop {
            if self.interrupt.is_requested() {
                return Err(Error::Interrupted);
            }
            drain_jobs(engine)?;

            if self.fire_due_timer(context)? {
                continue;
            }

            let ready = self.rx.borrow_mut().try_recv().ok();
            if let Some(completion) = ready {
                self.dispatch(context, completion)?;
                continue;
            }

            if self.pending.borrow().is_empty() && self.timers.borrow().is_empty() {
                return Ok(());
            }

            let deadline = self.timers.borrow().values().map(|t| t.deadline).min();
            let completion = {
                let mut rx = self.rx.borrow_mut();
                let wake = &self.interrupt.wake;
                self.handle.block_on(async {
                    let next = async {
                        match deadline {
                            Some(deadline) => tokio::time::timeout_at(deadline, rx.recv())
                                .await
                                .ok()
                                .flatten(),
                            None => rx.recv().await,
                        }
                    };
                    tokio::select! {
                        completion = next => completion,
                        () = wake.notified() => None,
                    }
                })
            };
            if let Some(completion) = completion {
                self.dispatch(context, completion)?;
            }
        }
    }

    fn fire_due_timer(&self, context: &Context) -> Result<bool> {
        let now = Instant::now();
        let due = self
            .timers
            .borrow()
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .min_by_key(|(id, t)| (t.deadline, **id))
            .map(|(id, _)| *id);
        let Some(id) = due else {
            return Ok(false);
        };
        let Some(mut timer) = self.timers.borrow_mut().remove(&id) else {
            return Ok(false);
        };

        let callback = timer.callback.clone();
        let args = timer.args.clone();
        if let Some(interval) = timer.interval {
            // Re-arm first so the callback can clear its own interval.
            timer.deadline = now + interval;
            self.timers.borrow_mut().insert(id, timer);
        }

        context.with(|ctx| {
            let result: rquickjs::Result<()> = (|| {
                let callback = callback.restore(&ctx)?;
                let args = args
                    .into_iter()
                    .map(|a| a.restore(&ctx))
                    .collect::<rquickjs::Result<Vec<Value>>>()?;
                callback.call::<_, ()>((Rest(args),))
            })();
            result.catch(&ctx).map_err(|e| Error::Script(e.to_string()))
        })?;
        Ok(true)
    }

    fn dispatch(&self, context: &Context, completion: Completion) -> Result<()> {
        let Some(continuation) = self.pending.borrow_mut().remove(&completion.id) else {
            return Ok(());
        };
        let Some(payload) = completion.payload else {
            warn!(task = completion.id, "worker task panicked; dropping its continuation");
            return Ok(());
        };
        debug!(task = completion.id, "worker task completed");
        context.with(|ctx| {
            continuation(ctx.clone(), payload)
                .catch(&ctx)
                .map_err(|e| Error::Script(e.to_string()))
        })
    }

    /// Drop every engine handle held by timers and continuations.
    pub(crate) fn clear(&self) {
        self.timers.borrow_mut().clear();
        self.pending.borrow_mut().clear();
    }
}

fn drain_jobs(engine: &rquickjs::Runtime) -> Result<()> {
    loop {
        match engine.execute_pending_job() {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(job) => {
                let message = job.0.with(|ctx| {
                    let exception = ctx.catch();
                    describe_exception(&exception)
                });
                return Err(Error::Script(message));
            }
        }
    }
}

/// `Name: message` plus stack for an exception value, or its string form.
pub(crate) fn describe_exception(value: &Value<'_>) -> String {
    if let Some(exception) = value.as_exception() {
        let message = exception.message().unwrap_or_default();
        let name = exception
            .get::<_, Option<String>>("name")
            .ok()
            .flatten()
            .unwrap_or_else(|| "Error".to_string());
        return match exception.stack() {
            Some(stack) if !stack.trim().is_empty() => {
                format!("{name}: {message}\n{}", stack.trim_end())
            }
            _ => format!("{name}: {message}"),
        };
    }
    value
        .get::<rquickjs::convert::Coerced<String>>()
        .map(|s| s.0)
        .unwrap_or_else(|_| "uncaught exception".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn setup() -> (tokio::runtime::Runtime, rquickjs::Runtime, Context) {
        let workers = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let engine = rquickjs::Runtime::new().unwrap();
        let context = Context::full(&engine).unwrap();
        (workers, engine, context)
    }

    #[test]
    fn worker_results_reach_the_engine_thread() {
        let (workers, engine, context) = setup();
        let event_loop = Rc::new(EventLoop::new(workers.handle().clone(), Arc::default()));

        context.with(|ctx| {
            ctx.globals().set("got", 0).unwrap();
        });
        event_loop.spawn(async { 41 + 1 }, |ctx, value: i32| {
            ctx.globals().set("got", value)
        });
        assert_eq!(event_loop.outstanding(), 1);
        event_loop.run(&engine, &context).unwrap();

        context.with(|ctx| {
            assert_eq!(ctx.globals().get::<_, i32>("got").unwrap(), 42);
        });
        assert_eq!(event_loop.outstanding(), 0);
    }

    #[test]
    fn panicking_task_does_not_hang() {
        let (workers, engine, context) = setup();
        let event_loop = EventLoop::new(workers.handle().clone(), Arc::default());
        event_loop.spawn(
            async {
                if true {
                    panic!("boom");
                }
                1
            },
            |_ctx, _: i32| Ok(()),
        );
        event_loop.run(&engine, &context).unwrap();
        assert_eq!(event_loop.outstanding(), 0);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let (workers, engine, context) = setup();
        let event_loop = EventLoop::new(workers.handle().clone(), Arc::default());

        context.with(|ctx| {
            ctx.eval::<(), _>("var order = []; function push(x) { order.push(x); }")
                .unwrap();
            let push: Function = ctx.globals().get("push").unwrap();
            for (label, ms) in [("slow", 20u64), ("fast", 1), ("mid", 10)] {
                let arg = rquickjs::String::from_str(ctx.clone(), label).unwrap();
                event_loop.add_timer(
                    &ctx,
                    push.clone(),
                    vec![arg.into_value()],
                    Duration::from_millis(ms),
                    false,
                );
            }
        });
        event_loop.run(&engine, &context).unwrap();

        context.with(|ctx| {
            let order: String = ctx.eval("order.join(',')").unwrap();
            assert_eq!(order, "fast,mid,slow");
        });
    }

    #[test]
    fn cleared_timer_never_fires() {
        let (workers, engine, context) = setup();
        let event_loop = EventLoop::new(workers.handle().clone(), Arc::default());

        context.with(|ctx| {
            ctx.eval::<(), _>("var fired = false; function f() { fired = true; }")
                .unwrap();
            let f: Function = ctx.globals().get("f").unwrap();
            let id = event_loop.add_timer(&ctx, f, Vec::new(), Duration::from_millis(5), false);
            event_loop.clear_timer(id);
        });
        event_loop.run(&engine, &context).unwrap();

        context.with(|ctx| {
            assert!(!ctx.eval::<bool, _>("fired").unwrap());
        });
    }

    #[test]
    fn timer_exception_is_reported() {
        let (workers, engine, context) = setup();
        let event_loop = EventLoop::new(workers.handle().clone(), Arc::default());

        context.with(|ctx| {
            let f: Function = ctx
                .eval("(function () { throw new TypeError('bad tick'); })")
                .unwrap();
            event_loop.add_timer(&ctx, f, Vec::new(), Duration::ZERO, false);
        });
        let err = event_loop.run(&engine, &context).unwrap_err();
        assert!(err.to_string().contains("bad tick"), "got: {err}");
        event_loop.clear();
    }

    #[test]
    fn interrupt_wakes_a_waiting_loop() {
        let (workers, engine, context) = setup();
        let interrupt = Arc::new(Interrupt::default());
        let event_loop = EventLoop::new(workers.handle().clone(), interrupt.clone());

        context.with(|ctx| {
            let f: Function = ctx.eval("(function () {})").unwrap();
            event_loop.add_timer(&ctx, f, Vec::new(), Duration::from_secs(60), false);
        });
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            interrupt.request();
        });
        let started = std::time::Instant::now();
        let err = event_loop.run(&engine, &context).unwrap_err();
        stopper.join().unwrap();
        assert!(matches!(err, Error::Interrupted), "got: {err}");
        assert!(started.elapsed() < Duration::from_secs(30));
        event_loop.clear();
    }
}
