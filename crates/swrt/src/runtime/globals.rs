//! Script globals: `console`, timers and the bundle decryption hook.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

use rquickjs::function::{Opt, Rest};
use rquickjs::{Ctx, Function, Object, Value};

use super::event_loop::EventLoop;
use super::js::{throw, to_display};
use crate::bundler::encrypt::{DECRYPT_FN_GLOBAL, DECRYPT_KEY_GLOBAL, decrypt_code};

/// Where `console` output goes.
#[derive(Default)]
pub(crate) struct Output {
    capture: bool,
    stdout: RefCell<String>,
    stderr: RefCell<String>,
}

impl Output {
    pub(crate) fn new(capture: bool) -> Self {
        Self {
            capture,
            ..Self::default()
        }
    }

    fn write(&self, to_stderr: bool, line: &str) {
        if self.capture {
            let mut buf = if to_stderr {
                self.stderr.borrow_mut()
            } else {
                self.stdout.borrow_mut()
            };
            buf.push_str(line);
            buf.push('\n');
        } else if to_stderr {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
        } else {
            let _ = writeln!(std::io::stdout().lock(), "{line}");
        }
    }

    pub(crate) fn stdout(&self) -> String {
        self.stdout.borrow().clone()
    }

    pub(crate) fn stderr(&self) -> String {
        self.stderr.borrow().clone()
    }
}

/// Install `console`, the timer functions and `__swrtDecrypt`; define
/// `__SWRT_DECRYPT_KEY__` when a key is given.
pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    output: Rc<Output>,
    event_loop: Rc<EventLoop>,
    decrypt_key: Option<&str>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    globals.set("console", console(ctx, output)?)?;
    install_timers(ctx, &globals, event_loop)?;

    globals.set(
        DECRYPT_FN_GLOBAL,
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, payload: String, key: String| {
                decrypt_code(&payload, &key).map_err(|e| throw(&ctx, e))
            },
        )?,
    )?;
    if let Some(key) = decrypt_key {
        globals.set(DECRYPT_KEY_GLOBAL, key)?;
    }
    Ok(())
}

fn console<'js>(ctx: &Ctx<'js>, output: Rc<Output>) -> rquickjs::Result<Object<'js>> {
    let console = Object::new(ctx.clone())?;
    for (name, to_stderr) in [
        ("log", false),
        ("info", false),
        ("debug", false),
        ("warn", true),
        ("error", true),
    ] {
        let output = output.clone();
        console.set(
            name,
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
                let line = args
                    .0
                    .iter()
                    .map(|v| format_value(&ctx, v))
                    .collect::<Vec<_>>()
                    .join(" ");
                output.write(to_stderr, &line);
            })?,
        )?;
    }
    Ok(console)
}

/// Console rendering: strings verbatim, errors as `Name: message`, plain
/// objects and arrays as JSON.
fn format_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    if value.is_function() {
        return "[Function]".to_string();
    }
    if value.is_string() || value.is_exception() || !value.is_object() {
        return to_display(value);
    }
    match ctx.json_stringify(value.clone()) {
        Ok(Some(json)) => json.to_string().unwrap_or_default(),
        _ => to_display(value),
    }
}

fn delay_of(value: Option<Value<'_>>) -> Duration {
    let ms = value
        .and_then(|v| v.as_number())
        .filter(|n| n.is_finite() && *n > 0.0)
        .unwrap_or(0.0);
    Duration::from_secs_f64(ms / 1000.0)
}

fn install_timers<'js>(
    ctx: &Ctx<'js>,
    globals: &Object<'js>,
    event_loop: Rc<EventLoop>,
) -> rquickjs::Result<()> {
    for (name, repeat) in [("setTimeout", false), ("setInterval", true)] {
        let event_loop = event_loop.clone();
        globals.set(
            name,
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>,
                      callback: Opt<Value<'js>>,
                      delay: Opt<Value<'js>>,
                      args: Rest<Value<'js>>| {
                    let Some(callback) = callback.0.and_then(|c| c.into_function()) else {
                        return Err(throw(&ctx, format!("{name}: callback must be a function")));
                    };
                    let mut delay = delay_of(delay.0);
                    if repeat {
                        delay = delay.max(Duration::from_millis(1));
                    }
                    let id = event_loop.add_timer(&ctx, callback, args.0, delay, repeat);
                    Ok(id as f64)
                },
            )?,
        )?;
    }

    for name in ["clearTimeout", "clearInterval"] {
        let event_loop = event_loop.clone();
        globals.set(
            name,
            Function::new(ctx.clone(), move |id: Opt<Value<'js>>| {
                if let Some(id) = id.0.and_then(|v| v.as_number()) {
                    event_loop.clear_timer(id as u64);
                }
            })?,
        )?;
    }
    Ok(())
}
