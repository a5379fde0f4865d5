//! Small helpers for moving values and errors across the engine boundary.

use std::fmt::Display;

use rquickjs::convert::Coerced;
use rquickjs::{Ctx, Exception, Function, IntoJs, Persistent, Promise, Value};

/// Throw `err` as a JS `Error`.
pub(crate) fn throw(ctx: &Ctx<'_>, err: impl Display) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}

/// A fresh JS `Error` object carrying `message`.
pub(crate) fn error_value<'js>(ctx: &Ctx<'js>, message: &str) -> rquickjs::Result<Value<'js>> {
    Exception::from_message(ctx.clone(), message)?.into_js(ctx)
}

/// Turn an engine error into the JS value that was thrown, so it can be
/// forwarded to a promise rejection.
pub(crate) fn thrown_value<'js>(ctx: &Ctx<'js>, err: rquickjs::Error) -> rquickjs::Result<Value<'js>> {
    if err.is_exception() {
        Ok(ctx.catch())
    } else {
        error_value(ctx, &err.to_string())
    }
}

/// String form of a value, as `String(value)` would give.
pub(crate) fn to_display(value: &Value<'_>) -> String {
    value
        .get::<Coerced<String>>()
        .map(|s| s.0)
        .unwrap_or_default()
}

/// Resolve/reject pair of a promise handed to a script, kept alive across a
/// worker round-trip.
pub(crate) struct PromiseHandle {
    resolve: Persistent<Function<'static>>,
    reject: Persistent<Function<'static>>,
}

impl PromiseHandle {
    pub(crate) fn new<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<(Promise<'js>, Self)> {
        let (promise, resolve, reject) = ctx.promise()?;
        let handle = Self {
            resolve: Persistent::save(ctx, resolve),
            reject: Persistent::save(ctx, reject),
        };
        Ok((promise, handle))
    }

    pub(crate) fn resolve<'js>(self, ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<()> {
        self.resolve.restore(ctx)?.call::<_, ()>((value,))
    }

    pub(crate) fn reject<'js>(self, ctx: &Ctx<'js>, reason: Value<'js>) -> rquickjs::Result<()> {
        self.reject.restore(ctx)?.call::<_, ()>((reason,))
    }

    /// Reject with a new `Error` carrying `message`.
    pub(crate) fn reject_with<'js>(self, ctx: &Ctx<'js>, message: impl Display) -> rquickjs::Result<()> {
        let reason = error_value(ctx, &message.to_string())?;
        self.reject(ctx, reason)
    }

    /// Settle with `result`: `Ok` resolves, `Err` rejects with the thrown value.
    pub(crate) fn settle<'js>(
        self,
        ctx: &Ctx<'js>,
        result: rquickjs::Result<Value<'js>>,
    ) -> rquickjs::Result<()> {
        match result {
            Ok(value) => self.resolve(ctx, value),
            Err(err) => {
                let reason = thrown_value(ctx, err)?;
                self.reject(ctx, reason)
            }
        }
    }
}
