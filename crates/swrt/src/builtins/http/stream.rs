//! Stream handles for `responseType: 'stream'`.
//!
//! The script owns the body: nothing is read until it calls `read`,
//! `pipeToFile` or `copy`, and the connection stays open until `close()` or
//! the body is exhausted. Reads run on the worker pool; results come back as
//! promises.

use std::rc::Rc;
use std::sync::Arc;

use rquickjs::function::Opt;
use rquickjs::{Ctx, Function, Object, Persistent, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::limits::SMALL_BUFFER_SIZE;
use crate::runtime::event_loop::EventLoop;
use crate::runtime::js::{PromiseHandle, throw, to_display};
use crate::security::PathValidator;

struct StreamBody {
    response: reqwest::Response,
    /// Bytes received but not yet handed out.
    pending: Vec<u8>,
    eof: bool,
}

impl StreamBody {
    /// Append the next network chunk to `pending`, or mark EOF.
    async fn pull(&mut self) -> Result<()> {
        match self.response.chunk().await.map_err(super::executor::transport_error)? {
            Some(chunk) => self.pending.extend_from_slice(&chunk),
            None => self.eof = true,
        }
        Ok(())
    }
}

/// Shared, closable response body.
#[derive(Clone)]
pub(crate) struct StreamHandle {
    body: Arc<Mutex<Option<StreamBody>>>,
}

impl StreamHandle {
    pub(crate) fn new(response: reqwest::Response) -> Self {
        Self {
            body: Arc::new(Mutex::new(Some(StreamBody {
                response,
                pending: Vec::new(),
                eof: false,
            }))),
        }
    }

    /// Next chunk of at most `size` bytes as text; empty at EOF or once closed.
    pub(crate) async fn read(&self, size: usize) -> Result<String> {
        let mut guard = self.body.lock().await;
        let Some(body) = guard.as_mut() else {
            return Ok(String::new());
        };
        let take = loop {
            while body.pending.len() < size && !body.eof {
                body.pull().await?;
            }
            match utf8_boundary(&body.pending, size, body.eof) {
                Some(take) => break take,
                None => body.pull().await?,
            }
        };
        let chunk: Vec<u8> = body.pending.drain(..take).collect();
        Ok(String::from_utf8_lossy(&chunk).into_owned())
    }

    /// Next raw chunk as it arrived; empty at EOF or once closed.
    async fn next_chunk(&self) -> Result<Vec<u8>> {
        let mut guard = self.body.lock().await;
        let Some(body) = guard.as_mut() else {
            return Ok(Vec::new());
        };
        if !body.pending.is_empty() {
            return Ok(std::mem::take(&mut body.pending));
        }
        if body.eof {
            return Ok(Vec::new());
        }
        match body.response.chunk().await.map_err(super::executor::transport_error)? {
            Some(chunk) => Ok(chunk.to_vec()),
            None => {
                body.eof = true;
                Ok(Vec::new())
            }
        }
    }

    /// Write the rest of the body to `path`, then close the stream.
    pub(crate) async fn pipe_to_file(&self, path: std::path::PathBuf) -> Result<u64> {
        let mut file = tokio::fs::File::create(&path).await?;
        let mut written = 0u64;
        loop {
            let chunk = self.next_chunk().await?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        self.close().await;
        debug!(path = %path.display(), bytes = written, "stream written to file");
        Ok(written)
    }

    pub(crate) async fn close(&self) {
        self.body.lock().await.take();
    }

    /// Close without waiting when no read is in flight.
    fn try_close(&self) -> bool {
        match self.body.try_lock() {
            Ok(mut guard) => {
                guard.take();
                true
            }
            Err(_) => false,
        }
    }
}

/// Bytes to hand out from `buf` for a read of `size`, or `None` while the
/// first character is incomplete and more body may follow. Never splits a
/// UTF-8 sequence unless the body ended mid-sequence or the data is not UTF-8.
fn utf8_boundary(buf: &[u8], size: usize, eof: bool) -> Option<usize> {
    let n = size.min(buf.len());
    match std::str::from_utf8(&buf[..n]) {
        Ok(_) => Some(n),
        Err(e) if e.error_len().is_some() => Some(n),
        Err(e) if e.valid_up_to() > 0 => Some(e.valid_up_to()),
        Err(_) => {
            // A single character wider than `size`: hand it out whole.
            let head = &buf[..buf.len().min(4)];
            if let Some(len) = (1..=head.len()).find(|&len| std::str::from_utf8(&head[..len]).is_ok()) {
                return Some(len);
            }
            match std::str::from_utf8(head) {
                Err(e) if e.error_len().is_some() => Some(n),
                _ if eof => Some(buf.len()),
                _ => None,
            }
        }
    }
}

/// Build the script-facing stream object.
pub(crate) fn stream_object<'js>(
    ctx: &Ctx<'js>,
    handle: StreamHandle,
    event_loop: Rc<EventLoop>,
    paths: PathValidator,
) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;

    {
        let handle = handle.clone();
        let event_loop = event_loop.clone();
        obj.set(
            "read",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, size: Opt<Value<'js>>| {
                let size = size
                    .0
                    .and_then(|v| v.as_number())
                    .filter(|n| n.is_finite() && *n >= 1.0)
                    .map(|n| n as usize)
                    .unwrap_or(SMALL_BUFFER_SIZE);
                let (promise, settle) = PromiseHandle::new(&ctx)?;
                let handle = handle.clone();
                event_loop.spawn(async move { handle.read(size).await }, move |ctx, result: Result<String>| {
                    match result {
                        Ok(text) => {
                            let text = rquickjs::String::from_str(ctx.clone(), &text)?;
                            settle.resolve(&ctx, text.into_value())
                        }
                        Err(e) => settle.reject_with(&ctx, e),
                    }
                });
                Ok::<_, rquickjs::Error>(promise)
            })?,
        )?;
    }

    {
        let handle = handle.clone();
        let event_loop = event_loop.clone();
        obj.set(
            "close",
            Function::new(ctx.clone(), move || {
                if !handle.try_close() {
                    let handle = handle.clone();
                    event_loop.spawn(async move { handle.close().await }, |_, ()| Ok(()));
                }
            })?,
        )?;
    }

    {
        let handle = handle.clone();
        let event_loop = event_loop.clone();
        obj.set(
            "pipeToFile",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: Opt<Value<'js>>| {
                let (promise, settle) = PromiseHandle::new(&ctx)?;
                let target = match path.0.filter(|p| !p.is_undefined()) {
                    None => Err(Error::validation("file path required")),
                    Some(p) => paths.validate(to_display(&p)),
                };
                match target {
                    Err(e) => settle.reject_with(&ctx, e)?,
                    Ok(target) => {
                        let handle = handle.clone();
                        event_loop.spawn(
                            async move { handle.pipe_to_file(target).await },
                            move |ctx, result: Result<u64>| match result {
                                Ok(bytes) => settle.resolve(&ctx, Value::new_number(ctx.clone(), bytes as f64)),
                                Err(e) => settle.reject_with(&ctx, e),
                            },
                        );
                    }
                }
                Ok::<_, rquickjs::Error>(promise)
            })?,
        )?;
    }

    {
        let handle = handle.clone();
        let event_loop = event_loop.clone();
        obj.set(
            "copy",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, dest: Opt<Value<'js>>| {
                let writer = dest.0.and_then(|d| d.into_object()).ok_or_else(|| {
                    throw(&ctx, "destination must be an object with write method")
                })?;
                let write: Value = writer.get("write")?;
                if !write.is_function() {
                    return Err(throw(&ctx, "destination must have a write method"));
                }
                let (promise, settle) = PromiseHandle::new(&ctx)?;
                copy_step(
                    event_loop.clone(),
                    handle.clone(),
                    Persistent::save(&ctx, writer),
                    settle,
                    0,
                );
                Ok(promise)
            })?,
        )?;
    }

    Ok(obj)
}

/// Read one chunk on the worker pool, hand it to `writer.write` on the engine
/// thread, repeat until EOF.
fn copy_step(
    event_loop: Rc<EventLoop>,
    handle: StreamHandle,
    writer: Persistent<Object<'static>>,
    settle: PromiseHandle,
    total: u64,
) {
    let reader = handle.clone();
    let next_loop = event_loop.clone();
    event_loop.spawn(async move { reader.next_chunk().await }, move |ctx, result: Result<Vec<u8>>| {
        let chunk = match result {
            Ok(chunk) => chunk,
            Err(e) => return settle.reject_with(&ctx, e),
        };
        if chunk.is_empty() {
            return settle.resolve(&ctx, Value::new_number(ctx.clone(), total as f64));
        }
        let text = String::from_utf8_lossy(&chunk).into_owned();
        let dest = writer.clone().restore(&ctx)?;
        let write: Function = dest.get("write")?;
        let written = write.call::<_, Value>((rquickjs::function::This(dest), text));
        match written {
            Ok(_) => {
                copy_step(next_loop, handle, writer, settle, total + chunk.len() as u64);
                Ok(())
            }
            Err(err) => settle.settle(&ctx, Err(err)),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_keeps_multibyte_characters_whole() {
        let text = "aé"; // 'é' is two bytes
        let bytes = text.as_bytes();
        assert_eq!(utf8_boundary(bytes, 2, false), Some(1));
        assert_eq!(utf8_boundary(bytes, 3, false), Some(3));
        assert_eq!(utf8_boundary(bytes, 8, true), Some(3));
    }

    #[test]
    fn boundary_hands_out_wide_character_whole() {
        let bytes = "€x".as_bytes(); // '€' is three bytes
        assert_eq!(utf8_boundary(bytes, 1, false), Some(3));
    }

    #[test]
    fn boundary_waits_for_rest_of_partial_character() {
        let bytes = &"€".as_bytes()[..2];
        assert_eq!(utf8_boundary(bytes, 1, false), None);
        assert_eq!(utf8_boundary(bytes, 8, false), None);
        assert_eq!(utf8_boundary(bytes, 1, true), Some(2));
    }

    #[test]
    fn boundary_passes_invalid_bytes_through() {
        let bytes = [0xff, 0xfe, b'a'];
        assert_eq!(utf8_boundary(&bytes, 2, false), Some(2));
        assert_eq!(utf8_boundary(&[0xe2, 0x41], 1, false), Some(1));
    }

    #[test]
    fn boundary_at_eof_with_nothing_left() {
        assert_eq!(utf8_boundary(&[], 16, true), Some(0));
    }
}
