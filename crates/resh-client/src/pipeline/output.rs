//! Remote-to-local half of the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use resh_core::ProcessContext;
use resh_core::constants::{
    CPR_FILTER_MAX, CPR_HOLD_TIMEOUT, IO_BUFFER_SIZE, PIPELINE_POLL_INTERVAL,
};
use resh_core::error::Result;

use super::{LfToCrlf, OutputStream, TransferFilter};
use crate::notification::{Interceptor, OutputCache};
use crate::transport::{BoxedReader, BoxedWriter};

const CURSOR_REQUEST: &[u8] = b"\x1b[6n";

/// Strips `ESC[6n` from output for a short time after a reconnect.
///
/// A request split across reads is held back until the next read decides
/// it, or until [`CprFilter::take_held`] releases it.
#[derive(Debug, Default)]
pub struct CprFilter {
    until: Option<Instant>,
    carry: Vec<u8>,
}

impl CprFilter {
    pub fn arm(&mut self, now: Instant) {
        self.until = Some(now + CPR_FILTER_MAX);
    }

    pub fn disarm(&mut self) {
        self.until = None;
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.until.is_some_and(|t| now < t)
    }

    pub fn holds_partial(&self) -> bool {
        !self.carry.is_empty()
    }

    /// Give up on a held partial request and return its bytes unfiltered.
    pub fn take_held(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.carry)
    }

    pub fn filter(&mut self, chunk: &[u8], now: Instant) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(chunk);
        if !self.is_active(now) {
            self.until = None;
            return data;
        }

        let mut out = Vec::with_capacity(data.len());
        let mut i = 0;
        while i < data.len() {
            if data[i..].starts_with(CURSOR_REQUEST) {
                trace!("dropped cursor position request");
                i += CURSOR_REQUEST.len();
            } else if CURSOR_REQUEST.starts_with(&data[i..]) {
                self.carry = data[i..].to_vec();
                break;
            } else {
                out.push(data[i]);
                i += 1;
            }
        }
        out
    }
}

struct SinkState {
    stdout: BoxedWriter,
    stderr: BoxedWriter,
    cache: OutputCache,
    cpr_stdout: CprFilter,
    cpr_stderr: CprFilter,
}

impl SinkState {
    fn writer(&mut self, stream: OutputStream) -> &mut BoxedWriter {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }

    fn cpr(&mut self, stream: OutputStream) -> &mut CprFilter {
        match stream {
            OutputStream::Stdout => &mut self.cpr_stdout,
            OutputStream::Stderr => &mut self.cpr_stderr,
        }
    }

    async fn emit(&mut self, stream: OutputStream, chunk: &[u8]) -> Result<()> {
        let data = self.cpr(stream).filter(chunk, Instant::now());
        if data.is_empty() {
            return Ok(());
        }
        let writer = self.writer(stream);
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write out a held partial request, or cache it while intercepting.
    async fn flush_held(&mut self, stream: OutputStream, intercepting: bool) -> Result<()> {
        let held = self.cpr(stream).take_held();
        if held.is_empty() {
            return Ok(());
        }
        if intercepting {
            self.cache.push(stream, &held);
            return Ok(());
        }
        trace!(?stream, len = held.len(), "releasing held output");
        let writer = self.writer(stream);
        writer.write_all(&held).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn drain_cache(&mut self) -> Result<()> {
        for (stream, data) in self.cache.drain() {
            self.emit(stream, &data).await?;
        }
        Ok(())
    }
}

/// The local stdout and stderr, shared by both output tasks and the
/// interceptor.
///
/// While intercepting, remote output goes to the cache instead. Check and
/// write happen under one lock, so nothing overtakes cached output.
pub struct OutputSink {
    state: Mutex<SinkState>,
    intercepting: AtomicBool,
}

impl OutputSink {
    pub fn new(stdout: BoxedWriter, stderr: BoxedWriter) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SinkState {
                stdout,
                stderr,
                cache: OutputCache::new(),
                cpr_stdout: CprFilter::default(),
                cpr_stderr: CprFilter::default(),
            }),
            intercepting: AtomicBool::new(false),
        })
    }

    pub fn is_intercepting(&self) -> bool {
        self.intercepting.load(Ordering::SeqCst)
    }

    /// Write remote output, or cache it while intercepting.
    pub async fn write(&self, stream: OutputStream, chunk: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.is_intercepting() {
            state.cache.push(stream, chunk);
            return Ok(());
        }
        if !state.cache.is_empty() {
            state.drain_cache().await?;
        }
        state.emit(stream, chunk).await
    }

    /// Start holding back remote output. Bytes a filter still holds go to
    /// the cache first so they keep their place.
    pub async fn begin_intercept(&self) {
        let mut state = self.state.lock().await;
        self.intercepting.store(true, Ordering::SeqCst);
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let held = state.cpr(stream).take_held();
            state.cache.push(stream, &held);
        }
    }

    /// Release the cache in order and filter stray cursor requests for a
    /// while.
    pub async fn end_intercept(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.cpr_stdout.arm(now);
        state.cpr_stderr.arm(now);
        self.intercepting.store(false, Ordering::SeqCst);
        debug!(cached = state.cache.len(), "releasing output cache");
        state.drain_cache().await
    }

    /// The user typed real input; stop filtering cursor requests.
    pub async fn user_input_seen(&self) {
        let mut state = self.state.lock().await;
        state.cpr_stdout.disarm();
        state.cpr_stderr.disarm();
        let intercepting = self.is_intercepting();
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            if let Err(e) = state.flush_held(stream, intercepting).await {
                debug!(?stream, error = %e, "releasing held output failed");
            }
        }
    }

    pub async fn holds_partial(&self, stream: OutputStream) -> bool {
        self.state.lock().await.cpr(stream).holds_partial()
    }

    /// Release bytes held for a possible `ESC[6n` on `stream`.
    pub async fn flush_held(&self, stream: OutputStream) -> Result<()> {
        let mut state = self.state.lock().await;
        let intercepting = self.is_intercepting();
        state.flush_held(stream, intercepting).await
    }

    /// Write local overlay bytes straight to stderr, bypassing the cache.
    pub async fn write_overlay(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.stderr.write_all(bytes).await?;
        state.stderr.flush().await?;
        Ok(())
    }
}

/// Copy one remote stream to the local terminal until EOF.
pub async fn run_output(
    mut src: BoxedReader,
    stream: OutputStream,
    sink: Arc<OutputSink>,
    filter: Arc<dyn TransferFilter>,
    interceptor: Option<Arc<Interceptor>>,
    ctx: ProcessContext,
    translate: bool,
) -> Result<()> {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    let mut translator = translate.then(LfToCrlf::default);
    loop {
        // a held partial cursor request is released if nothing completes it
        let n = if sink.holds_partial(stream).await {
            match tokio::time::timeout(CPR_HOLD_TIMEOUT, src.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    sink.flush_held(stream).await?;
                    continue;
                }
            }
        } else {
            src.read(&mut buf).await?
        };
        if n == 0 {
            debug!(?stream, "remote stream EOF");
            sink.flush_held(stream).await?;
            return Ok(());
        }
        while ctx.is_output_paused() {
            tokio::time::sleep(PIPELINE_POLL_INTERVAL).await;
        }
        let mut chunk = buf[..n].to_vec();
        if let Some(translator) = &mut translator {
            chunk = translator.convert(&chunk);
        }
        let Some(chunk) = filter.filter_output(chunk) else {
            continue;
        };
        if let Some(interceptor) = &interceptor {
            interceptor.observe_output(&chunk);
        }
        sink.write(stream, &chunk).await?;
    }
}
