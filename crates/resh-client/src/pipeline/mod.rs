//! I/O pipeline between the local terminal and a remote session.
//!
//! Stdin side: escape detector, line-ending translation, transfer filter,
//! notification interceptor, then a bounded queue drained by the single
//! server-in writer. Output side: pause flag, translation, transfer
//! filter, then the shared [`OutputSink`].

mod input;
mod output;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use resh_core::constants::INPUT_QUEUE_CAPACITY;
use resh_core::{ExitCode, ProcessContext};

pub use input::{InputStage, run_server_in};
pub use output::{CprFilter, OutputSink, run_output};

use crate::escape::EscapeDetector;
use crate::notification::Interceptor;
use crate::terminal::{StdinReader, TermSize};
use crate::transport::{BoxedWriter, SessionHandle, SessionIo};

/// Which local stream a chunk of remote output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Hook for an in-band file transfer filter (trzsz).
///
/// `None` means the filter consumed the chunk.
pub trait TransferFilter: Send + Sync {
    fn filter_input(&self, chunk: Vec<u8>) -> Option<Vec<u8>>;
    fn filter_output(&self, chunk: Vec<u8>) -> Option<Vec<u8>>;
}

/// Filter that forwards everything untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl TransferFilter for PassThrough {
    fn filter_input(&self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        Some(chunk)
    }

    fn filter_output(&self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        Some(chunk)
    }
}

/// `\r\n` to `\n` across reads. A `\r` ending one read is held until the
/// next read shows whether a `\n` follows.
#[derive(Debug, Default)]
pub struct CrlfToLf {
    held_cr: bool,
}

impl CrlfToLf {
    pub fn convert(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 1);
        for &b in data {
            if std::mem::take(&mut self.held_cr) && b != b'\n' {
                out.push(b'\r');
            }
            if b == b'\r' {
                self.held_cr = true;
            } else {
                out.push(b);
            }
        }
        out
    }

    /// The held `\r`, if any, once no more input will come.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        std::mem::take(&mut self.held_cr).then(|| vec![b'\r'])
    }
}

/// Bare `\n` to `\r\n` across reads.
#[derive(Debug, Default)]
pub struct LfToCrlf {
    last_cr: bool,
}

impl LfToCrlf {
    pub fn convert(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 1);
        for &b in data {
            if b == b'\n' && !self.last_cr {
                out.push(b'\r');
            }
            out.push(b);
            self.last_cr = b == b'\r';
        }
        out
    }
}

/// Pipeline settings decided at login.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub escape_char: Option<u8>,
    pub escape_window: Duration,
    pub translate_line_endings: bool,
    pub inject_ctrl_z: bool,
}

/// Everything the pipeline connects.
pub struct PipelineParts {
    pub io: SessionIo,
    pub stdin: StdinReader,
    pub sink: Arc<OutputSink>,
    pub console_out: BoxedWriter,
    pub filter: Arc<dyn TransferFilter>,
    pub interceptor: Option<Arc<Interceptor>>,
    pub handle: SessionHandle,
    pub ctx: ProcessContext,
}

/// Running pipeline tasks.
pub struct Pipeline {
    input: JoinHandle<()>,
    writer: JoinHandle<()>,
    outputs: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn one task per direction plus the server-in writer.
    pub fn start(parts: PipelineParts, config: PipelineConfig) -> Self {
        let PipelineParts {
            io,
            stdin,
            sink,
            console_out,
            filter,
            interceptor,
            handle,
            ctx,
        } = parts;
        let (queue_tx, queue_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);

        let writer = tokio::spawn(async move {
            if let Err(e) = run_server_in(queue_rx, io.stdin).await {
                debug!(error = %e, "server input closed");
            }
        });

        let stage = InputStage {
            reader: stdin,
            detector: EscapeDetector::new(config.escape_char, config.escape_window),
            console_out,
            filter: filter.clone(),
            interceptor: interceptor.clone(),
            handle: handle.clone(),
            translate: config.translate_line_endings.then(CrlfToLf::default),
            inject_ctrl_z: config.inject_ctrl_z,
        };
        let input = {
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = stage.run(queue_tx).await {
                    warn!(error = %e, "stdin stage failed");
                    handle.force_exit(ExitCode::StdinFailed, e.with_context("stdin").to_string());
                }
            })
        };

        let outputs = [
            (io.stdout, OutputStream::Stdout),
            (io.stderr, OutputStream::Stderr),
        ]
        .into_iter()
        .map(|(src, stream)| {
            let sink = sink.clone();
            let filter = filter.clone();
            let interceptor = interceptor.clone();
            let ctx = ctx.clone();
            let translate = config.translate_line_endings;
            tokio::spawn(async move {
                if let Err(e) =
                    run_output(src, stream, sink, filter, interceptor, ctx, translate).await
                {
                    debug!(?stream, error = %e, "output stage ended");
                }
            })
        })
        .collect();

        Self {
            input,
            writer,
            outputs,
        }
    }

    /// Wait for remote output to drain, then stop reading stdin.
    pub async fn finish(self) {
        join_all(self.outputs).await;
        self.input.abort();
        self.writer.abort();
    }
}

/// Forward terminal size changes to the session.
pub fn spawn_resize_forwarder(
    handle: SessionHandle,
    mut sizes: mpsc::UnboundedReceiver<TermSize>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(size) = sizes.recv().await {
            if size == handle.size() {
                continue;
            }
            debug!(cols = size.cols, rows = size.rows, "window size changed");
            if let Err(e) = handle.window_change(size).await {
                debug!(error = %e, "window change failed");
            }
        }
    })
}
