//! Local-to-remote half of the pipeline.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use resh_core::ExitCode;
use resh_core::constants::PIPELINE_POLL_INTERVAL;
use resh_core::error::Result;
use resh_core::options::escape_char_display;

use super::{CrlfToLf, TransferFilter};
use crate::escape::{ConsoleOutcome, EscapeConsole, EscapeDetector, EscapeResult, suspend_process};
use crate::notification::Interceptor;
use crate::terminal::StdinReader;
use crate::transport::{BoxedWriter, SessionHandle};

/// Byte sent on stdin EOF when the remote should see a detach request.
const CTRL_Z: u8 = 0x1a;

/// Reads the local terminal and feeds the server-in queue.
pub struct InputStage {
    pub(crate) reader: StdinReader,
    pub(crate) detector: EscapeDetector,
    /// Where the escape console draws (stderr).
    pub(crate) console_out: BoxedWriter,
    pub(crate) filter: Arc<dyn TransferFilter>,
    pub(crate) interceptor: Option<Arc<Interceptor>>,
    pub(crate) handle: SessionHandle,
    /// `\r\n` to `\n` for sessions without a pty on Windows.
    pub(crate) translate: Option<CrlfToLf>,
    /// Send Ctrl+Z to the remote when the console reports EOF.
    pub(crate) inject_ctrl_z: bool,
}

enum Flow {
    Continue,
    Stop,
}

impl InputStage {
    /// Run until stdin EOF or a forced exit. Dropping `queue` closes
    /// server-in once the writer drained it.
    ///
    /// An empty chunk is a console EOF (Ctrl+Z on Windows): the terminal
    /// keeps working, so reading and escape detection go on.
    pub async fn run(mut self, queue: mpsc::Sender<Vec<u8>>) -> Result<()> {
        if let Some(interceptor) = &self.interceptor {
            interceptor.attach_input(&queue);
        }
        loop {
            let Some(chunk) = self.reader.read().await else {
                debug!("stdin EOF");
                self.console_eof(&queue).await;
                return Ok(());
            };
            if self.handle.forced_exit().is_some() {
                return Ok(());
            }
            if chunk.is_empty() {
                debug!("console EOF");
                if let Flow::Stop = self.console_eof(&queue).await {
                    return Ok(());
                }
                continue;
            }
            trace!(len = chunk.len(), "stdin chunk");

            let chunk = match self.detector.process(&chunk) {
                EscapeResult::PassThrough(chunk) => chunk,
                EscapeResult::Console => match self.open_console(&queue).await? {
                    Flow::Continue => continue,
                    Flow::Stop => return Ok(()),
                },
            };
            if let Flow::Stop = self.forward(chunk, &queue).await {
                return Ok(());
            }
        }
    }

    /// Release a held `\r` and, when asked to, tell the remote with Ctrl+Z.
    async fn console_eof(&mut self, queue: &mpsc::Sender<Vec<u8>>) -> Flow {
        if let Some(held) = self.translate.as_mut().and_then(CrlfToLf::finish)
            && let Flow::Stop = self.deliver(held, queue).await
        {
            return Flow::Stop;
        }
        if self.inject_ctrl_z {
            return self.deliver(vec![CTRL_Z], queue).await;
        }
        Flow::Continue
    }

    async fn open_console(&mut self, queue: &mpsc::Sender<Vec<u8>>) -> Result<Flow> {
        let Some(escape_char) = self.detector.escape_char() else {
            return Ok(Flow::Continue);
        };
        let outcome = EscapeConsole::new(&mut self.console_out, escape_char)
            .run(&mut self.reader)
            .await?;
        match outcome {
            ConsoleOutcome::Terminate => {
                self.handle.force_exit(
                    ExitCode::ConsoleKill,
                    format!("killed by escape sequence ^{}.", escape_char_display(escape_char)),
                );
                return Ok(Flow::Stop);
            }
            ConsoleOutcome::SendLiteral(byte) => {
                if let Flow::Stop = self.forward(vec![byte], queue).await {
                    return Ok(Flow::Stop);
                }
            }
            ConsoleOutcome::Suspend => {
                if let Err(e) = suspend_process() {
                    warn!(error = %e, "suspend failed");
                }
            }
            ConsoleOutcome::Cancelled => {}
        }
        let handle = self.handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.redraw().await {
                debug!(error = %e, "redraw after console failed");
            }
        });
        Ok(Flow::Continue)
    }

    /// Translate, filter and queue one chunk.
    async fn forward(&mut self, chunk: Vec<u8>, queue: &mpsc::Sender<Vec<u8>>) -> Flow {
        let chunk = match &mut self.translate {
            Some(translator) => translator.convert(&chunk),
            None => chunk,
        };
        self.deliver(chunk, queue).await
    }

    /// Filter and queue bytes that need no more translation.
    async fn deliver(&mut self, chunk: Vec<u8>, queue: &mpsc::Sender<Vec<u8>>) -> Flow {
        let Some(chunk) = self.filter.filter_input(chunk) else {
            return Flow::Continue;
        };
        if chunk.is_empty() {
            return Flow::Continue;
        }

        if let Some(interceptor) = &self.interceptor {
            if interceptor.is_intercepting() {
                interceptor.handle_input(chunk);
                return Flow::Continue;
            }
            interceptor.user_input(&chunk).await;
        }

        let mut chunk = chunk;
        loop {
            match queue.try_send(chunk) {
                Ok(()) => return Flow::Continue,
                Err(TrySendError::Closed(_)) => return Flow::Stop,
                Err(TrySendError::Full(back)) => {
                    if let Some(interceptor) = &self.interceptor
                        && interceptor.is_intercepting()
                    {
                        interceptor.handle_input(back);
                        return Flow::Continue;
                    }
                    chunk = back;
                    tokio::time::sleep(PIPELINE_POLL_INTERVAL).await;
                }
            }
        }
    }
}

/// Owns server-in: writes queued chunks in order, then closes it.
pub async fn run_server_in(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut server_in: BoxedWriter,
) -> Result<()> {
    while let Some(chunk) = rx.recv().await {
        server_in.write_all(&chunk).await?;
        server_in.flush().await?;
    }
    debug!("closing server input");
    server_in.shutdown().await?;
    Ok(())
}
