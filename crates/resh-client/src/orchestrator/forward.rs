//! `-W host:port`: local stdio spliced onto a remote TCP connection.

use tokio::io::{AsyncWriteExt, copy};
use tracing::debug;

use resh_core::Result;

use crate::terminal::StdinReader;
use crate::transport::{BoxedStream, BoxedWriter};

/// Copy stdin to `stream` and `stream` to stdout until the remote end
/// closes. Stdin EOF half-closes the stream.
pub async fn stdio_forward(
    stream: BoxedStream,
    mut stdin: StdinReader,
    mut stdout: BoxedWriter,
) -> Result<()> {
    let (mut remote_rx, mut remote_tx) = tokio::io::split(stream);

    let upstream = tokio::spawn(async move {
        while let Some(chunk) = stdin.read().await {
            remote_tx.write_all(&chunk).await?;
            remote_tx.flush().await?;
        }
        debug!("stdin closed, half-closing forward");
        remote_tx.shutdown().await
    });

    let copied = copy(&mut remote_rx, &mut stdout).await;
    stdout.flush().await?;
    upstream.abort();
    let copied = copied?;
    debug!(bytes = copied, "forward finished");
    Ok(())
}
