//! `--upload-file`: stream a local file into the remote working directory.

use std::borrow::Cow;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use resh_core::{Error, Result};

use crate::transport::{RemoteExit, SessionOptions, StartRequest, Transport};

/// Copy `path` to the remote side under its file name.
pub async fn upload_file(transport: &dyn Transport, path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Configuration {
            message: format!("cannot upload {}: no usable file name", path.display()),
        })?;
    let mut file = tokio::fs::File::open(path).await?;

    let command = format!("cat > {}", shell_escape::escape(Cow::Borrowed(name)));
    let session = transport.new_session(SessionOptions::default()).await?;
    let mut io = session.start(StartRequest::Exec(command)).await?;

    let sent = tokio::io::copy(&mut file, &mut io.stdin).await?;
    io.stdin.shutdown().await?;
    debug!(file = name, bytes = sent, "upload sent");

    let (mut out, mut err) = (Vec::new(), Vec::new());
    tokio::try_join!(
        io.stdout.read_to_end(&mut out),
        io.stderr.read_to_end(&mut err)
    )?;
    let exit = session.wait().await;
    if let Err(e) = session.close().await {
        debug!(error = %e, "closing upload session failed");
    }
    match exit {
        RemoteExit::Status(0) => Ok(()),
        other => {
            let stderr = String::from_utf8_lossy(&err);
            Err(Error::RemoteExec {
                message: match stderr.trim() {
                    "" => format!("upload of {} exited with {}", name, other.code()),
                    detail => detail.to_string(),
                },
            })
        }
    }
}
