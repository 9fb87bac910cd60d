use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::Receiver;

use crate::config::OutputTarget;

/// Drain forwarded records until every sender is gone.
pub async fn run(rx: Receiver<String>, target: OutputTarget) -> std::io::Result<u64> {
    match target {
        OutputTarget::Stdout => write_lines(rx, tokio::io::stdout()).await,
        OutputTarget::Log => Ok(log_lines(rx).await),
    }
}

/// Write one record per line. Flushes whenever the channel runs dry so a
/// quiet exporter still sees its records promptly.
pub async fn write_lines<W>(mut rx: Receiver<String>, out: W) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BufWriter::new(out);
    let mut written = 0u64;

    while let Some(line) = rx.recv().await {
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        written += 1;

        if rx.is_empty() {
            out.flush().await?;
        }
    }

    out.flush().await?;
    Ok(written)
}

async fn log_lines(mut rx: Receiver<String>) -> u64 {
    let mut written = 0u64;
    while let Some(line) = rx.recv().await {
        tracing::info!(target: "flowrelay::flows", "{}", line);
        written += 1;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_write_lines_preserves_order() {
        let (tx, rx) = mpsc::channel(8);
        for line in ["a,1", "b,2", "c,3"] {
            tx.send(line.to_string()).await.unwrap();
        }
        drop(tx);

        let mut out = Vec::new();
        let written = write_lines(rx, &mut out).await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(String::from_utf8(out).unwrap(), "a,1\nb,2\nc,3\n");
    }

    #[tokio::test]
    async fn test_log_sink_drains() {
        let (tx, rx) = mpsc::channel(8);
        tx.send("x".to_string()).await.unwrap();
        drop(tx);
        assert_eq!(run(rx, OutputTarget::Log).await.unwrap(), 1);
    }
}
