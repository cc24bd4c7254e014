use passage_common::is_closed_io_error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::*;

/// Splices two byte streams together. Each direction is its own task; on
/// EOF a copier half-closes its output side and drops its input half, and
/// both streams are fully closed once both directions finish.
pub async fn connect_pipe<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let up = tokio::spawn(async move {
        let copied = copy_then_close(&mut a_read, &mut b_write).await;
        drop(a_read);
        copied
    });
    let down = tokio::spawn(async move {
        let copied = copy_then_close(&mut b_read, &mut a_write).await;
        drop(b_read);
        copied
    });

    let (up, down) = tokio::join!(up, down);
    (up.unwrap_or(0), down.unwrap_or(0))
}

async fn copy_then_close<R, W>(read: &mut R, write: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match tokio::io::copy(read, write).await {
        Ok(copied) => copied,
        Err(error) if is_closed_io_error(&error) => {
            debug!(%error, "pipe closed");
            0
        }
        Err(error) => {
            warn!(%error, "pipe failed");
            0
        }
    };
    let _ = write.shutdown().await;
    copied
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_both_directions() {
        let (client, near) = tokio::io::duplex(64);
        let (far, server) = tokio::io::duplex(64);

        let pipe = tokio::spawn(connect_pipe(near, far));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        client_write.write_all(b"ping").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut received = Vec::new();
        server_read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        server_write.write_all(b"pong").await.unwrap();
        server_write.shutdown().await.unwrap();

        let mut response = Vec::new();
        client_read.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"pong");

        let (up, down) = pipe.await.unwrap();
        assert_eq!((up, down), (4, 4));
    }

    #[tokio::test]
    async fn test_eof_propagates_regardless_of_order() {
        let (client, near) = tokio::io::duplex(64);
        let (far, server) = tokio::io::duplex(64);
        let pipe = tokio::spawn(connect_pipe(near, far));

        let (mut server_read, mut server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        // server half-closes first this time
        server_write.write_all(b"early").await.unwrap();
        server_write.shutdown().await.unwrap();

        let mut got = Vec::new();
        client_read.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"early");

        client_write.shutdown().await.unwrap();
        let mut rest = Vec::new();
        server_read.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        pipe.await.unwrap();
    }
}
