//! Line-delimited JSON framing between the server and Stage-2 workers.
//!
//! One message per line in both directions: [`nemo_core::Stage2Message`]
//! towards the worker, [`nemo_core::ProcessedResult`] back.

use futures::{SinkExt, StreamExt};
use nemo_core::{Error, Result};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Upper bound on one encoded message. Longer lines are discarded.
pub const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

pub type FrameReader<R> = FramedRead<R, LinesCodec>;
pub type FrameWriter<W> = FramedWrite<W, LinesCodec>;

pub fn frame_reader<R: AsyncRead>(io: R) -> FrameReader<R> {
    FramedRead::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

pub fn frame_writer<W: AsyncWrite>(io: W) -> FrameWriter<W> {
    FramedWrite::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

fn channel_error(context: impl Into<String>) -> Error {
    Error::ChannelError {
        context: context.into(),
    }
}

/// Encodes `message` as one line and flushes it.
///
/// # Errors
///
/// Returns [`Error::ChannelError`] if encoding fails or the peer has gone
/// away.
pub async fn write_message<W, T>(writer: &mut FrameWriter<W>, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = serde_json::to_string(message)
        .map_err(|e| channel_error(format!("failed to encode message: {e}")))?;
    writer
        .send(line)
        .await
        .map_err(|e| channel_error(format!("failed to write message: {e}")))
}

/// Reads the next message. `Ok(None)` means the peer closed the stream.
///
/// A malformed line yields an error but leaves the stream usable; after an
/// I/O error the stream reports end-of-stream.
///
/// # Errors
///
/// Returns [`Error::ChannelError`] on I/O errors, oversized lines and lines
/// that do not decode as `T`.
pub async fn read_message<R, T>(reader: &mut FrameReader<R>) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match reader.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(channel_error(format!("failed to read message: {e}"))),
        Some(Ok(line)) => serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| channel_error(format!("malformed message {line:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nemo_core::Stage2Message;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn malformed_line_does_not_poison_stream() {
        let (mut raw, peer) = tokio::io::duplex(1024);
        let mut reader = frame_reader(peer);

        raw.write_all(b"{not json}\n{\"type\":\"stop\"}\n").await.unwrap();
        drop(raw);

        assert!(read_message::<_, Stage2Message>(&mut reader).await.is_err());
        assert_eq!(
            read_message::<_, Stage2Message>(&mut reader).await.unwrap(),
            Some(Stage2Message::Stop)
        );
        assert_eq!(read_message::<_, Stage2Message>(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn writes_one_line_per_message() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = frame_writer(client);
        let mut reader = frame_reader(server);

        write_message(&mut writer, &Stage2Message::Stop).await.unwrap();
        let line = reader.next().await.unwrap().unwrap();
        assert_eq!(line, r#"{"type":"stop"}"#);
    }
}
