//! The Stage-2 worker loop.
//!
//! Runs inside the `stage2-worker` child process (reading stdin, writing
//! stdout) or, with task isolation, inside a Tokio task over in-memory pipes.
//! Either way the worker shares nothing with the server but the byte stream.

use crate::server::isolation::protocol::{frame_reader, frame_writer, read_message, write_message};
use core::time::Duration;
use nemo_core::{ProcessedResult, Result, Stage2Message};
use tokio::io::{AsyncRead, AsyncWrite};

/// The deterministic Stage-2 transformation.
pub fn transform(prompt: &str, text: &str) -> String {
    format!("Question: {prompt}\n\n{text}")
}

/// Processes forwarded results until a stop token or end of input.
///
/// Every [`Stage2Message::Work`] item is answered with exactly one
/// [`ProcessedResult`] carrying `processor_id`, after sleeping for `delay`.
/// Malformed lines are logged and skipped.
///
/// # Errors
///
/// Returns an error if a result cannot be written back, which means the
/// server has gone away.
pub async fn run_worker<R, W>(processor_id: usize, delay: Duration, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = frame_reader(input);
    let mut writer = frame_writer(output);
    tracing::info!("Stage-2 worker {processor_id} started");

    loop {
        let item = match read_message::<_, Stage2Message>(&mut reader).await {
            Ok(Some(Stage2Message::Work(item))) => item,
            Ok(Some(Stage2Message::Stop)) => {
                tracing::debug!("Stage-2 worker {processor_id} received stop");
                break;
            }
            Ok(None) => {
                tracing::debug!("Stage-2 worker {processor_id} input closed");
                break;
            }
            Err(e) => {
                tracing::warn!("Stage-2 worker {processor_id} skipped a message: {e}");
                continue;
            }
        };

        tokio::time::sleep(delay).await;

        let processed = ProcessedResult {
            processed_text: transform(&item.prompt, &item.text),
            id: item.id,
            prompt: item.prompt,
            processor_id,
        };
        write_message(&mut writer, &processed).await?;
    }

    tracing::info!("Stage-2 worker {processor_id} stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::isolation::protocol::FrameReader;
    use nemo_core::ForwardedResult;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    #[test]
    fn transform_prefixes_question() {
        assert_eq!(transform("hello", "hi there"), "Question: hello\n\nhi there");
    }

    fn work(id: &str) -> Stage2Message {
        Stage2Message::Work(ForwardedResult {
            id: id.to_string(),
            prompt: "hello".to_string(),
            text: "hi".to_string(),
        })
    }

    async fn next_result(reader: &mut FrameReader<DuplexStream>) -> Option<ProcessedResult> {
        read_message(reader).await.unwrap()
    }

    #[tokio::test]
    async fn answers_each_item_and_stops_on_token() {
        let (to_worker, worker_in) = tokio::io::duplex(4096);
        let (worker_out, from_worker) = tokio::io::duplex(4096);
        let handle = tokio::spawn(run_worker(7, Duration::ZERO, worker_in, worker_out));

        let mut writer = frame_writer(to_worker);
        let mut reader = frame_reader(from_worker);

        write_message(&mut writer, &work("a")).await.unwrap();
        write_message(&mut writer, &work("b")).await.unwrap();
        write_message(&mut writer, &Stage2Message::Stop).await.unwrap();

        let first = next_result(&mut reader).await.unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(first.processor_id, 7);
        assert_eq!(first.processed_text, "Question: hello\n\nhi");
        assert_eq!(next_result(&mut reader).await.unwrap().id, "b");

        handle.await.unwrap().unwrap();
        assert!(next_result(&mut reader).await.is_none());
    }

    #[tokio::test]
    async fn garbage_is_skipped() {
        let (mut to_worker, worker_in) = tokio::io::duplex(4096);
        let (worker_out, from_worker) = tokio::io::duplex(4096);
        let handle = tokio::spawn(run_worker(1, Duration::ZERO, worker_in, worker_out));
        let mut reader = frame_reader(from_worker);

        to_worker.write_all(b"garbage\n").await.unwrap();
        let line = serde_json::to_string(&work("ok")).unwrap();
        to_worker.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        drop(to_worker);

        assert_eq!(next_result(&mut reader).await.unwrap().id, "ok");
        handle.await.unwrap().unwrap();
    }
}
