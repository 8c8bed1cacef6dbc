//! TCP front end: moves bytes between sockets and the parser/processor
//! contract.
//!
//! Client connections submit one typed op per request block and write back
//! the response the oplog writer releases. A connection that opens with
//! HELLO becomes a chunk-server channel: queued RPCs from the session are
//! pushed down it, reply blocks are matched back by `Cseq`, and losing the
//! connection submits a BYE.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use kfs_layout::{ChunkServer, OpId};
use kfs_proto::request::parse_command;
use kfs_proto::{response, ClientRequest, Properties};
use kfs_types::Seq;

use crate::op::{Event, MetaRequest, OpBody, Responder};
use crate::queue::MetaQueue;

/// Cloneable handle for feeding the processor queue.
#[derive(Clone)]
pub struct RequestSubmitter {
    queue: Arc<MetaQueue<Event>>,
    next_op_id: Arc<AtomicU64>,
}

impl RequestSubmitter {
    pub fn new(queue: Arc<MetaQueue<Event>>, next_op_id: Arc<AtomicU64>) -> Self {
        Self { queue, next_op_id }
    }

    pub fn submit(&self, cseq: Seq, body: OpBody, responder: Option<Responder>) -> OpId {
        let id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        self.queue
            .enqueue(Event::Submit(Box::new(MetaRequest::new(
                id, cseq, body, responder,
            ))));
        id
    }

    pub fn submit_internal(&self, body: OpBody) -> OpId {
        self.submit(-1, body, None)
    }

    pub fn rpc_reply(&self, server_id: String, seq: Seq, ok: bool) {
        self.queue.enqueue(Event::RpcReply {
            server_id,
            seq,
            ok,
        });
    }
}

/// Accept loop; one task per connection.
pub async fn run_listener(addr: &str, submitter: RequestSubmitter) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metaserver listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!(%peer, "connection accepted");
        let submitter = submitter.clone();
        tokio::spawn(handle_connection(stream, submitter));
    }
}

async fn handle_connection(stream: TcpStream, submitter: RequestSubmitter) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let block = match read_block(&mut reader).await {
            Ok(Some(block)) => block,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "connection read failed");
                return;
            }
        };
        let (cseq, parsed) = match parse_command(&block) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request");
                let rsp = response::status_only(-1, e.wire_status());
                if write_half.write_all(rsp.as_bytes()).await.is_err() {
                    return;
                }
                continue;
            }
        };

        match parsed {
            ClientRequest::Hello(mut hello) => {
                let mut body = vec![0u8; hello.content_length];
                if reader.read_exact(&mut body).await.is_err() {
                    return;
                }
                if let Err(e) = hello.parse_body(&String::from_utf8_lossy(&body)) {
                    tracing::warn!(error = %e, "bad hello body");
                    return;
                }
                let (tx, rx) = tokio::sync::oneshot::channel();
                submitter.submit(
                    cseq,
                    OpBody::Hello {
                        hello,
                        session: Some(tx),
                    },
                    None,
                );
                let Ok(session) = rx.await else { return };
                chunk_server_channel(reader, write_half, session, submitter).await;
                return;
            }
            other => {
                let (tx, rx) = tokio::sync::oneshot::channel();
                submitter.submit(cseq, OpBody::from_client(other), Some(tx));
                if let Ok(text) = rx.await {
                    if write_half.write_all(text.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Drive a registered chunk-server session over its connection: push queued
/// RPCs out, feed reply blocks back, submit BYE on loss.
async fn chunk_server_channel(
    mut reader: BufReader<OwnedReadHalf>,
    mut write_half: OwnedWriteHalf,
    session: Arc<ChunkServer>,
    submitter: RequestSubmitter,
) {
    let server_id = session.id();
    let writer_session = Arc::clone(&session);
    let writer_submitter = submitter.clone();
    let writer_id = server_id.clone();
    let pusher = tokio::spawn(async move {
        loop {
            for (seq, rpc) in writer_session.take_outbound() {
                let text = rpc.request(seq);
                if write_half.write_all(text.as_bytes()).await.is_err() {
                    writer_submitter.submit_internal(OpBody::Bye {
                        server_id: writer_id.clone(),
                    });
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    loop {
        match read_block(&mut reader).await {
            Ok(Some(block)) => {
                if let Some((seq, ok)) = parse_reply(&block) {
                    submitter.rpc_reply(server_id.clone(), seq, ok);
                } else {
                    tracing::debug!(server = %server_id, "unparseable chunk-server reply");
                }
            }
            _ => break,
        }
    }
    pusher.abort();
    tracing::info!(server = %server_id, "chunk server connection lost");
    submitter.submit_internal(OpBody::Bye { server_id });
}

/// Read one `\r\n\r\n`-terminated header block. `None` on clean EOF before
/// any data.
async fn read_block<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<String>> {
    let mut block = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(if block.is_empty() { None } else { Some(block) });
        }
        if line == "\r\n" || line == "\n" {
            if block.is_empty() {
                continue;
            }
            return Ok(Some(block));
        }
        block.push_str(&line);
    }
}

/// Parse a chunk-server reply block: `OK`, `Cseq`, `Status`.
fn parse_reply(block: &str) -> Option<(Seq, bool)> {
    let mut lines = block.splitn(2, '\n');
    let first = lines.next()?.trim_end();
    if first != "OK" {
        return None;
    }
    let props = Properties::load(lines.next().unwrap_or(""));
    let cseq: Seq = props.get_num("Cseq", -1i64);
    if cseq < 0 {
        return None;
    }
    let status: i32 = props.get_num("Status", -1i32);
    Some((cseq, status >= 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_block_stops_at_blank_line() {
        let data = b"LOOKUP\r\nCseq: 1\r\n\r\nextra".to_vec();
        let mut reader = BufReader::new(&data[..]);
        let block = read_block(&mut reader).await.unwrap().unwrap();
        assert_eq!(block, "LOOKUP\r\nCseq: 1\r\n");
    }

    #[tokio::test]
    async fn test_read_block_eof() {
        let data: Vec<u8> = Vec::new();
        let mut reader = BufReader::new(&data[..]);
        assert!(read_block(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_block_skips_leading_blank_lines() {
        let data = b"\r\nPING\r\nCseq: 2\r\n\r\n".to_vec();
        let mut reader = BufReader::new(&data[..]);
        let block = read_block(&mut reader).await.unwrap().unwrap();
        assert_eq!(block, "PING\r\nCseq: 2\r\n");
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(
            parse_reply("OK\r\nCseq: 7\r\nStatus: 0\r\n"),
            Some((7, true))
        );
        assert_eq!(
            parse_reply("OK\r\nCseq: 7\r\nStatus: -5\r\n"),
            Some((7, false))
        );
        assert_eq!(parse_reply("NOPE\r\nCseq: 7\r\n"), None);
        assert_eq!(parse_reply("OK\r\nStatus: 0\r\n"), None);
    }
}
