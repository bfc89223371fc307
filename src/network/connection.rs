//! TCP connection management.
//!
//! A [`Connection`] owns the write half of one socket. The read half is handed
//! to a dedicated reader task at open time: the reader is the only consumer of
//! the reply stream, reassembles frames out of a growing buffer, and posts
//! every decoded reply to the shared [`ReplyRouter`]. Writers never touch the
//! read side.

use super::protocol::{HEADER_LEN, Reply};
use super::server::ReplyRouter;
use crate::error::{Error, Result};
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// One pooled socket. Writes are serialized by the pool's reservation
/// discipline; the reader task owns reads exclusively.
pub struct Connection {
    id: usize,
    writer: OwnedWriteHalf,
    broken: Arc<AtomicBool>,
    poisoned: bool,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Dial the peer and spawn the reader task for this socket.
    pub(crate) async fn open(
        addr: &str,
        id: usize,
        nodelay: bool,
        router: Arc<ReplyRouter>,
    ) -> std::io::Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(nodelay)?;
        let (read_half, writer) = stream.into_split();
        let broken = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(read_half, router, broken.clone(), id));
        tracing::debug!(connection = id, %addr, "connection established");
        Ok(Connection {
            id,
            writer,
            broken,
            poisoned: false,
            reader,
        })
    }

    /// Write one complete frame. The write is atomic per message: the whole
    /// frame goes out in a single `write_all`.
    pub(crate) async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if self.broken.load(Ordering::Acquire) {
            return Err(Error::NotYetConnected);
        }
        match self.write_and_flush(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.poisoned = true;
                tracing::warn!(connection = self.id, error = %err, "write failed, poisoning connection");
                Err(Error::Io(err))
            }
        }
    }

    async fn write_and_flush(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await
    }

    /// True once a write failed or the reader observed a dead stream.
    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned || self.broken.load(Ordering::Acquire)
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn poison_for_test(&mut self) {
        self.poisoned = true;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // dropping the write half closes the socket; the reader would exit on
        // its own, aborting just hurries it along
        self.reader.abort();
    }
}

/// Sole reader of one reply stream. Accumulates bytes, drains every complete
/// frame (peek the 4-byte length, wait for the rest, decode, route), and
/// exits on EOF or any I/O or protocol error, flagging the connection broken.
async fn read_loop(
    mut stream: OwnedReadHalf,
    router: Arc<ReplyRouter>,
    broken: Arc<AtomicBool>,
    id: usize,
) {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    loop {
        while buffer.len() >= HEADER_LEN {
            let frame_len = i32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
            if frame_len < HEADER_LEN as i32 {
                tracing::warn!(connection = id, frame_len, "peer sent an impossible frame length");
                broken.store(true, Ordering::Release);
                return;
            }
            let frame_len = frame_len as usize;
            if buffer.len() < frame_len {
                break; // partial frame, wait for more bytes
            }
            let frame = buffer.split_to(frame_len);
            match Reply::decode(&frame) {
                Ok(reply) => {
                    tracing::trace!(
                        connection = id,
                        response_to = reply.response_to,
                        returned = reply.number_returned,
                        "reply received"
                    );
                    router.deliver(reply);
                }
                Err(err) => {
                    tracing::warn!(connection = id, error = %err, "undecodable reply frame");
                    broken.store(true, Ordering::Release);
                    return;
                }
            }
        }
        match stream.read_buf(&mut buffer).await {
            Ok(0) => {
                tracing::debug!(connection = id, "peer closed the reply stream");
                broken.store(true, Ordering::Release);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(connection = id, error = %err, "read failed");
                broken.store(true, Ordering::Release);
                return;
            }
        }
    }
}
