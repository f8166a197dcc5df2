// Wire framing: [4-byte big-endian length][UTF-8 JSON envelope] (spec §4.5).
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::message::Envelope;

/// Oversize frames are a protocol error (spec §7): the connection is closed,
/// not the node.
const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;

pub struct FramedStream {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl FramedStream {
    pub fn new(stream: TcpStream) -> Self {
        FramedStream { stream, buf: Vec::new() }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> io::Result<()> {
        write_envelope(&mut self.stream, envelope).await
    }

    /// Reads the next frame. Returns `Ok(None)` on clean EOF between frames
    /// and `Err` for malformed frames (oversize length prefix, invalid JSON).
    pub async fn recv(&mut self) -> io::Result<Option<Envelope>> {
        read_envelope(&mut self.stream, &mut self.buf).await
    }

    /// Splits into independent reader/writer halves so a connection can run
    /// its read loop and write loop as separate tasks.
    pub fn into_split(self) -> (FramedReader, FramedWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FramedReader { half: read_half, buf: self.buf },
            FramedWriter { half: write_half },
        )
    }
}

pub struct FramedReader {
    half: OwnedReadHalf,
    buf: Vec<u8>,
}

impl FramedReader {
    pub async fn recv(&mut self) -> io::Result<Option<Envelope>> {
        read_envelope(&mut self.half, &mut self.buf).await
    }
}

pub struct FramedWriter {
    half: OwnedWriteHalf,
}

impl FramedWriter {
    pub async fn send(&mut self, envelope: &Envelope) -> io::Result<()> {
        write_envelope(&mut self.half, envelope).await
    }
}

async fn write_envelope<W: AsyncWriteExt + Unpin>(w: &mut W, envelope: &Envelope) -> io::Result<()> {
    let body = serde_json::to_vec(envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let len = body.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await
}

async fn read_envelope<R: AsyncReadExt + Unpin>(r: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<Envelope>> {
    loop {
        if buf.len() >= 4 {
            let len = u32::from_be_bytes(buf[..4].try_into().unwrap());
            if len > MAX_FRAME_BYTES {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
            }
            let frame_len = 4 + len as usize;
            if buf.len() >= frame_len {
                let body = buf[4..frame_len].to_vec();
                buf.drain(..frame_len);
                let envelope: Envelope =
                    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                return Ok(Some(envelope));
            }
        }

        let mut tmp = [0u8; 4096];
        let n = r.read(&mut tmp).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame"));
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::message::{Envelope, Message};

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut framed = FramedStream::new(stream);
            let envelope = Envelope::wrap(&Message::GetChain { from_index: 3 }, "n0".into()).unwrap();
            framed.send(&envelope).await.unwrap();
        });
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = FramedStream::new(stream);
        let received = framed.recv().await.unwrap().unwrap();
        assert_eq!(received.kind, "GET_CHAIN");
        assert_eq!(received.origin_id, "n0");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_eof_before_any_frame_is_none() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let _stream = TcpStream::connect(addr).await.unwrap();
        });
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = FramedStream::new(stream);
        assert!(framed.recv().await.unwrap().is_none());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_split_reader_writer_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (_r, mut w) = FramedStream::new(stream).into_split();
            let envelope = Envelope::wrap(&Message::GetChain { from_index: 1 }, "n0".into()).unwrap();
            w.send(&envelope).await.unwrap();
        });
        let (stream, _) = listener.accept().await.unwrap();
        let (mut r, _w) = FramedStream::new(stream).into_split();
        let received = r.recv().await.unwrap().unwrap();
        assert_eq!(received.kind, "GET_CHAIN");
        client.await.unwrap();
    }
}
