//! Abstraction over plain and TLS-wrapped split stream halves.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

/// Read half of a connection's stream.
pub(crate) enum StreamReader {
    Plain(OwnedReadHalf),
    Tls(tokio::io::ReadHalf<TlsStream<TcpStream>>),
}

/// Write half of a connection's stream.
pub(crate) enum StreamWriter {
    Plain(OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

impl StreamReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamReader::Plain(r) => r.read(buf).await,
            StreamReader::Tls(r) => r.read(buf).await,
        }
    }
}

impl StreamWriter {
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            StreamWriter::Plain(w) => w.write_all(buf).await,
            StreamWriter::Tls(w) => w.write_all(buf).await,
        }
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamWriter::Plain(w) => w.flush().await,
            StreamWriter::Tls(w) => w.flush().await,
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            StreamWriter::Plain(w) => w.shutdown().await,
            StreamWriter::Tls(w) => w.shutdown().await,
        }
    }
}

pub(crate) fn split_plain(stream: TcpStream) -> (StreamReader, StreamWriter) {
    let (rd, wr) = stream.into_split();
    (StreamReader::Plain(rd), StreamWriter::Plain(wr))
}

pub(crate) fn split_tls(stream: TlsStream<TcpStream>) -> (StreamReader, StreamWriter) {
    let (rd, wr) = tokio::io::split(stream);
    (StreamReader::Tls(rd), StreamWriter::Tls(wr))
}
