//! Low-level control-channel codec (RFC 959 §4).
//!
//! Sends CRLF-terminated commands and reads single- or multi-line replies
//! with their 3-digit codes, over plain TCP or a TLS-wrapped stream.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpReply;

pub(crate) enum ControlReader {
    Plain(BufReader<OwnedReadHalf>),
    Tls(BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>),
}

pub(crate) enum ControlWriter {
    Plain(OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

/// The command/reply codec over split halves.
pub(crate) struct ControlChannel {
    pub(crate) reader: ControlReader,
    pub(crate) writer: ControlWriter,
}

impl ControlChannel {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            reader: ControlReader::Plain(BufReader::new(rd)),
            writer: ControlWriter::Plain(wr),
        }
    }

    pub fn from_tls(stream: TlsStream<TcpStream>) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        Self {
            reader: ControlReader::Tls(BufReader::new(rd)),
            writer: ControlWriter::Tls(wr),
        }
    }

    /// Send one command; the CRLF is appended here.
    pub async fn command(&mut self, cmd: &str) -> FtpResult<()> {
        let line = format!("{}\r\n", cmd);
        match &mut self.writer {
            ControlWriter::Plain(w) => w.write_all(line.as_bytes()).await?,
            ControlWriter::Tls(w) => w.write_all(line.as_bytes()).await?,
        }
        if cmd.starts_with("PASS") {
            log::trace!(">>> PASS ***");
        } else {
            log::trace!(">>> {}", cmd);
        }
        Ok(())
    }

    async fn read_line(&mut self) -> FtpResult<String> {
        let mut buf = String::new();
        let n = match &mut self.reader {
            ControlReader::Plain(r) => r.read_line(&mut buf).await?,
            ControlReader::Tls(r) => r.read_line(&mut buf).await?,
        };
        if n == 0 {
            return Err(FtpError::connection_failed("server closed the connection"));
        }
        Ok(buf)
    }

    /// Read one complete reply. Multi-line replies run from `NNN-` until a
    /// line starting with `NNN `.
    pub async fn reply(&mut self) -> FtpResult<FtpReply> {
        let first = self.read_line().await?;
        let first = first.trim_end_matches(['\r', '\n']);
        if first.len() < 3 {
            return Err(FtpError::protocol_error(format!(
                "reply too short: '{}'",
                first
            )));
        }

        let code = parse_code(first)?;
        let mut lines = vec![first.to_string()];
        let multi_line = first.len() >= 4 && first.as_bytes()[3] == b'-';
        if multi_line {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line().await?;
                let next = next.trim_end_matches(['\r', '\n']);
                lines.push(next.to_string());
                if next.starts_with(&terminator) {
                    break;
                }
            }
        }

        let reply = FtpReply { code, lines };
        log::trace!("<<< {}", reply.lines.last().map(String::as_str).unwrap_or(""));
        Ok(reply)
    }

    /// Send a command and read its reply.
    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpReply> {
        self.command(cmd).await?;
        self.reply().await
    }

    /// Send a command and require a specific reply-code class.
    pub async fn expect_class(&mut self, cmd: &str, class: u16) -> FtpResult<FtpReply> {
        let reply = self.execute(cmd).await?;
        if reply.code / 100 != class {
            return Err(FtpError::from_reply(reply.code, &reply.text()));
        }
        Ok(reply)
    }

    /// Send a command and require a 2xx reply.
    pub async fn expect_ok(&mut self, cmd: &str) -> FtpResult<FtpReply> {
        self.expect_class(cmd, 2).await
    }
}

fn parse_code(line: &str) -> FtpResult<u16> {
    line[..3]
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error(format!("no reply code in: '{}'", line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    /// Serve canned bytes on a loopback socket and return a codec dialed
    /// into it.
    async fn channel_with(reply: &'static [u8]) -> ControlChannel {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(reply).await.unwrap();
            // Keep the socket open long enough for the client to read.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });
        ControlChannel::from_tcp(TcpStream::connect(addr).await.unwrap())
    }

    #[tokio::test]
    async fn single_line_reply() {
        let mut channel = channel_with(b"220 Service ready\r\n").await;
        let reply = channel.reply().await.unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines, vec!["220 Service ready"]);
    }

    #[tokio::test]
    async fn multi_line_reply_runs_to_terminator() {
        let mut channel =
            channel_with(b"230-Welcome\r\n230-Second line\r\n230 Logged in\r\n").await;
        let reply = channel.reply().await.unwrap();
        assert_eq!(reply.code, 230);
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(reply.lines[2], "230 Logged in");
    }

    #[tokio::test]
    async fn eof_is_a_connection_error() {
        let mut channel = channel_with(b"").await;
        let err = channel.reply().await.unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::ConnectionFailed);
    }

    #[tokio::test]
    async fn garbage_reply_is_a_protocol_error() {
        let mut channel = channel_with(b"nonsense without a code\r\n").await;
        let err = channel.reply().await.unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::ProtocolError);
    }
}
