//! Data channels: PASV (passive) and PORT (active).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::ControlChannel;
use crate::ftp::tls;
use crate::ftp::types::{FtpOptions, FtpSecurityMode};

/// Plain or TLS-wrapped data connection.
pub(crate) enum DataStream {
    Plain(TcpStream),
    Tls(tokio_native_tls::TlsStream<TcpStream>),
}

impl DataStream {
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DataStream::Plain(s) => s.read(buf).await,
            DataStream::Tls(s) => s.read(buf).await,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            DataStream::Plain(s) => s.write_all(buf).await,
            DataStream::Tls(s) => s.write_all(buf).await,
        }
    }

    pub async fn finish(&mut self) -> std::io::Result<()> {
        match self {
            DataStream::Plain(s) => {
                s.flush().await?;
                s.shutdown().await
            }
            DataStream::Tls(s) => {
                s.flush().await?;
                s.shutdown().await
            }
        }
    }
}

/// Open the data channel per the effective options, TLS-wrapping it when
/// the control channel is secured.
pub(crate) async fn open_data_channel(
    channel: &mut ControlChannel,
    options: &FtpOptions,
    security: FtpSecurityMode,
) -> FtpResult<DataStream> {
    let dur = Duration::from_secs(options.connect_timeout_sec);
    let tcp = if options.use_passive {
        open_pasv(channel, dur).await?
    } else {
        open_port(channel, dur).await?
    };

    if security == FtpSecurityMode::Explicit {
        let tls = tls::wrap_data_stream(tcp, &options.host_name).await?;
        Ok(DataStream::Tls(tls))
    } else {
        Ok(DataStream::Plain(tcp))
    }
}

// ── PASV ─────────────────────────────────────────────────────────────

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` → connect there.
async fn open_pasv(channel: &mut ControlChannel, dur: Duration) -> FtpResult<TcpStream> {
    let reply = channel.expect_ok("PASV").await?;
    let addr = parse_pasv_reply(&reply.text())?;
    timeout(dur, TcpStream::connect(addr))
        .await
        .map_err(|_| FtpError::data_channel("PASV data connect timed out"))?
        .map_err(|e| FtpError::data_channel(format!("PASV data connect: {}", e)))
}

pub(crate) fn parse_pasv_reply(text: &str) -> FtpResult<SocketAddr> {
    let re = Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)")
        .map_err(|e| FtpError::protocol_error(e.to_string()))?;
    let caps = re
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("cannot parse PASV: {}", text)))?;

    let nums: Vec<u8> = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| FtpError::protocol_error("PASV octet out of range"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Ok(SocketAddr::new(ip, port))
}

// ── PORT ─────────────────────────────────────────────────────────────

/// Bind a local listener, announce it via `PORT`, accept the server's
/// connection.
async fn open_port(channel: &mut ControlChannel, dur: Duration) -> FtpResult<TcpStream> {
    let listener = TcpListener::bind("0.0.0.0:0")
        .await
        .map_err(|e| FtpError::data_channel(format!("PORT bind: {}", e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| FtpError::data_channel(format!("PORT local addr: {}", e)))?;

    let ip = match local.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return Err(FtpError::data_channel("PORT requires IPv4")),
    };
    let octets = ip.octets();
    let cmd = format!(
        "PORT {},{},{},{},{},{}",
        octets[0],
        octets[1],
        octets[2],
        octets[3],
        local.port() / 256,
        local.port() % 256
    );
    channel.expect_ok(&cmd).await?;

    let (tcp, _) = timeout(dur, listener.accept())
        .await
        .map_err(|_| FtpError::data_channel("PORT accept timed out"))?
        .map_err(|e| FtpError::data_channel(format!("PORT accept: {}", e)))?;
    Ok(tcp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_reply_parses() {
        let addr =
            parse_pasv_reply("227 Entering Passive Mode (192,168,1,10,19,136)").unwrap();
        assert_eq!(addr.ip().to_string(), "192.168.1.10");
        assert_eq!(addr.port(), 19 * 256 + 136);
    }

    #[test]
    fn pasv_reply_without_tuple_fails() {
        assert!(parse_pasv_reply("227 whatever").is_err());
    }

    #[test]
    fn pasv_octet_overflow_fails() {
        assert!(parse_pasv_reply("227 (999,0,0,1,0,1)").is_err());
    }
}
