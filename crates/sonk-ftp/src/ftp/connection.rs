//! Control-connection dialing.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::ControlChannel;
use crate::ftp::types::{FtpOptions, FtpReply};

/// Dial the control connection and read the welcome banner.
pub(crate) async fn connect(options: &FtpOptions) -> FtpResult<(ControlChannel, FtpReply)> {
    let addr = format!("{}:{}", options.host_name, options.port);
    let dur = Duration::from_secs(options.connect_timeout_sec);

    let tcp = timeout(dur, TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::timeout(format!("connect to {} timed out", addr)))?
        .map_err(|e| FtpError::connection_failed(format!("connect to {}: {}", addr, e)))?;
    tcp.set_nodelay(true).ok();

    let mut channel = ControlChannel::from_tcp(tcp);
    let banner = channel.reply().await?;
    if !banner.is_success() {
        return Err(FtpError::from_reply(banner.code, &banner.text()));
    }
    Ok((channel, banner))
}
