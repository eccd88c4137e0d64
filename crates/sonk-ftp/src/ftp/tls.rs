//! AUTH TLS upgrade (RFC 4217) and FTPS data-channel wrapping.

use tokio::net::TcpStream;
use tokio_native_tls::TlsConnector;

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::{ControlChannel, ControlReader, ControlWriter};

pub(crate) fn build_connector() -> FtpResult<TlsConnector> {
    let connector = native_tls::TlsConnector::builder().build()?;
    Ok(TlsConnector::from(connector))
}

/// Upgrade a plain control connection to TLS. Called after AUTH TLS got its
/// 234; consumes the plain codec and hands back a TLS one.
pub(crate) async fn upgrade_to_tls(
    channel: ControlChannel,
    host: &str,
) -> FtpResult<ControlChannel> {
    let tcp = reunite_plain(channel)?;
    let connector = build_connector()?;
    let tls = connector
        .connect(host, tcp)
        .await
        .map_err(|e| FtpError::tls_failed(format!("AUTH TLS handshake: {}", e)))?;
    Ok(ControlChannel::from_tls(tls))
}

/// TLS-wrap a data connection (PROT P).
pub(crate) async fn wrap_data_stream(
    tcp: TcpStream,
    host: &str,
) -> FtpResult<tokio_native_tls::TlsStream<TcpStream>> {
    let connector = build_connector()?;
    connector
        .connect(host, tcp)
        .await
        .map_err(|e| FtpError::tls_failed(format!("data channel TLS: {}", e)))
}

/// Put the split halves back together; only possible while both are plain.
fn reunite_plain(channel: ControlChannel) -> FtpResult<TcpStream> {
    let rd = match channel.reader {
        ControlReader::Plain(r) => r.into_inner(),
        ControlReader::Tls(_) => {
            return Err(FtpError::protocol_error(
                "control connection is already TLS",
            ))
        }
    };
    let wr = match channel.writer {
        ControlWriter::Plain(w) => w,
        ControlWriter::Tls(_) => {
            return Err(FtpError::protocol_error(
                "control connection is already TLS",
            ))
        }
    };
    rd.reunite(wr)
        .map_err(|e| FtpError::protocol_error(format!("reunite failed: {}", e)))
}
