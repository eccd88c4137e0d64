//! A logged-in control session and its verb primitives.
//!
//! Lifecycle: dial → optional AUTH TLS → USER/PASS → TYPE. The handler
//! drives the higher-level verbs and streaming loops; sessions only know
//! the control-channel vocabulary.

use chrono::{NaiveDateTime, Utc};
use uuid::Uuid;

use crate::ftp::connection;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::ControlChannel;
use crate::ftp::tls;
use crate::ftp::transfer::{self, DataStream};
use crate::ftp::types::{FtpCredentials, FtpOptions, FtpReply, FtpSecurityMode};

pub(crate) struct FtpSession {
    pub id: String,
    channel: ControlChannel,
    /// Pool group this session belongs to.
    pub group: String,
    pub connected: bool,
    pub last_used: chrono::DateTime<Utc>,
    secured: bool,
}

impl FtpSession {
    /// Dial, optionally secure, and log in a fresh session.
    pub async fn open(options: &FtpOptions, security: FtpSecurityMode) -> FtpResult<FtpSession> {
        let id = Uuid::new_v4().to_string();
        let (mut channel, banner) = connection::connect(options).await?;
        log::debug!("[ftp:{}] banner: {}", id, banner.text());

        let mut secured = false;
        if security == FtpSecurityMode::Explicit {
            let reply = channel.execute("AUTH TLS").await?;
            if !reply.is_success() {
                return Err(FtpError::tls_failed(format!(
                    "AUTH TLS rejected: {}",
                    reply.text()
                )));
            }
            channel = tls::upgrade_to_tls(channel, &options.host_name).await?;
            channel.expect_ok("PBSZ 0").await?;
            channel.expect_ok("PROT P").await?;
            secured = true;
        }

        let credentials = options.credentials.clone().unwrap_or_default();
        login(&mut channel, &credentials).await?;

        let type_cmd = if options.use_binary { "TYPE I" } else { "TYPE A" };
        channel.expect_ok(type_cmd).await?;

        log::info!(
            "[ftp:{}] connected to {}:{}{}",
            id,
            options.host_name,
            options.port,
            if secured { " (FTPS)" } else { "" }
        );

        Ok(FtpSession {
            id,
            channel,
            group: options.group_key(),
            connected: true,
            last_used: Utc::now(),
            secured,
        })
    }

    pub fn is_secured(&self) -> bool {
        self.secured
    }

    pub fn touch(&mut self) {
        self.last_used = Utc::now();
    }

    // ── Channel passthroughs used by the handler's transfer loops ────

    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpReply> {
        self.channel.execute(cmd).await
    }

    pub async fn expect_ok(&mut self, cmd: &str) -> FtpResult<FtpReply> {
        self.channel.expect_ok(cmd).await
    }

    pub async fn read_reply(&mut self) -> FtpResult<FtpReply> {
        self.channel.reply().await
    }

    pub async fn open_data(
        &mut self,
        options: &FtpOptions,
        security: FtpSecurityMode,
    ) -> FtpResult<DataStream> {
        transfer::open_data_channel(&mut self.channel, options, security).await
    }

    // ── Verbs ────────────────────────────────────────────────────────

    /// Parse the quoted path from a `257 "..."` reply.
    pub async fn pwd(&mut self) -> FtpResult<String> {
        let reply = self.channel.expect_ok("PWD").await?;
        let text = reply.text();
        let start = text
            .find('"')
            .ok_or_else(|| FtpError::protocol_error(format!("cannot parse PWD: {}", text)))?;
        let rest = &text[start + 1..];
        let end = rest
            .find('"')
            .ok_or_else(|| FtpError::protocol_error(format!("cannot parse PWD: {}", text)))?;
        self.touch();
        Ok(rest[..end].to_string())
    }

    /// RFC 3659 SIZE: `213 12345`.
    pub async fn size(&mut self, path: &str) -> FtpResult<u64> {
        let reply = self.channel.expect_ok(&format!("SIZE {}", path)).await?;
        let text = reply.text();
        self.touch();
        text.split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| FtpError::protocol_error(format!("cannot parse SIZE: {}", text)))
    }

    /// RFC 3659 MDTM: `213 YYYYMMDDHHMMSS`.
    pub async fn mdtm(&mut self, path: &str) -> FtpResult<NaiveDateTime> {
        let reply = self.channel.expect_ok(&format!("MDTM {}", path)).await?;
        let text = reply.text();
        self.touch();
        let stamp = text
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| FtpError::protocol_error(format!("cannot parse MDTM: {}", text)))?;
        NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
            .map_err(|_| FtpError::protocol_error(format!("cannot parse MDTM: {}", text)))
    }

    pub async fn delete(&mut self, path: &str) -> FtpResult<()> {
        self.channel.expect_ok(&format!("DELE {}", path)).await?;
        self.touch();
        Ok(())
    }

    pub async fn make_directory(&mut self, path: &str) -> FtpResult<()> {
        self.channel.expect_ok(&format!("MKD {}", path)).await?;
        self.touch();
        Ok(())
    }

    pub async fn remove_directory(&mut self, path: &str) -> FtpResult<()> {
        self.channel.expect_ok(&format!("RMD {}", path)).await?;
        self.touch();
        Ok(())
    }

    /// RNFR/RNTO pair.
    pub async fn rename(&mut self, from: &str, to: &str) -> FtpResult<FtpReply> {
        self.channel
            .expect_class(&format!("RNFR {}", from), 3)
            .await?;
        let reply = self.channel.expect_ok(&format!("RNTO {}", to)).await?;
        self.touch();
        Ok(reply)
    }

    pub async fn noop(&mut self) -> FtpResult<()> {
        self.channel.expect_ok("NOOP").await?;
        self.touch();
        Ok(())
    }

    /// Gracefully close; best effort.
    pub async fn quit(&mut self) -> FtpResult<()> {
        let _ = self.channel.execute("QUIT").await;
        self.connected = false;
        log::debug!("[ftp:{}] closed", self.id);
        Ok(())
    }
}

async fn login(channel: &mut ControlChannel, credentials: &FtpCredentials) -> FtpResult<()> {
    let user = channel
        .execute(&format!("USER {}", credentials.user))
        .await?;
    if user.is_intermediate() {
        // Server wants a password.
        let pass = channel
            .execute(&format!("PASS {}", credentials.password))
            .await?;
        if !pass.is_success() {
            return Err(FtpError::auth_failed(format!(
                "login failed: {}",
                pass.text()
            )));
        }
    } else if !user.is_success() {
        return Err(FtpError::auth_failed(format!(
            "USER rejected: {}",
            user.text()
        )));
    }
    Ok(())
}
