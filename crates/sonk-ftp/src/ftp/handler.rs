//! The verb orchestrator.
//!
//! A handler is built from options plus a remote path; its target is
//! `hostName + "/" + remotePath`. Every operation takes an optional per-call
//! options override, runs the `on_make_request` hook over the built request
//! (the hook may flip the request to explicit FTPS, adjust options, or set
//! the content length), checks the cancellation token at every transfer
//! checkpoint, and drives the shared progress monitor when one is supplied.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use sonk_core::{CancelToken, ProgressMonitor};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::OwnedSemaphorePermit;

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::parser;
use crate::ftp::pool::FtpPool;
use crate::ftp::session::FtpSession;
use crate::ftp::types::{
    FtpEntry, FtpOptions, FtpReply, FtpRequest, FtpSecurityMode, FtpVerb,
};

pub type MakeRequestHook = dyn Fn(&mut FtpRequest) + Send + Sync;

/// FTP orchestrator bound to one remote target.
pub struct FtpHandler {
    options: FtpOptions,
    path: StdMutex<String>,
    on_make_request: Option<Arc<MakeRequestHook>>,
    pool: Arc<FtpPool>,
}

impl FtpHandler {
    pub fn new(options: FtpOptions, remote_path: impl Into<String>) -> Self {
        Self {
            options,
            path: StdMutex::new(remote_path.into()),
            on_make_request: None,
            pool: Arc::new(FtpPool::new()),
        }
    }

    /// Install the request hook, e.g. to enable FTPS on every request.
    pub fn on_make_request(mut self, hook: impl Fn(&mut FtpRequest) + Send + Sync + 'static) -> Self {
        self.on_make_request = Some(Arc::new(hook));
        self
    }

    pub fn options(&self) -> &FtpOptions {
        &self.options
    }

    /// The remote path operations act on. Rewritten by a successful rename.
    pub fn remote_path(&self) -> String {
        self.path.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `hostName + "/" + remotePath`.
    pub fn target(&self) -> String {
        format!("{}/{}", self.options.host_name, self.remote_path())
    }

    /// Release idle keep-alive sessions.
    pub async fn close(&self) {
        self.pool.drain().await;
    }

    // ── Request construction ─────────────────────────────────────────

    fn build_request(&self, verb: FtpVerb, overrides: Option<&FtpOptions>) -> FtpRequest {
        let options = overrides.cloned().unwrap_or_else(|| self.options.clone());
        let mut request = FtpRequest {
            verb,
            path: self.remote_path(),
            options,
            security: FtpSecurityMode::None,
            content_length: None,
            new_name: None,
        };
        if let Some(hook) = &self.on_make_request {
            hook(&mut request);
        }
        request
    }

    fn check_cancel(&self, token: &CancelToken) -> FtpResult<()> {
        if token.is_cancelled() {
            Err(FtpError::cancelled())
        } else {
            Ok(())
        }
    }

    async fn checkout(
        &self,
        request: &FtpRequest,
    ) -> FtpResult<(FtpSession, OwnedSemaphorePermit)> {
        let group = request.options.group_key();
        let permit = self
            .pool
            .permit(&group, request.options.connections_limit)
            .await;
        while let Some(session) = self.pool.take_idle(&group) {
            // An idle plain session cannot serve an FTPS request.
            if request.security == FtpSecurityMode::Explicit && !session.is_secured() {
                self.pool.finish(session, false, false).await;
                continue;
            }
            return Ok((session, permit));
        }
        let session = FtpSession::open(&request.options, request.security).await?;
        Ok((session, permit))
    }

    async fn checkin(&self, session: FtpSession, request: &FtpRequest, healthy: bool) {
        self.pool
            .finish(session, request.options.keep_alive, healthy)
            .await;
    }

    // ── Listings ─────────────────────────────────────────────────────

    /// NLST: bare names.
    pub async fn list_names(
        &self,
        options: Option<&FtpOptions>,
        token: &CancelToken,
    ) -> FtpResult<Vec<String>> {
        let request = self.build_request(FtpVerb::ListNames, options);
        let text = self.retrieve_listing("NLST", &request, token).await?;
        Ok(text
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// LIST: raw detail lines, verbatim.
    pub async fn list_details(
        &self,
        options: Option<&FtpOptions>,
        token: &CancelToken,
    ) -> FtpResult<Vec<String>> {
        let request = self.build_request(FtpVerb::ListDetails, options);
        let text = self.retrieve_listing("LIST", &request, token).await?;
        Ok(text
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// LIST, parsed into entries.
    pub async fn list_entries(
        &self,
        options: Option<&FtpOptions>,
        token: &CancelToken,
    ) -> FtpResult<Vec<FtpEntry>> {
        let request = self.build_request(FtpVerb::ListDetails, options);
        let text = self.retrieve_listing("LIST", &request, token).await?;
        Ok(parser::parse_listing(&text))
    }

    async fn retrieve_listing(
        &self,
        cmd: &str,
        request: &FtpRequest,
        token: &CancelToken,
    ) -> FtpResult<String> {
        self.check_cancel(token)?;
        let (mut session, permit) = self.checkout(request).await?;
        let result = listing_body(&mut session, cmd, request, token).await;
        self.checkin(session, request, result.is_ok()).await;
        drop(permit);
        result
    }

    // ── Simple verbs ─────────────────────────────────────────────────

    /// Rename the target. On success the handler's remote path moves with
    /// it, so chained operations see the new location.
    pub async fn rename(
        &self,
        new_name: &str,
        options: Option<&FtpOptions>,
        token: &CancelToken,
    ) -> FtpResult<()> {
        let mut request = self.build_request(FtpVerb::Rename, options);
        request.new_name = Some(new_name.to_string());
        self.check_cancel(token)?;

        let (mut session, permit) = self.checkout(&request).await?;
        let result = session.rename(&request.path, new_name).await;
        self.checkin(session, &request, result.is_ok()).await;
        drop(permit);

        let reply = result?;
        if reply.is_completion() {
            let renamed = renamed_path(&request.path, new_name);
            *self.path.lock().unwrap_or_else(|e| e.into_inner()) = renamed;
        }
        Ok(())
    }

    pub async fn delete_file(
        &self,
        options: Option<&FtpOptions>,
        token: &CancelToken,
    ) -> FtpResult<()> {
        let request = self.build_request(FtpVerb::DeleteFile, options);
        self.check_cancel(token)?;
        let (mut session, permit) = self.checkout(&request).await?;
        let result = session.delete(&request.path).await;
        self.checkin(session, &request, result.is_ok()).await;
        drop(permit);
        result
    }

    pub async fn make_directory(
        &self,
        options: Option<&FtpOptions>,
        token: &CancelToken,
    ) -> FtpResult<()> {
        let request = self.build_request(FtpVerb::MakeDirectory, options);
        self.check_cancel(token)?;
        let (mut session, permit) = self.checkout(&request).await?;
        let result = session.make_directory(&request.path).await;
        self.checkin(session, &request, result.is_ok()).await;
        drop(permit);
        result
    }

    pub async fn remove_directory(
        &self,
        options: Option<&FtpOptions>,
        token: &CancelToken,
    ) -> FtpResult<()> {
        let request = self.build_request(FtpVerb::RemoveDirectory, options);
        self.check_cancel(token)?;
        let (mut session, permit) = self.checkout(&request).await?;
        let result = session.remove_directory(&request.path).await;
        self.checkin(session, &request, result.is_ok()).await;
        drop(permit);
        result
    }

    pub async fn print_working_directory(
        &self,
        options: Option<&FtpOptions>,
        token: &CancelToken,
    ) -> FtpResult<String> {
        let request = self.build_request(FtpVerb::PrintWorkingDirectory, options);
        self.check_cancel(token)?;
        let (mut session, permit) = self.checkout(&request).await?;
        let result = session.pwd().await;
        self.checkin(session, &request, result.is_ok()).await;
        drop(permit);
        result
    }

    pub async fn get_size(
        &self,
        options: Option<&FtpOptions>,
        token: &CancelToken,
    ) -> FtpResult<u64> {
        let request = self.build_request(FtpVerb::GetSize, options);
        self.check_cancel(token)?;
        let (mut session, permit) = self.checkout(&request).await?;
        let result = session.size(&request.path).await;
        self.checkin(session, &request, result.is_ok()).await;
        drop(permit);
        result
    }

    pub async fn get_timestamp(
        &self,
        options: Option<&FtpOptions>,
        token: &CancelToken,
    ) -> FtpResult<chrono::NaiveDateTime> {
        let request = self.build_request(FtpVerb::GetTimestamp, options);
        self.check_cancel(token)?;
        let (mut session, permit) = self.checkout(&request).await?;
        let result = session.mdtm(&request.path).await;
        self.checkin(session, &request, result.is_ok()).await;
        drop(permit);
        result
    }

    // ── Downloads ────────────────────────────────────────────────────

    /// Download into a fresh buffer.
    pub async fn download(
        &self,
        options: Option<&FtpOptions>,
        monitor: Option<&ProgressMonitor>,
        token: &CancelToken,
    ) -> FtpResult<Vec<u8>> {
        let mut buffer = Vec::new();
        self.download_core(DownloadSink::Buffer(&mut buffer), options, monitor, token)
            .await?;
        Ok(buffer)
    }

    /// Download and decode as UTF-8.
    pub async fn download_string(
        &self,
        options: Option<&FtpOptions>,
        monitor: Option<&ProgressMonitor>,
        token: &CancelToken,
    ) -> FtpResult<String> {
        let bytes = self.download(options, monitor, token).await?;
        String::from_utf8(bytes)
            .map_err(|e| FtpError::protocol_error(format!("downloaded data not UTF-8: {}", e)))
    }

    /// Download to a local file, creating parent directories as needed.
    pub async fn download_to_file(
        &self,
        local_path: &Path,
        options: Option<&FtpOptions>,
        monitor: Option<&ProgressMonitor>,
        token: &CancelToken,
    ) -> FtpResult<u64> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FtpError::io_error(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        let file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| FtpError::io_error(format!("create {}: {}", local_path.display(), e)))?;
        self.download_core(DownloadSink::File(file), options, monitor, token)
            .await
    }

    /// Download into a caller-supplied writer.
    pub async fn download_to_writer(
        &self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        options: Option<&FtpOptions>,
        monitor: Option<&ProgressMonitor>,
        token: &CancelToken,
    ) -> FtpResult<u64> {
        self.download_core(DownloadSink::Writer(writer), options, monitor, token)
            .await
    }

    async fn download_core(
        &self,
        mut sink: DownloadSink<'_>,
        options: Option<&FtpOptions>,
        monitor: Option<&ProgressMonitor>,
        token: &CancelToken,
    ) -> FtpResult<u64> {
        let request = self.build_request(FtpVerb::Download, options);
        self.check_cancel(token)?;
        let (mut session, permit) = self.checkout(&request).await?;
        let result = download_body(&mut session, &request, &mut sink, monitor, token).await;
        self.checkin(session, &request, result.is_ok()).await;
        drop(permit);
        result
    }

    // ── Uploads ──────────────────────────────────────────────────────

    /// STOR from a local file.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        options: Option<&FtpOptions>,
        monitor: Option<&ProgressMonitor>,
        token: &CancelToken,
    ) -> FtpResult<u64> {
        let (file, len) = open_upload_file(local_path).await?;
        let (sent, _, _) = self
            .upload_core(
                FtpVerb::Upload,
                UploadSource::File(file),
                Some(len),
                options,
                monitor,
                token,
            )
            .await?;
        Ok(sent)
    }

    /// STOR from a caller-supplied reader; pass the length when the source
    /// knows it so the request carries a content length.
    pub async fn upload_from_reader(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        length: Option<u64>,
        options: Option<&FtpOptions>,
        monitor: Option<&ProgressMonitor>,
        token: &CancelToken,
    ) -> FtpResult<u64> {
        let (sent, _, _) = self
            .upload_core(
                FtpVerb::Upload,
                UploadSource::Reader(reader),
                length,
                options,
                monitor,
                token,
            )
            .await?;
        Ok(sent)
    }

    /// APPE from a local file.
    pub async fn append_file(
        &self,
        local_path: &Path,
        options: Option<&FtpOptions>,
        monitor: Option<&ProgressMonitor>,
        token: &CancelToken,
    ) -> FtpResult<u64> {
        let (file, len) = open_upload_file(local_path).await?;
        let (sent, _, _) = self
            .upload_core(
                FtpVerb::Append,
                UploadSource::File(file),
                Some(len),
                options,
                monitor,
                token,
            )
            .await?;
        Ok(sent)
    }

    /// APPE from a caller-supplied reader.
    pub async fn append_from_reader(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        length: Option<u64>,
        options: Option<&FtpOptions>,
        monitor: Option<&ProgressMonitor>,
        token: &CancelToken,
    ) -> FtpResult<u64> {
        let (sent, _, _) = self
            .upload_core(
                FtpVerb::Append,
                UploadSource::Reader(reader),
                length,
                options,
                monitor,
                token,
            )
            .await?;
        Ok(sent)
    }

    /// STOU: let the server pick a unique name, return its last path
    /// segment.
    pub async fn upload_unique(
        &self,
        local_path: &Path,
        options: Option<&FtpOptions>,
        token: &CancelToken,
    ) -> FtpResult<String> {
        let (file, len) = open_upload_file(local_path).await?;
        let (_, opening, done) = self
            .upload_core(
                FtpVerb::UploadUnique,
                UploadSource::File(file),
                Some(len),
                options,
                None,
                token,
            )
            .await?;
        parse_unique_name(&opening, &done).ok_or_else(|| {
            FtpError::protocol_error(format!(
                "cannot find unique name in: {} / {}",
                opening.text(),
                done.text()
            ))
        })
    }

    async fn upload_core(
        &self,
        verb: FtpVerb,
        mut source: UploadSource<'_>,
        length: Option<u64>,
        options: Option<&FtpOptions>,
        monitor: Option<&ProgressMonitor>,
        token: &CancelToken,
    ) -> FtpResult<(u64, FtpReply, FtpReply)> {
        let mut request = self.build_request(verb, options);
        request.content_length = length;
        self.check_cancel(token)?;
        let (mut session, permit) = self.checkout(&request).await?;
        let result =
            upload_body(&mut session, &request, &mut source, monitor, token).await;
        self.checkin(session, &request, result.is_ok()).await;
        drop(permit);
        result
    }
}

// ── Transfer bodies ──────────────────────────────────────────────────

enum DownloadSink<'a> {
    Buffer(&'a mut Vec<u8>),
    File(tokio::fs::File),
    Writer(&'a mut (dyn AsyncWrite + Unpin + Send)),
}

impl DownloadSink<'_> {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            DownloadSink::Buffer(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            DownloadSink::File(f) => f.write_all(data).await,
            DownloadSink::Writer(w) => w.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            DownloadSink::Buffer(_) => Ok(()),
            DownloadSink::File(f) => f.flush().await,
            DownloadSink::Writer(w) => w.flush().await,
        }
    }
}

enum UploadSource<'a> {
    File(tokio::fs::File),
    Reader(&'a mut (dyn AsyncRead + Unpin + Send)),
}

impl UploadSource<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            UploadSource::File(f) => f.read(buf).await,
            UploadSource::Reader(r) => r.read(buf).await,
        }
    }
}

async fn open_upload_file(path: &Path) -> FtpResult<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| FtpError::io_error(format!("open {}: {}", path.display(), e)))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| FtpError::io_error(format!("stat {}: {}", path.display(), e)))?
        .len();
    Ok((file, len))
}

async fn listing_body(
    session: &mut FtpSession,
    cmd: &str,
    request: &FtpRequest,
    token: &CancelToken,
) -> FtpResult<String> {
    let mut data = session.open_data(&request.options, request.security).await?;
    let opening = session
        .execute(&format!("{} {}", cmd, request.path))
        .await?;
    if !opening.is_preliminary() && !opening.is_success() {
        return Err(FtpError::from_reply(opening.code, &opening.text()));
    }

    let mut body = Vec::new();
    let mut buf = vec![0u8; request.options.buffer_size];
    loop {
        if token.is_cancelled() {
            return Err(FtpError::cancelled());
        }
        let n = data.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }

    let done = session.read_reply().await?;
    if !done.is_success() {
        return Err(FtpError::from_reply(done.code, &done.text()));
    }
    session.touch();
    String::from_utf8(body)
        .map_err(|e| FtpError::protocol_error(format!("listing not UTF-8: {}", e)))
}

async fn download_body(
    session: &mut FtpSession,
    request: &FtpRequest,
    sink: &mut DownloadSink<'_>,
    monitor: Option<&ProgressMonitor>,
    token: &CancelToken,
) -> FtpResult<u64> {
    if let Some(monitor) = monitor {
        // Best-effort size prefetch; a failure just means "unknown".
        let total = match session.size(&request.path).await {
            Ok(size) => size as i64,
            Err(_) => -1,
        };
        monitor.init(total);
    }

    let mut data = session.open_data(&request.options, request.security).await?;
    let opening = session.execute(&format!("RETR {}", request.path)).await?;
    if !opening.is_preliminary() && !opening.is_success() {
        return Err(FtpError::from_reply(opening.code, &opening.text()));
    }

    if let Some(monitor) = monitor {
        monitor.start_sampler();
    }
    let streamed = async {
        let mut buf = vec![0u8; request.options.buffer_size];
        let mut total = 0u64;
        loop {
            if token.is_cancelled() {
                return Err(FtpError::cancelled());
            }
            let n = data.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).await?;
            total += n as u64;
            if let Some(monitor) = monitor {
                monitor.add(n as u64);
            }
            if token.is_cancelled() {
                return Err(FtpError::cancelled());
            }
        }
        sink.flush().await?;
        Ok(total)
    }
    .await;
    if let Some(monitor) = monitor {
        monitor.stop_sampler();
    }
    let total = streamed?;

    let done = session.read_reply().await?;
    if !done.is_success() {
        return Err(FtpError::from_reply(done.code, &done.text()));
    }
    session.touch();
    Ok(total)
}

async fn upload_body(
    session: &mut FtpSession,
    request: &FtpRequest,
    source: &mut UploadSource<'_>,
    monitor: Option<&ProgressMonitor>,
    token: &CancelToken,
) -> FtpResult<(u64, FtpReply, FtpReply)> {
    if let Some(monitor) = monitor {
        monitor.init(request.content_length.map(|l| l as i64).unwrap_or(-1));
    }

    let cmd = match request.verb {
        FtpVerb::Append => format!("APPE {}", request.path),
        FtpVerb::UploadUnique => "STOU".to_string(),
        _ => format!("STOR {}", request.path),
    };

    let mut data = session.open_data(&request.options, request.security).await?;
    let opening = session.execute(&cmd).await?;
    if !opening.is_preliminary() && !opening.is_success() {
        return Err(FtpError::from_reply(opening.code, &opening.text()));
    }

    if let Some(monitor) = monitor {
        monitor.start_sampler();
    }
    let streamed = async {
        let mut buf = vec![0u8; request.options.buffer_size];
        let mut total = 0u64;
        loop {
            if token.is_cancelled() {
                return Err(FtpError::cancelled());
            }
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            data.write_all(&buf[..n]).await?;
            total += n as u64;
            if let Some(monitor) = monitor {
                monitor.add(n as u64);
            }
            if token.is_cancelled() {
                return Err(FtpError::cancelled());
            }
        }
        data.finish().await?;
        Ok(total)
    }
    .await;
    if let Some(monitor) = monitor {
        monitor.stop_sampler();
    }
    let total = streamed?;

    let done = session.read_reply().await?;
    if !done.is_success() {
        return Err(FtpError::from_reply(done.code, &done.text()));
    }
    session.touch();
    Ok((total, opening, done))
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Join the prior target's directory with the new name.
fn renamed_path(path: &str, new_name: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => format!("{}/{}", dir, new_name),
        None => new_name.to_string(),
    }
}

/// Dig the server-chosen name out of the STOU replies. Servers answer with
/// shapes like `150 FILE: upload.27` or `250 Transfer complete (unique file
/// name: upload.27)`; the name's last path segment is returned.
fn parse_unique_name(opening: &FtpReply, done: &FtpReply) -> Option<String> {
    for text in [opening.text(), done.text()] {
        if let Some(idx) = text.find("FILE:") {
            let name = text[idx + 5..].trim();
            if !name.is_empty() {
                return Some(last_segment(name));
            }
        }
    }
    // Fall back to the last token of the opening reply.
    let text = opening.text();
    let candidate = text
        .split_whitespace()
        .last()
        .filter(|t| t.parse::<u16>().is_err())?;
    Some(last_segment(candidate))
}

fn last_segment(name: &str) -> String {
    let trimmed = name.trim_matches(|c| c == '"' || c == '(' || c == ')' || c == '.');
    trimmed
        .rsplit('/')
        .next()
        .unwrap_or(trimmed)
        .to_string()
}
