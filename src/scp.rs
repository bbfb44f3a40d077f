//! SCP push-protocol driver
//!
//! Speaks the byte-oriented protocol expected by a remote `scp -t` sink:
//! ASCII control lines, raw payload followed by a single NUL terminator, and
//! a one-byte acknowledgement after each step. Messages and acknowledgements
//! strictly alternate; nothing is pipelined.
//!
//! The size header must be sent before any payload, so file content is
//! buffered in memory first. The largest transferable file is therefore
//! bounded by available memory.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::CommError;

/// Commands accepted by the sink pump task.
#[derive(Debug)]
pub(crate) enum SinkCommand {
    /// Bytes for the remote sink's stdin.
    Data(Vec<u8>),
    /// Close the input side; the remote sink sees EOF.
    Eof,
}

/// Terminal report from the pump task once the sink session is over.
#[derive(Debug)]
pub(crate) struct SinkExit {
    /// Remote exit status, if one was reported before the channel closed.
    pub(crate) status: Option<u32>,
    /// Accumulated remote stderr, kept for diagnostics.
    pub(crate) stderr: Vec<u8>,
}

/// Byte-level duplex view of a sink session.
///
/// Real instances are backed by a pump task owning the session channel (see
/// [`spawn_sink_pump`]); tests back the same struct with bare channel pairs.
pub(crate) struct SinkStream {
    cmd_tx: mpsc::Sender<SinkCommand>,
    data_rx: mpsc::Receiver<Vec<u8>>,
    buf: VecDeque<u8>,
}

impl SinkStream {
    pub(crate) fn new(cmd_tx: mpsc::Sender<SinkCommand>, data_rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            cmd_tx,
            data_rx,
            buf: VecDeque::new(),
        }
    }

    pub(crate) async fn send(&mut self, bytes: &[u8]) -> Result<(), CommError> {
        self.cmd_tx
            .send(SinkCommand::Data(bytes.to_vec()))
            .await
            .map_err(|_| closed_err(io::ErrorKind::BrokenPipe))
    }

    /// Signal end-of-input to the remote sink. Harmless if the session is
    /// already gone.
    pub(crate) async fn close_input(&mut self) {
        let _ = self.cmd_tx.send(SinkCommand::Eof).await;
    }

    /// Read exactly one byte from the sink's output.
    pub(crate) async fn recv_byte(&mut self) -> Result<u8, CommError> {
        loop {
            if let Some(b) = self.buf.pop_front() {
                return Ok(b);
            }
            match self.data_rx.recv().await {
                Some(chunk) => self.buf.extend(chunk),
                None => return Err(closed_err(io::ErrorKind::UnexpectedEof)),
            }
        }
    }

    /// Read one newline-terminated line, without the terminator.
    pub(crate) async fn recv_line(&mut self) -> Result<String, CommError> {
        let mut line = Vec::new();
        loop {
            let b = self.recv_byte().await?;
            if b == b'\n' {
                break;
            }
            line.push(b);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

fn closed_err(kind: io::ErrorKind) -> CommError {
    CommError::Io(io::Error::new(kind, "sink channel closed"))
}

/// Spawn the pump task that owns the sink session channel.
///
/// Single-owner pattern: writes arrive as [`SinkCommand`]s, sink output
/// flows back over a data channel, and the final [`SinkExit`] is delivered
/// over a oneshot once the channel closes.
pub(crate) fn spawn_sink_pump(
    mut channel: Channel<Msg>,
) -> (SinkStream, oneshot::Receiver<SinkExit>) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SinkCommand>(64);
    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(64);
    let (exit_tx, exit_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut status = None;
        let mut stderr = Vec::new();
        let mut input_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv(), if input_open => {
                    match cmd {
                        Some(SinkCommand::Data(bytes)) => {
                            if let Err(e) = channel.data(&bytes[..]).await {
                                warn!("sink channel write failed: {}", e);
                                break;
                            }
                        }
                        // A dropped stream closes the input the same way an
                        // explicit Eof does.
                        Some(SinkCommand::Eof) | None => {
                            input_open = false;
                            let _ = channel.eof().await;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            // A gone reader is fine; keep draining so the
                            // exit status still gets through.
                            let _ = data_tx.send(data.to_vec()).await;
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            if ext == 1 {
                                stderr.extend_from_slice(&data);
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            status = Some(exit_status);
                        }
                        Some(ChannelMsg::Eof) => {
                            // The exit status can trail the output EOF.
                        }
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    }
                }
            }
        }

        let _ = channel.close().await;
        let _ = exit_tx.send(SinkExit { status, stderr });
    });

    (SinkStream::new(cmd_tx, data_rx), exit_rx)
}

/// Map a sink process exit status to the transfer result. Exit 127 means
/// the remote could not start the sink program at all.
pub(crate) fn sink_exit_result(status: Option<u32>) -> Result<(), CommError> {
    match status {
        None | Some(0) => Ok(()),
        Some(127) => Err(CommError::SinkUnavailable),
        Some(code) => {
            warn!("remote sink exited with status {}", code);
            Err(CommError::RemoteExit(code))
        }
    }
}

/// Read one acknowledgement from the sink.
///
/// A zero byte is success. Any non-zero byte (1 = warning, 2 = fatal; both
/// abort) is followed by a newline-terminated message, which becomes the
/// error. A failure to read the byte or the message line itself is an IO
/// error, never success.
pub(crate) async fn check_sink_status(stream: &mut SinkStream) -> Result<(), CommError> {
    let code = stream.recv_byte().await?;
    if code == 0 {
        return Ok(());
    }

    let message = stream.recv_line().await.map_err(|e| match e {
        CommError::Io(err) => CommError::Io(io::Error::new(
            err.kind(),
            format!("error reading error message: {err}"),
        )),
        other => other,
    })?;
    Err(CommError::Protocol(message))
}

/// Upload a single file's worth of protocol: size header, payload, NUL
/// terminator, with an acknowledgement check after the header and after the
/// terminator.
pub(crate) async fn upload_file(
    stream: &mut SinkStream,
    name: &str,
    mut content: impl AsyncRead + Unpin,
) -> Result<(), CommError> {
    // The header carries the byte length, so drain the content into memory
    // first to learn it.
    let mut payload = Vec::new();
    content.read_to_end(&mut payload).await?;

    debug!("beginning file upload: {} ({} bytes)", name, payload.len());
    stream
        .send(format!("C0644 {} {}\n", payload.len(), name).as_bytes())
        .await?;
    check_sink_status(stream).await?;

    stream.send(&payload).await?;
    stream.send(&[0]).await?;
    check_sink_status(stream).await
}

/// One local entry in a directory upload.
#[derive(Debug)]
pub enum UploadEntry {
    /// Regular file. Content is read in full from `source` when the entry
    /// is sent.
    File {
        /// Name on the remote side, relative to the enclosing directory.
        name: String,
        /// Size recorded when the entry was built.
        len: u64,
        /// Local permission bits. The wire format currently fixes the mode
        /// at 0644, so these are informational.
        mode: u32,
        /// Local path the content is read from.
        source: PathBuf,
    },
    /// Directory with child entries in traversal order.
    Directory {
        name: String,
        /// Local permission bits; the wire fixes directories at 0755.
        mode: u32,
        children: Vec<UploadEntry>,
    },
}

impl UploadEntry {
    /// Build the entry tree for everything inside `dir`, children sorted by
    /// name for a deterministic traversal order.
    pub fn from_dir(dir: &Path) -> io::Result<Vec<UploadEntry>> {
        let mut names: Vec<PathBuf> = std::fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<_>>()?;
        names.sort();

        let mut entries = Vec::with_capacity(names.len());
        for path in names {
            let metadata = std::fs::metadata(&path)?;
            let name = entry_name(&path)?;
            if metadata.is_dir() {
                entries.push(UploadEntry::Directory {
                    name,
                    mode: mode_bits(&metadata),
                    children: Self::from_dir(&path)?,
                });
            } else if metadata.is_file() {
                entries.push(UploadEntry::File {
                    name,
                    len: metadata.len(),
                    mode: mode_bits(&metadata),
                    source: path,
                });
            }
            // Symlinks and special files are not transferable; skip them.
        }
        Ok(entries)
    }

    pub fn name(&self) -> &str {
        match self {
            UploadEntry::File { name, .. } => name,
            UploadEntry::Directory { name, .. } => name,
        }
    }
}

fn entry_name(path: &Path) -> io::Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "entry has no file name"))
}

#[cfg(unix)]
fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Upload the immediate regular files of `dir`, in sorted name order.
/// Subdirectories are skipped; the recursive form is [`upload_entries`].
pub(crate) async fn upload_flat(stream: &mut SinkStream, dir: &Path) -> Result<(), CommError> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    for path in files {
        let name = entry_name(&path)?;
        let file = tokio::fs::File::open(&path).await?;
        upload_file(stream, &name, file).await?;
    }
    Ok(())
}

/// Upload an entry tree recursively. Directories are bracketed by
/// `D0755 0 <name>` and `E` control lines, each acknowledged, so nested
/// paths are preserved on the remote side.
pub(crate) fn upload_entries<'a>(
    stream: &'a mut SinkStream,
    entries: &'a [UploadEntry],
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CommError>> + Send + 'a>> {
    Box::pin(async move {
        for entry in entries {
            match entry {
                UploadEntry::File { name, source, .. } => {
                    let file = tokio::fs::File::open(source).await?;
                    upload_file(stream, name, file).await?;
                }
                UploadEntry::Directory { name, children, .. } => {
                    debug!("starting directory upload: {}", name);
                    stream.send(format!("D0755 0 {}\n", name).as_bytes()).await?;
                    check_sink_status(stream).await?;

                    upload_entries(stream, children).await?;

                    stream.send(b"E\n").await?;
                    check_sink_status(stream).await?;
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    /// A sink stream wired to bare channel pairs, plus the far ends: the
    /// command receiver sees everything the driver sends, and the data
    /// sender scripts the sink's responses.
    fn test_stream() -> (
        SinkStream,
        mpsc::Receiver<SinkCommand>,
        mpsc::Sender<Vec<u8>>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (data_tx, data_rx) = mpsc::channel(64);
        (SinkStream::new(cmd_tx, data_rx), cmd_rx, data_tx)
    }

    fn sent_bytes(cmd_rx: &mut mpsc::Receiver<SinkCommand>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let SinkCommand::Data(bytes) = cmd {
                out.extend(bytes);
            }
        }
        out
    }

    #[tokio::test]
    async fn upload_file_emits_exact_wire_bytes() {
        let (mut stream, mut cmd_rx, data_tx) = test_stream();
        data_tx.send(vec![0, 0]).await.unwrap();

        let content: &[u8] = b"hello world";
        upload_file(&mut stream, "greeting.txt", content)
            .await
            .unwrap();

        let mut expected = b"C0644 11 greeting.txt\n".to_vec();
        expected.extend_from_slice(b"hello world");
        expected.push(0);
        assert_eq!(sent_bytes(&mut cmd_rx), expected);
    }

    #[tokio::test]
    async fn upload_file_waits_for_ack_before_payload() {
        let (mut stream, mut cmd_rx, data_tx) = test_stream();

        let driver = tokio::spawn(async move {
            let content: &[u8] = b"data";
            upload_file(&mut stream, "f", content).await
        });

        // Header arrives first.
        let header = match cmd_rx.recv().await.unwrap() {
            SinkCommand::Data(bytes) => bytes,
            other => panic!("unexpected command: {:?}", other),
        };
        assert_eq!(header, b"C0644 4 f\n");

        // No payload may show up until the acknowledgement is consumed.
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert!(cmd_rx.try_recv().is_err());

        data_tx.send(vec![0]).await.unwrap();
        let payload = match cmd_rx.recv().await.unwrap() {
            SinkCommand::Data(bytes) => bytes,
            other => panic!("unexpected command: {:?}", other),
        };
        assert_eq!(payload, b"data");

        data_tx.send(vec![0]).await.unwrap();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn error_ack_aborts_with_remote_message_and_no_payload() {
        let (mut stream, mut cmd_rx, data_tx) = test_stream();
        let mut response = vec![1];
        response.extend_from_slice(b"disk full\n");
        data_tx.send(response).await.unwrap();

        let content: &[u8] = b"should never be sent";
        let err = upload_file(&mut stream, "f.bin", content)
            .await
            .unwrap_err();
        match err {
            CommError::Protocol(message) => assert_eq!(message, "disk full"),
            other => panic!("unexpected error: {:?}", other),
        }

        // Only the header went out.
        assert_eq!(sent_bytes(&mut cmd_rx), b"C0644 20 f.bin\n");
    }

    #[tokio::test]
    async fn check_status_on_closed_stream_is_io_error() {
        let (mut stream, _cmd_rx, data_tx) = test_stream();
        drop(data_tx);

        let err = check_sink_status(&mut stream).await.unwrap_err();
        match err {
            CommError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn truncated_error_message_is_io_error() {
        let (mut stream, _cmd_rx, data_tx) = test_stream();
        // Non-zero ack but the stream dies before the message line ends.
        data_tx.send(vec![1, b'p', b'a', b'r']).await.unwrap();
        drop(data_tx);

        let err = check_sink_status(&mut stream).await.unwrap_err();
        assert!(matches!(err, CommError::Io(_)));
    }

    #[test]
    fn sink_exit_127_means_sink_unavailable() {
        assert!(matches!(
            sink_exit_result(Some(127)),
            Err(CommError::SinkUnavailable)
        ));
    }

    #[test]
    fn sink_exit_mapping() {
        assert!(sink_exit_result(None).is_ok());
        assert!(sink_exit_result(Some(0)).is_ok());
        assert!(matches!(
            sink_exit_result(Some(1)),
            Err(CommError::RemoteExit(1))
        ));
    }

    #[tokio::test]
    async fn flat_upload_skips_subdirectories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.txt"), b"nested").unwrap();

        let (mut stream, mut cmd_rx, data_tx) = test_stream();
        data_tx.send(vec![0, 0]).await.unwrap();

        upload_flat(&mut stream, dir.path()).await.unwrap();

        let mut expected = b"C0644 5 a.txt\n".to_vec();
        expected.extend_from_slice(b"alpha");
        expected.push(0);
        assert_eq!(sent_bytes(&mut cmd_rx), expected);
    }

    #[tokio::test]
    async fn recursive_upload_brackets_directories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.txt"), b"nested").unwrap();

        let entries = UploadEntry::from_dir(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name(), "a.txt");
        assert_eq!(entries[1].name(), "sub");

        let (mut stream, mut cmd_rx, data_tx) = test_stream();
        // a.txt (2 acks), D (1), inner.txt (2), E (1)
        data_tx.send(vec![0; 6]).await.unwrap();

        upload_entries(&mut stream, &entries).await.unwrap();

        let mut expected = b"C0644 5 a.txt\n".to_vec();
        expected.extend_from_slice(b"alpha");
        expected.push(0);
        expected.extend_from_slice(b"D0755 0 sub\n");
        expected.extend_from_slice(b"C0644 6 inner.txt\n");
        expected.extend_from_slice(b"nested");
        expected.push(0);
        expected.extend_from_slice(b"E\n");
        assert_eq!(sent_bytes(&mut cmd_rx), expected);
    }

    #[tokio::test]
    async fn recursive_upload_stops_on_directory_rejection() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.txt"), b"nested").unwrap();

        let entries = UploadEntry::from_dir(dir.path()).unwrap();

        let (mut stream, mut cmd_rx, data_tx) = test_stream();
        let mut response = vec![2];
        response.extend_from_slice(b"permission denied\n");
        data_tx.send(response).await.unwrap();

        let err = upload_entries(&mut stream, &entries).await.unwrap_err();
        match err {
            CommError::Protocol(message) => assert_eq!(message, "permission denied"),
            other => panic!("unexpected error: {:?}", other),
        }
        // The directory header went out, the nested file never did.
        assert_eq!(sent_bytes(&mut cmd_rx), b"D0755 0 sub\n");
    }

    #[test]
    fn from_dir_records_file_length() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("data.bin"), vec![7u8; 42]).unwrap();

        let entries = UploadEntry::from_dir(dir.path()).unwrap();
        match &entries[0] {
            UploadEntry::File { len, name, .. } => {
                assert_eq!(name, "data.bin");
                assert_eq!(*len, 42);
            }
            other => panic!("unexpected entry: {:?}", other),
        }
    }
}
