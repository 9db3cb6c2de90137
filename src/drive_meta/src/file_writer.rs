use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use drive_lib::{DriveError, DriveNode, DrivePath, DriveResult, ObjectId};
use log::debug;
use tokio::io::AsyncWrite;

use crate::drive_fs::{FsCore, Reservation};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    CreateOrTruncate,
    CreateExclusive,
}

/// Outcome of a commit: the file's new state and whether the commit made
/// the file (`false` means it replaced existing content).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Committed {
    pub node: DriveNode,
    pub created: bool,
}

/// Buffer-then-commit file sink. Bytes stay local until `close`; dropping
/// the writer without closing it discards them.
pub struct DriveFileWriter {
    core: Arc<FsCore>,
    path: DrivePath,
    parent: ObjectId,
    name: String,
    mode: WriteMode,
    buf: BytesMut,
    max_size: u64,
    closed: bool,
    _reservation: Option<Reservation>,
}

impl DriveFileWriter {
    pub(crate) fn new(
        core: Arc<FsCore>,
        path: DrivePath,
        parent: ObjectId,
        name: String,
        mode: WriteMode,
        reservation: Option<Reservation>,
    ) -> Self {
        let max_size = core.config.max_write_size;
        Self {
            core,
            path,
            parent,
            name,
            mode,
            buf: BytesMut::new(),
            max_size,
            closed: false,
            _reservation: reservation,
        }
    }

    pub fn path(&self) -> &DrivePath {
        &self.path
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> DriveResult<()> {
        let next = self.len() + data.len() as u64;
        if next > self.max_size {
            return Err(DriveError::InvalidParam(format!(
                "write to {} exceeds limit of {} bytes",
                self.path, self.max_size
            )));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Upload the buffered content and commit it as the file's new state.
    pub async fn close(mut self) -> DriveResult<Committed> {
        self.closed = true;
        let data = std::mem::take(&mut self.buf).freeze();
        self.core
            .commit(&self.parent, &self.name, self.mode, data)
            .await
    }
}

impl Drop for DriveFileWriter {
    fn drop(&mut self) {
        if !self.closed {
            debug!(
                "file writer: discarding {} uncommitted bytes for {}",
                self.buf.len(),
                self.path
            );
        }
    }
}

// Shutdown does not commit; only `close` does.
impl AsyncWrite for DriveFileWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.write_chunk(buf) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
