use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use fanload_common::FileReference;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio::sync::RwLock;

use super::{LineStream, ObjectSource};
use crate::error::{IngestError, Result};

#[derive(Clone)]
enum Object {
    Complete(Arc<[u8]>),
    /// Yields the prefix, then an I/O error
    Truncated(Arc<[u8]>),
}

/// In-memory objects, for dry runs and tests
#[derive(Clone, Default)]
pub struct MemorySource {
    objects: Arc<RwLock<HashMap<FileReference, Object>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, file: FileReference, contents: impl Into<Vec<u8>>) {
        let bytes: Arc<[u8]> = contents.into().into();
        self.objects.write().await.insert(file, Object::Complete(bytes));
    }

    /// Register an object whose stream fails after `prefix` has been read
    pub async fn insert_truncated(&self, file: FileReference, prefix: impl Into<Vec<u8>>) {
        let bytes: Arc<[u8]> = prefix.into().into();
        self.objects.write().await.insert(file, Object::Truncated(bytes));
    }

    pub async fn remove(&self, file: &FileReference) -> bool {
        self.objects.write().await.remove(file).is_some()
    }
}

#[async_trait]
impl ObjectSource for MemorySource {
    async fn open(&self, file: &FileReference) -> Result<LineStream> {
        let object = self
            .objects
            .read()
            .await
            .get(file)
            .cloned()
            .ok_or_else(|| IngestError::source_unreadable(file.url(), "no such object"))?;

        Ok(match object {
            Object::Complete(bytes) => Box::pin(io::Cursor::new(bytes)),
            Object::Truncated(bytes) => {
                Box::pin(BufReader::new(io::Cursor::new(bytes).chain(BrokenStream)))
            },
        })
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

struct BrokenStream;

impl AsyncRead for BrokenStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "stream reset by peer",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_open_missing_object() {
        let source = MemorySource::new();
        let result = source.open(&FileReference::new("b", "k")).await;
        assert!(matches!(result, Err(IngestError::SourceUnreadable { .. })));
    }

    #[tokio::test]
    async fn test_each_open_starts_at_beginning() {
        let source = MemorySource::new();
        let file = FileReference::new("b", "k");
        source.insert(file.clone(), "a\nb\n").await;

        for _ in 0..2 {
            let mut out = String::new();
            source.open(&file).await.unwrap().read_to_string(&mut out).await.unwrap();
            assert_eq!(out, "a\nb\n");
        }
    }

    #[tokio::test]
    async fn test_truncated_object_errors_after_prefix() {
        let source = MemorySource::new();
        let file = FileReference::new("b", "k");
        source.insert_truncated(file.clone(), "a\n").await;

        let mut out = Vec::new();
        let err = source.open(&file).await.unwrap().read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(out, b"a\n");
    }
}
