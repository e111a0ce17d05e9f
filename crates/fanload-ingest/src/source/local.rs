use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use fanload_common::FileReference;
use tokio::io::BufReader;
use tracing::debug;

use super::{LineStream, ObjectSource, STREAM_BUFFER_BYTES};
use crate::error::{IngestError, Result};

/// Serves objects from a directory tree: `<root>/<container>/<key>`
#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a reference to a path under the root, refusing `..` and
    /// absolute components so a key cannot escape its container
    pub fn resolve(&self, file: &FileReference) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in [file.container_id.as_str(), file.object_key.as_str()] {
            for component in Path::new(part).components() {
                match component {
                    Component::Normal(segment) => path.push(segment),
                    Component::CurDir => {},
                    _ => {
                        return Err(IngestError::source_unreadable(
                            file.url(),
                            format!("path component {component:?} is not allowed"),
                        ))
                    },
                }
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectSource for LocalSource {
    async fn open(&self, file: &FileReference) -> Result<LineStream> {
        let path = self.resolve(file)?;
        debug!(path = %path.display(), "Opening local object");

        let handle = tokio::fs::File::open(&path)
            .await
            .map_err(|e| IngestError::source_unreadable(file.url(), e))?;

        Ok(Box::pin(BufReader::with_capacity(STREAM_BUFFER_BYTES, handle)))
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}
