//! JSONL sink for `meshguard`. Writes one [`ResilienceEvent`] per line.
//! Always appends; bring your own path.

use meshguard::ResilienceEvent;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: Arc<PathBuf>,
    // Clones share the lock so concurrent writers never interleave partial lines.
    write_lock: Arc<Mutex<()>>,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: Arc::new(path.into()), write_lock: Arc::new(Mutex::new(())) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl tower_service::Service<ResilienceEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ResilienceEvent) -> Self::Future {
        let path = self.path.clone();
        let write_lock = self.write_lock.clone();
        Box::pin(async move {
            let mut line = serde_json::to_string(&event)?;
            line.push('\n');
            let _guard = write_lock.lock().await;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(path.as_path()).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(id = %event.id, kind = %event.kind, "jsonl: event written");
            Ok(())
        })
    }
}
