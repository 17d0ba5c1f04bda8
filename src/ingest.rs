//! Ingestion stage: upload intake and page extraction.
//!
//! [`store_upload`] writes an incoming byte stream to the uploads area in
//! fixed-size chunks, so memory use does not depend on the file size.
//! [`extract_document`] then hands the stored file to the
//! [`DocumentExtractor`] and produces the ordered [`PageText`] sequence.
//!
//! Cleanup rules: a write that fails partway deletes the partial file; a
//! file that fails to parse is kept for diagnostics; a successfully parsed
//! upload is deleted once its pages are in memory.

use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_stream::{Stream, StreamExt};

use crate::config::IngestConfig;
use crate::error::{PipelineError, Result};
use crate::models::{Document, PageText};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store::{sanitize_filename, ArtifactStore};
use crate::traits::DocumentExtractor;

/// Streams an upload into the store. Returns the stored [`Document`].
pub async fn store_upload<S, B, E>(
    store: &ArtifactStore,
    filename: &str,
    stream: S,
    config: &IngestConfig,
) -> Result<Document>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    tokio::fs::create_dir_all(store.uploads_dir()).await?;
    let path = store.upload_path(filename);

    match write_chunked(&path, stream, config).await {
        Ok(0) => {
            remove_quietly(&path).await;
            Err(PipelineError::Ingestion("upload is empty".to_string()))
        }
        Ok(size_bytes) => {
            tracing::info!(file = %path.display(), bytes = size_bytes, "stored upload");
            Ok(Document {
                filename: sanitize_filename(filename),
                size_bytes,
                path,
            })
        }
        Err(e) => {
            remove_quietly(&path).await;
            Err(e)
        }
    }
}

async fn write_chunked<S, B, E>(path: &Path, stream: S, config: &IngestConfig) -> Result<u64>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let chunk_size = config.chunk_size.max(1);
    let mut file = tokio::fs::File::create(path).await.map_err(write_error)?;
    let mut buf: Vec<u8> = Vec::with_capacity(chunk_size);
    let mut total: u64 = 0;

    let mut stream = std::pin::pin!(stream);
    while let Some(piece) = stream.next().await {
        let piece = piece
            .map_err(|e| PipelineError::Ingestion(format!("upload interrupted: {}", e)))?;
        let bytes = piece.as_ref();
        total += bytes.len() as u64;
        if total > config.max_upload_bytes {
            return Err(PipelineError::Ingestion(format!(
                "upload exceeds the {} byte limit",
                config.max_upload_bytes
            )));
        }
        buf.extend_from_slice(bytes);
        while buf.len() >= chunk_size {
            file.write_all(&buf[..chunk_size]).await.map_err(write_error)?;
            buf.drain(..chunk_size);
        }
    }
    if !buf.is_empty() {
        file.write_all(&buf).await.map_err(write_error)?;
    }
    file.flush().await.map_err(write_error)?;
    file.sync_all().await.map_err(write_error)?;
    Ok(total)
}

fn write_error(e: std::io::Error) -> PipelineError {
    PipelineError::Ingestion(format!("writing upload failed: {}", e))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(file = %path.display(), error = %e, "failed to remove upload");
        }
    }
}

/// Extracts ordered pages from a stored document and reports `total_pages`.
pub async fn extract_document(
    doc: &Document,
    extractor: Arc<dyn DocumentExtractor>,
    reporter: &dyn ProgressReporter,
) -> Result<Vec<PageText>> {
    let path = doc.path.clone();
    let pages = tokio::task::spawn_blocking(move || extractor.extract_pages(&path))
        .await
        .map_err(|e| PipelineError::Ingestion(format!("extraction task failed: {}", e)))?;

    let pages = match pages {
        Ok(pages) => pages,
        Err(e) => {
            tracing::warn!(file = %doc.path.display(), error = %e, "document could not be parsed; upload kept");
            return Err(PipelineError::Ingestion(format!(
                "could not parse {}: {:#}",
                doc.filename, e
            )));
        }
    };
    if pages.is_empty() {
        tracing::warn!(file = %doc.path.display(), "document has no pages; upload kept");
        return Err(PipelineError::Ingestion(format!(
            "{} has no pages",
            doc.filename
        )));
    }

    reporter.report(ProgressEvent::TotalPages { total: pages.len() });
    remove_quietly(&doc.path).await;

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, text)| PageText::new(i + 1, text))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::FileExtractor;
    use crate::progress::ChannelProgress;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ArtifactStore) {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        store.init().unwrap();
        (tmp, store)
    }

    fn small_chunks() -> IngestConfig {
        IngestConfig {
            chunk_size: 4,
            max_upload_bytes: 1024,
        }
    }

    fn ok_pieces(pieces: &[&str]) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> {
        let owned: Vec<_> = pieces.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        tokio_stream::iter(owned)
    }

    fn uploads(store: &ArtifactStore) -> usize {
        std::fs::read_dir(store.uploads_dir()).unwrap().count()
    }

    #[tokio::test]
    async fn stream_is_written_in_full() {
        let (_tmp, store) = setup();
        let doc = store_upload(&store, "notes.txt", ok_pieces(&["Rain ", "falls", ". Trees grow."]), &small_chunks())
            .await
            .unwrap();
        assert_eq!(doc.size_bytes, 23);
        assert_eq!(doc.filename, "notes.txt");
        assert_eq!(
            std::fs::read_to_string(&doc.path).unwrap(),
            "Rain falls. Trees grow."
        );
    }

    #[tokio::test]
    async fn empty_stream_is_rejected_and_cleaned() {
        let (_tmp, store) = setup();
        let err = store_upload(&store, "empty.txt", ok_pieces(&[]), &small_chunks())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Ingestion(_)));
        assert_eq!(uploads(&store), 0);
    }

    #[tokio::test]
    async fn interrupted_stream_deletes_partial_file() {
        let (_tmp, store) = setup();
        let pieces: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(b"first chunk".to_vec()),
            Err("connection reset".to_string()),
        ];
        let err = store_upload(&store, "doc.txt", tokio_stream::iter(pieces), &small_chunks())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(uploads(&store), 0);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let (_tmp, store) = setup();
        let config = IngestConfig {
            chunk_size: 4,
            max_upload_bytes: 8,
        };
        let err = store_upload(&store, "big.txt", ok_pieces(&["12345", "67890"]), &config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("limit"));
        assert_eq!(uploads(&store), 0);
    }

    #[tokio::test]
    async fn pages_are_extracted_and_upload_removed() {
        let (_tmp, store) = setup();
        let doc = store_upload(&store, "two.txt", ok_pieces(&["Page one.\x0cPage two."]), &small_chunks())
            .await
            .unwrap();
        let (reporter, mut rx) = ChannelProgress::new();
        let pages = extract_document(&doc, Arc::new(FileExtractor), &reporter)
            .await
            .unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1], PageText::new(2, "Page two."));
        assert_eq!(rx.try_recv().unwrap(), ProgressEvent::TotalPages { total: 2 });
        assert!(!doc.path.exists());
    }

    #[tokio::test]
    async fn unparseable_upload_is_kept() {
        let (_tmp, store) = setup();
        let doc = store_upload(&store, "broken.pdf", ok_pieces(&["not a pdf"]), &small_chunks())
            .await
            .unwrap();
        let (reporter, mut rx) = ChannelProgress::new();
        let err = extract_document(&doc, Arc::new(FileExtractor), &reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Ingestion(_)));
        assert!(doc.path.exists());
        assert!(rx.try_recv().is_err());
    }
}
