//! Extraction stage: pages to a persisted training set.
//!
//! Each page is split into sentences, the sentences are batched, and every
//! batch goes to the configured [`QaSource`]. Accepted records are appended
//! to the model's `.partial` training file as they are produced. The file
//! only replaces the previous training set once the whole document is done
//! and at least one record was written.

use std::path::PathBuf;

use crate::chunk::split_sentences;
use crate::config::ExtractionConfig;
use crate::error::{PipelineError, Result};
use crate::models::PageText;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::qa::QaSource;
use crate::store::{ArtifactStore, TrainingSetWriter};

pub const SAVING_MESSAGE: &str = "Saving training data...";

#[derive(Debug, Clone)]
pub struct ExtractionSummary {
    pub records: usize,
    pub training_file: PathBuf,
}

/// Runs extraction over `pages` and finalizes the training set for
/// `model_name`. Emits `page_start`/`page_complete` per page and `saving`
/// before the file is finalized.
pub async fn run_extraction(
    store: &ArtifactStore,
    model_name: &str,
    pages: &[PageText],
    qa: &dyn QaSource,
    config: &ExtractionConfig,
    reporter: &dyn ProgressReporter,
) -> Result<ExtractionSummary> {
    let mut writer = store.training_writer(model_name)?;

    match extract_pages(&mut writer, pages, qa, config, reporter).await {
        Ok(()) if writer.count() > 0 => {
            reporter.report(ProgressEvent::Saving {
                message: SAVING_MESSAGE.to_string(),
            });
            let records = writer.count();
            let training_file = writer.finish()?;
            tracing::info!(model = model_name, records, file = %training_file.display(), "training set written");
            Ok(ExtractionSummary {
                records,
                training_file,
            })
        }
        Ok(()) => {
            writer.abort();
            Err(PipelineError::Extraction(format!(
                "no valid training pairs produced from {} page(s)",
                pages.len()
            )))
        }
        Err(e) => {
            writer.abort();
            Err(e)
        }
    }
}

async fn extract_pages(
    writer: &mut TrainingSetWriter,
    pages: &[PageText],
    qa: &dyn QaSource,
    config: &ExtractionConfig,
    reporter: &dyn ProgressReporter,
) -> Result<()> {
    let total = pages.len();
    for page in pages {
        reporter.report(ProgressEvent::PageStart {
            page: page.index,
            total,
        });

        let sentences = split_sentences(&page.text);
        let mut page_records = 0;
        for batch in sentences.chunks(config.sentences_per_batch.max(1)) {
            for record in qa.pairs_for_batch(batch).await? {
                writer.append(&record)?;
                page_records += 1;
            }
        }
        tracing::debug!(
            page = page.index,
            chars = page.char_len(),
            sentences = sentences.len(),
            records = page_records,
            "page extracted"
        );

        reporter.report(ProgressEvent::PageComplete {
            page: page.index,
            total,
            records: page_records,
        });
        // Let the progress observer see this page before the next one starts.
        tokio::task::yield_now().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrainingRecord;
    use crate::progress::ChannelProgress;
    use crate::qa::HeuristicQa;
    use crate::store::read_training_set;
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ArtifactStore) {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        store.init().unwrap();
        (tmp, store)
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn empty_second_page_still_produces_records() {
        let (_tmp, store) = setup();
        let config = ExtractionConfig::default();
        let qa = HeuristicQa::from_config(&config);
        let pages = vec![
            PageText::new(1, "Rain falls in spring. Trees grow tall."),
            PageText::new(2, ""),
        ];
        let (reporter, mut rx) = ChannelProgress::new();

        let summary = run_extraction(&store, "m", &pages, &qa, &config, &reporter)
            .await
            .unwrap();
        assert!(summary.records >= 1);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                ProgressEvent::PageStart { page: 1, total: 2 },
                ProgressEvent::PageComplete {
                    page: 1,
                    total: 2,
                    records: summary.records
                },
                ProgressEvent::PageStart { page: 2, total: 2 },
                ProgressEvent::PageComplete {
                    page: 2,
                    total: 2,
                    records: 0
                },
                ProgressEvent::Saving {
                    message: SAVING_MESSAGE.to_string()
                },
            ]
        );

        let records = read_training_set(&summary.training_file).unwrap();
        assert_eq!(records.len(), summary.records);
        assert!(records
            .iter()
            .all(|r| !r.instruction().is_empty() && !r.output().is_empty()));
    }

    #[tokio::test]
    async fn no_sentences_is_an_extraction_error() {
        let (_tmp, store) = setup();
        let config = ExtractionConfig::default();
        let qa = HeuristicQa::from_config(&config);
        let pages = vec![PageText::new(1, "   "), PageText::new(2, "Tiny.")];
        let (reporter, _rx) = ChannelProgress::new();

        let err = run_extraction(&store, "m", &pages, &qa, &config, &reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));

        let path = store.training_path("m").unwrap();
        assert!(!path.exists());
        let mut partial = path.into_os_string();
        partial.push(".partial");
        assert!(!PathBuf::from(partial).exists());
    }

    #[tokio::test]
    async fn failed_run_keeps_previous_training_set() {
        let (_tmp, store) = setup();
        let config = ExtractionConfig::default();
        let qa = HeuristicQa::from_config(&config);
        let (reporter, _rx) = ChannelProgress::new();
        let good = vec![PageText::new(1, "The first document has a long sentence.")];
        let first = run_extraction(&store, "m", &good, &qa, &config, &reporter)
            .await
            .unwrap();

        let (reporter, _rx) = ChannelProgress::new();
        let empty = vec![PageText::new(1, "")];
        assert!(run_extraction(&store, "m", &empty, &qa, &config, &reporter)
            .await
            .is_err());

        let records = read_training_set(&first.training_file).unwrap();
        assert_eq!(records.len(), 1);
    }

    struct FailingQa;

    #[async_trait]
    impl QaSource for FailingQa {
        async fn pairs_for_batch(&self, _sentences: &[String]) -> Result<Vec<TrainingRecord>> {
            Err(PipelineError::Generation("worker crashed".into()))
        }
    }

    #[tokio::test]
    async fn qa_source_failure_aborts_without_saving() {
        let (_tmp, store) = setup();
        let config = ExtractionConfig::default();
        let pages = vec![PageText::new(1, "A sentence that is long enough.")];
        let (reporter, mut rx) = ChannelProgress::new();

        let err = run_extraction(&store, "m", &pages, &FailingQa, &config, &reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Generation(_)));
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ProgressEvent::Saving { .. })));
        assert!(!store.training_path("m").unwrap().exists());
    }
}
