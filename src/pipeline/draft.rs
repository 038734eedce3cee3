//! Draft pipeline: prompt → draft → summary.
//!
//! Pipeline flow:
//! Items (JSONL) → Scheduler → per-item StageChain (draft, summary) → JSONL
//!
//! Each item checkpoints under `<root>/<item id>/`, so a rerun only calls the
//! model for stages whose checkpoint is missing or invalid.

use crate::checkpoint::{
    CheckpointStore, Stage, StageChain, StageInputs, StageSource, write_atomic,
};
use crate::client::{CompletionRequest, Message, ModelClient};
use crate::models::{Result, StagerunError};
use crate::pool::{JobSpec, run_jobs};
use crate::progress::{JobReporter, ProgressReporter};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const DRAFT_STAGE: &str = "draft";
pub const SUMMARY_STAGE: &str = "summary";

const DRAFT_SYSTEM_PROMPT: &str =
    "You are a careful writer. Answer the request in a few clear paragraphs.";
const SUMMARY_SYSTEM_PROMPT: &str = "Summarize the text you are given in one sentence.";

/// One input line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftItem {
    pub id: String,
    pub prompt: String,
}

/// Output of the `draft` stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub text: String,
    pub model: String,
}

/// Output of the `summary` stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftSummary {
    pub summary: String,
    /// Length in chars of the draft that was summarized
    pub draft_chars: usize,
}

/// Schema version of [`DraftSummary`] checkpoints.
const SUMMARY_SCHEMA_VERSION: u32 = 2;

/// One output line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftOutput {
    pub id: String,
    pub prompt: String,
    pub draft: String,
    pub summary: String,
    pub draft_source: StageSource,
    pub summary_source: StageSource,
    pub cost_usd: f64,
}

/// Checkpoint state of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemStatus {
    pub id: String,
    /// Stages with a checkpoint on disk
    pub checkpointed: Vec<String>,
}

impl ItemStatus {
    pub fn is_complete(&self) -> bool {
        [DRAFT_STAGE, SUMMARY_STAGE]
            .iter()
            .all(|stage| self.checkpointed.iter().any(|s| s == stage))
    }
}

fn check_item_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(StagerunError::Validation(format!(
            "Item id '{id}' cannot be used as a checkpoint directory"
        )));
    }
    Ok(())
}

fn non_empty(text: &str, what: &str) -> std::result::Result<(), String> {
    if text.trim().is_empty() {
        Err(format!("empty {what}"))
    } else {
        Ok(())
    }
}

fn summary_matches_draft(
    summary: &DraftSummary,
    resolved: &StageInputs,
) -> std::result::Result<(), String> {
    non_empty(&summary.summary, "summary")?;
    if !resolved.contains(DRAFT_STAGE) {
        return Ok(());
    }
    let draft: Draft = resolved.get(DRAFT_STAGE).map_err(|e| e.to_string())?;
    let chars = draft.text.chars().count();
    if summary.draft_chars != chars {
        return Err(format!(
            "written for a {}-char draft, current draft has {chars}",
            summary.draft_chars
        ));
    }
    Ok(())
}

/// Two-stage generation pipeline over a model client.
pub struct DraftPipeline {
    client: Arc<dyn ModelClient>,
    model: String,
    checkpoint_root: PathBuf,
}

impl DraftPipeline {
    pub fn new(
        client: Arc<dyn ModelClient>,
        model: impl Into<String>,
        checkpoint_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            checkpoint_root: checkpoint_root.into(),
        }
    }

    /// Load items from a JSONL file. Ids must be unique and usable as
    /// directory names.
    pub fn load_items(path: &Path) -> Result<Vec<DraftItem>> {
        let file = File::open(path).map_err(|e| StagerunError::io("opening items file", e))?;
        let reader = BufReader::new(file);
        let mut items: Vec<DraftItem> = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| StagerunError::io("reading items file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let item: DraftItem = serde_json::from_str(&line)
                .map_err(|e| StagerunError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
            check_item_id(&item.id)?;
            if items.iter().any(|existing| existing.id == item.id) {
                return Err(StagerunError::Validation(format!(
                    "Line {}: duplicate item id '{}'",
                    line_num + 1,
                    item.id
                )));
            }
            items.push(item);
        }

        info!(count = items.len(), "Loaded items");
        Ok(items)
    }

    /// Checkpoint directory of one item.
    pub fn checkpoint_dir(&self, id: &str) -> PathBuf {
        self.checkpoint_root.join(id)
    }

    fn chain(&self, item: &DraftItem, reporter: Arc<dyn ProgressReporter>) -> Result<StageChain> {
        check_item_id(&item.id)?;

        let client = Arc::clone(&self.client);
        let model = self.model.clone();
        let prompt = item.prompt.clone();
        let draft = Stage::new(DRAFT_STAGE, move |inputs: StageInputs| {
            let client = Arc::clone(&client);
            let request = CompletionRequest::new(
                model.clone(),
                vec![Message::system(DRAFT_SYSTEM_PROMPT), Message::user(prompt.clone())],
            );
            async move {
                let completion = client.complete(inputs.reporter(), request).await?;
                Ok::<_, StagerunError>(Draft {
                    text: completion.content,
                    model: completion.model,
                })
            }
        })
        .validate(|draft: &Draft| non_empty(&draft.text, "draft"));

        let client = Arc::clone(&self.client);
        let model = self.model.clone();
        let summary = Stage::new(SUMMARY_STAGE, move |inputs: StageInputs| {
            let client = Arc::clone(&client);
            let model = model.clone();
            async move {
                let draft: Draft = inputs.get(DRAFT_STAGE)?;
                let draft_chars = draft.text.chars().count();
                let request = CompletionRequest::new(
                    model,
                    vec![Message::system(SUMMARY_SYSTEM_PROMPT), Message::user(draft.text)],
                );
                let completion = client.complete(inputs.reporter(), request).await?;
                Ok::<_, StagerunError>(DraftSummary {
                    summary: completion.content.trim().to_string(),
                    draft_chars,
                })
            }
        })
        .depends_on(&[DRAFT_STAGE])
        .schema_version(SUMMARY_SCHEMA_VERSION)
        .validate_with(summary_matches_draft);

        StageChain::builder(self.checkpoint_dir(&item.id))
            .stage(draft)
            .stage(summary)
            .build(reporter)
    }

    /// Resolve both stages for one item.
    ///
    /// The draft is resolved first so a summary checkpoint written for a
    /// different draft is caught and regenerated.
    pub async fn process(&self, item: DraftItem, reporter: JobReporter) -> Result<DraftOutput> {
        let shared: Arc<dyn ProgressReporter> = Arc::new(reporter.clone());
        let mut chain = self.chain(&item, shared)?;
        chain.store().sweep_temp_files().await?;

        let draft = chain.ensure::<Draft>(DRAFT_STAGE).await?;
        let summary = chain.ensure::<DraftSummary>(SUMMARY_STAGE).await?;

        Ok(DraftOutput {
            id: item.id,
            prompt: item.prompt,
            draft: draft.value.text,
            summary: summary.value.summary,
            draft_source: draft.source,
            summary_source: summary.source,
            cost_usd: reporter.usage().cost_usd,
        })
    }

    /// Run every item through the scheduler and write the outputs as JSONL.
    pub async fn run(
        self: Arc<Self>,
        spec: JobSpec<DraftItem>,
        output_path: &Path,
    ) -> Result<Vec<DraftOutput>> {
        let pipeline = Arc::clone(&self);
        let outputs = run_jobs(spec, |item| item.id.clone(), move |item, reporter| {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.process(item, reporter).await }
        })
        .await?;

        let mut content = String::new();
        for output in &outputs {
            let line = serde_json::to_string(output).map_err(|e| {
                StagerunError::Internal(format!("Serializing output {}: {e}", output.id))
            })?;
            content.push_str(&line);
            content.push('\n');
        }
        write_atomic(output_path, content.as_bytes()).await?;

        let generated = outputs
            .iter()
            .filter(|o| o.summary_source == StageSource::Generated)
            .count();
        info!(
            items = outputs.len(),
            generated,
            cached = outputs.len() - generated,
            output = %output_path.display(),
            "Pipeline complete"
        );
        Ok(outputs)
    }

    /// Which stages each item already has checkpointed.
    pub async fn status(&self, items: &[DraftItem]) -> Result<Vec<ItemStatus>> {
        let mut statuses = Vec::with_capacity(items.len());
        for item in items {
            let store = CheckpointStore::new(self.checkpoint_dir(&item.id));
            statuses.push(ItemStatus {
                id: item.id.clone(),
                checkpointed: store.list().await?,
            });
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Completion;
    use crate::models::{ModelCallRequest, StatusMode, TokenTotals, UsageChunk};
    use crate::progress::MeteredCall;
    use crate::usage::UsageLedger;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Echoes the last user message and meters each call.
    #[derive(Default)]
    struct EchoClient {
        prompts: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl ModelClient for EchoClient {
        async fn complete(
            &self,
            reporter: &dyn ProgressReporter,
            request: CompletionRequest,
        ) -> Result<Completion> {
            let request_meta = ModelCallRequest::new(request.model.clone(), 0);
            let call = MeteredCall::start(reporter, request_meta);
            let prompt = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            self.prompts.lock().push(prompt.clone());

            if self.fail_on.as_deref() == Some(prompt.as_str()) {
                return Err(StagerunError::Timeout(Duration::from_secs(1)));
            }

            call.record(&UsageChunk {
                prompt_tokens: Some(10),
                response_tokens: Some(5),
                ..Default::default()
            });
            let finished = call.finish();
            Ok(Completion {
                content: format!("echo: {prompt}"),
                model: request.model,
                tokens: finished.as_ref().and_then(|f| f.tokens),
                cost_usd: finished.map_or(0.0, |f| f.cost_usd),
                duration: Duration::ZERO,
            })
        }
    }

    fn ledger() -> Arc<UsageLedger> {
        Arc::new(UsageLedger::new(Arc::new(
            |_: &str, _: Option<&TokenTotals>, _: u64, _: Option<&str>| 0.01,
        )))
    }

    fn items() -> Vec<DraftItem> {
        vec![
            DraftItem {
                id: "first".to_string(),
                prompt: "write about rust".to_string(),
            },
            DraftItem {
                id: "second".to_string(),
                prompt: "write about tokio".to_string(),
            },
        ]
    }

    fn spec(items: Vec<DraftItem>, ledger: Arc<UsageLedger>) -> JobSpec<DraftItem> {
        JobSpec::new("drafts", items, ledger)
            .with_concurrency(2)
            .with_status_mode(StatusMode::Off)
    }

    #[tokio::test]
    async fn test_run_generates_then_reuses_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("out.jsonl");
        let client = Arc::new(EchoClient::default());
        let pipeline = Arc::new(DraftPipeline::new(
            client.clone(),
            "m",
            temp_dir.path().join("checkpoints"),
        ));

        let ledger1 = ledger();
        let first = Arc::clone(&pipeline)
            .run(spec(items(), Arc::clone(&ledger1)), &output)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, "first");
        assert_eq!(first[0].draft, "echo: write about rust");
        assert_eq!(first[0].summary, "echo: echo: write about rust");
        assert_eq!(first[0].summary_source, StageSource::Generated);
        assert_eq!(ledger1.summary().totals.calls, 4);
        assert!((first[0].cost_usd - 0.02).abs() < 1e-9);

        let written = std::fs::read_to_string(&output).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(written.contains("\"summarySource\":\"generated\""));

        let ledger2 = ledger();
        let second = Arc::clone(&pipeline)
            .run(spec(items(), Arc::clone(&ledger2)), &output)
            .await
            .unwrap();
        assert_eq!(second[1].draft_source, StageSource::Cache);
        assert_eq!(second[1].summary_source, StageSource::Cache);
        assert_eq!(second[1].summary, first[1].summary);
        assert_eq!(ledger2.summary().totals.calls, 0);
        assert_eq!(client.prompts.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_deleted_summary_only_regenerates_summary() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("out.jsonl");
        let client = Arc::new(EchoClient::default());
        let pipeline = Arc::new(DraftPipeline::new(client.clone(), "m", temp_dir.path()));

        Arc::clone(&pipeline)
            .run(spec(items(), ledger()), &output)
            .await
            .unwrap();
        std::fs::remove_file(pipeline.checkpoint_dir("first").join("summary.json")).unwrap();

        let rerun = Arc::clone(&pipeline)
            .run(spec(items(), ledger()), &output)
            .await
            .unwrap();
        assert_eq!(rerun[0].draft_source, StageSource::Cache);
        assert_eq!(rerun[0].summary_source, StageSource::Generated);
        assert_eq!(client.prompts.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_summary_of_replaced_draft_is_regenerated() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("out.jsonl");
        let client = Arc::new(EchoClient::default());
        let pipeline = Arc::new(DraftPipeline::new(client.clone(), "m", temp_dir.path()));

        Arc::clone(&pipeline)
            .run(spec(items(), ledger()), &output)
            .await
            .unwrap();

        // Swap in a hand-edited draft; the old summary no longer matches it
        let store = CheckpointStore::new(pipeline.checkpoint_dir("first"));
        let edited = Draft {
            text: "a much longer hand-edited draft".to_string(),
            model: "m".to_string(),
        };
        store.write(DRAFT_STAGE, 1, &edited).await.unwrap();

        let rerun = Arc::clone(&pipeline)
            .run(spec(items(), ledger()), &output)
            .await
            .unwrap();
        assert_eq!(rerun[0].draft_source, StageSource::Cache);
        assert_eq!(rerun[0].draft, edited.text);
        assert_eq!(rerun[0].summary_source, StageSource::Generated);
        assert_eq!(rerun[0].summary, format!("echo: {}", edited.text));
        assert_eq!(rerun[1].summary_source, StageSource::Cache);
        assert_eq!(client.prompts.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_failing_item_surfaces_original_error() {
        let temp_dir = TempDir::new().unwrap();
        let client = Arc::new(EchoClient {
            fail_on: Some("write about tokio".to_string()),
            ..Default::default()
        });
        let pipeline = Arc::new(DraftPipeline::new(client, "m", temp_dir.path()));
        let ledger = ledger();

        let err = Arc::clone(&pipeline)
            .run(spec(items(), Arc::clone(&ledger)), &temp_dir.path().join("out.jsonl"))
            .await
            .unwrap_err();

        assert!(matches!(err, StagerunError::Timeout(_)));
        assert_eq!(ledger.open_calls(), 0);
        assert!(!temp_dir.path().join("out.jsonl").exists());
        assert!(!pipeline.checkpoint_dir("second").join("draft.json").exists());
    }

    #[tokio::test]
    async fn test_status_reports_checkpointed_stages() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = Arc::new(DraftPipeline::new(
            Arc::new(EchoClient::default()),
            "m",
            temp_dir.path(),
        ));

        let before = pipeline.status(&items()).await.unwrap();
        assert!(before.iter().all(|s| s.checkpointed.is_empty()));

        Arc::clone(&pipeline)
            .run(spec(items(), ledger()), &temp_dir.path().join("out.jsonl"))
            .await
            .unwrap();

        let after = pipeline.status(&items()).await.unwrap();
        assert!(after.iter().all(ItemStatus::is_complete));
        assert_eq!(after[0].checkpointed, vec!["draft".to_string(), "summary".to_string()]);
    }

    #[test]
    fn test_load_items() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"id": "a", "prompt": "one"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"id": "b", "prompt": "two"}}"#).unwrap();

        let items = DraftPipeline::load_items(file.path()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].prompt, "two");
    }

    #[test]
    fn test_load_items_rejects_bad_lines() {
        let mut dup = tempfile::NamedTempFile::new().unwrap();
        writeln!(dup, r#"{{"id": "a", "prompt": "one"}}"#).unwrap();
        writeln!(dup, r#"{{"id": "a", "prompt": "two"}}"#).unwrap();
        assert!(matches!(
            DraftPipeline::load_items(dup.path()),
            Err(StagerunError::Validation(_))
        ));

        let mut garbled = tempfile::NamedTempFile::new().unwrap();
        writeln!(garbled, "not json").unwrap();
        assert!(matches!(
            DraftPipeline::load_items(garbled.path()),
            Err(StagerunError::ParseError(_))
        ));

        let mut escape = tempfile::NamedTempFile::new().unwrap();
        writeln!(escape, r#"{{"id": "../etc", "prompt": "x"}}"#).unwrap();
        assert!(matches!(
            DraftPipeline::load_items(escape.path()),
            Err(StagerunError::Validation(_))
        ));
    }
}
