//! Checkpoint-backed stage chains.
//!
//! A chain is a fixed graph of named stages. Resolving a stage returns, in
//! order of preference:
//! 1. the value already resolved earlier in this run
//! 2. a valid checkpoint from a previous run
//! 3. a freshly generated value (dependencies resolved first), which is then
//!    checkpointed
//!
//! Invalid checkpoints are reported through the job's reporter and treated
//! as missing. A checkpoint can also be rejected for disagreeing with stages
//! already resolved in the run (see [`Stage::validate_with`]). There is no
//! automatic downstream invalidation: deleting a checkpoint regenerates that
//! stage only.

use crate::checkpoint::{CheckpointRead, CheckpointStore};
use crate::models::{Result, StagerunError};
use crate::progress::ProgressReporter;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Where a resolved stage value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageSource {
    /// Read from an existing checkpoint
    Cache,
    /// Computed during this run
    Generated,
}

/// A resolved stage value plus its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult<T> {
    pub value: T,
    pub source: StageSource,
}

type CheckResult = std::result::Result<(), String>;
type Generator =
    Box<dyn Fn(StageInputs) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;
type Validator = Box<dyn Fn(&serde_json::Value, &StageInputs) -> CheckResult + Send + Sync>;
type Check<T> = Box<dyn Fn(&T, &StageInputs) -> CheckResult + Send + Sync>;

/// Stage values visible to a generator or a checkpoint validator.
///
/// A generator sees its declared dependencies. A validator sees every stage
/// resolved so far in the run.
pub struct StageInputs {
    stage: String,
    values: HashMap<String, serde_json::Value>,
    reporter: Arc<dyn ProgressReporter>,
}

impl StageInputs {
    /// Name of the stage being generated or validated.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Whether `stage` has a value here.
    pub fn contains(&self, stage: &str) -> bool {
        self.values.contains_key(stage)
    }

    /// Decode a dependency's value.
    pub fn get<T: DeserializeOwned>(&self, dependency: &str) -> Result<T> {
        let value = self.values.get(dependency).ok_or_else(|| StagerunError::MissingDependency {
            stage: self.stage.clone(),
            dependency: dependency.to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            StagerunError::Validation(format!(
                "dependency '{dependency}' of '{}' has unexpected shape: {e}",
                self.stage
            ))
        })
    }

    /// Reporter of the job running this chain.
    pub fn reporter(&self) -> &dyn ProgressReporter {
        self.reporter.as_ref()
    }
}

/// Definition of one stage with value type `T`.
pub struct Stage<T> {
    name: String,
    dependencies: Vec<String>,
    schema_version: u32,
    generate: Generator,
    check: Option<Check<T>>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Stage<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// A stage named `name` computed by `generate`.
    pub fn new<F, Fut>(name: impl Into<String>, generate: F) -> Self
    where
        F: Fn(StageInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let name = name.into();
        let stage_name = name.clone();
        let generate: Generator = Box::new(move |inputs| {
            let pending = generate(inputs);
            let stage_name = stage_name.clone();
            async move {
                let value = pending.await?;
                serde_json::to_value(value).map_err(|e| {
                    StagerunError::Internal(format!("Serializing stage {stage_name}: {e}"))
                })
            }
            .boxed()
        });

        Self {
            name,
            dependencies: Vec::new(),
            schema_version: 1,
            generate,
            check: None,
            _value: PhantomData,
        }
    }

    /// Stages whose values this stage's generator receives, in order.
    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Payload schema version. Checkpoints with another version are regenerated.
    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Extra check a decoded checkpoint must pass to be trusted.
    pub fn validate<F>(mut self, check: F) -> Self
    where
        F: Fn(&T) -> CheckResult + Send + Sync + 'static,
    {
        self.check = Some(Box::new(move |value: &T, _: &StageInputs| check(value)));
        self
    }

    /// Like [`Stage::validate`], but the check also sees the values of stages
    /// already resolved in this run, so a checkpoint that disagrees with them
    /// can be rejected. Stages not resolved yet are absent from `resolved`.
    pub fn validate_with<F>(mut self, check: F) -> Self
    where
        F: Fn(&T, &StageInputs) -> CheckResult + Send + Sync + 'static,
    {
        self.check = Some(Box::new(check));
        self
    }

    fn into_def(self) -> StageDef {
        let check = self.check;
        let validate: Validator = Box::new(move |raw: &serde_json::Value, resolved: &StageInputs| {
            let decoded: T = serde_json::from_value(raw.clone())
                .map_err(|e| format!("value does not match schema: {e}"))?;
            match &check {
                Some(check) => check(&decoded, resolved),
                None => Ok(()),
            }
        });

        StageDef {
            dependencies: self.dependencies,
            schema_version: self.schema_version,
            generate: self.generate,
            validate,
        }
    }
}

struct StageDef {
    dependencies: Vec<String>,
    schema_version: u32,
    generate: Generator,
    validate: Validator,
}

/// Builder for a [`StageChain`].
pub struct StageChainBuilder {
    root: PathBuf,
    order: Vec<String>,
    stages: HashMap<String, StageDef>,
    duplicate: Option<String>,
}

impl StageChainBuilder {
    /// Add a stage.
    pub fn stage<T>(mut self, stage: Stage<T>) -> Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let name = stage.name.clone();
        if self.stages.contains_key(&name) {
            self.duplicate.get_or_insert(name);
            return self;
        }
        self.order.push(name.clone());
        self.stages.insert(name, stage.into_def());
        self
    }

    /// Validate the graph and bind it to a job's reporter.
    pub fn build(self, reporter: Arc<dyn ProgressReporter>) -> Result<StageChain> {
        if let Some(name) = self.duplicate {
            return Err(StagerunError::DuplicateStage(name));
        }

        for name in &self.order {
            for dependency in &self.stages[name].dependencies {
                if !self.stages.contains_key(dependency) {
                    return Err(StagerunError::MissingDependency {
                        stage: name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        check_acyclic(&self.order, &self.stages)?;

        Ok(StageChain {
            store: CheckpointStore::new(self.root),
            order: self.order,
            stages: self.stages,
            memo: HashMap::new(),
            reporter,
        })
    }
}

/// Kahn's algorithm; any stage left unsorted sits on a cycle.
fn check_acyclic(order: &[String], stages: &HashMap<String, StageDef>) -> Result<()> {
    let mut pending: HashMap<&str, usize> = order
        .iter()
        .map(|name| (name.as_str(), stages[name].dependencies.len()))
        .collect();
    let mut ready: VecDeque<&str> = order
        .iter()
        .map(String::as_str)
        .filter(|name| pending[name] == 0)
        .collect();
    let mut sorted = HashSet::new();

    while let Some(name) = ready.pop_front() {
        sorted.insert(name);
        for (other, def) in stages {
            let uses = def.dependencies.iter().filter(|d| d.as_str() == name).count();
            if uses == 0 {
                continue;
            }
            if let Some(count) = pending.get_mut(other.as_str()) {
                *count -= uses;
                if *count == 0 {
                    ready.push_back(other.as_str());
                }
            }
        }
    }

    match order.iter().find(|name| !sorted.contains(name.as_str())) {
        Some(name) => Err(StagerunError::StageCycle(name.clone())),
        None => Ok(()),
    }
}

enum Visit {
    Enter(String),
    Generate(String),
}

/// A fixed stage graph bound to one job and one checkpoint directory.
pub struct StageChain {
    store: CheckpointStore,
    order: Vec<String>,
    stages: HashMap<String, StageDef>,
    memo: HashMap<String, StageResult<serde_json::Value>>,
    reporter: Arc<dyn ProgressReporter>,
}

impl StageChain {
    /// Start a chain whose checkpoints live in `root`.
    pub fn builder(root: impl Into<PathBuf>) -> StageChainBuilder {
        StageChainBuilder {
            root: root.into(),
            order: Vec::new(),
            stages: HashMap::new(),
            duplicate: None,
        }
    }

    /// Checkpoint store backing this chain.
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Stage names in declaration order.
    pub fn stage_names(&self) -> &[String] {
        &self.order
    }

    /// Drop a stage from this run's memo. Its checkpoint is left alone.
    pub fn forget(&mut self, name: &str) -> bool {
        self.memo.remove(name).is_some()
    }

    /// Resolve a stage and decode it as `T`.
    pub async fn ensure<T: DeserializeOwned>(&mut self, name: &str) -> Result<StageResult<T>> {
        let resolved = self.ensure_stage(name).await?;
        let value = serde_json::from_value(resolved.value).map_err(|e| {
            StagerunError::Validation(format!("stage '{name}' has unexpected shape: {e}"))
        })?;
        Ok(StageResult {
            value,
            source: resolved.source,
        })
    }

    /// Resolve a stage: memo, then checkpoint, then generation.
    pub async fn ensure_stage(&mut self, name: &str) -> Result<StageResult<serde_json::Value>> {
        if !self.stages.contains_key(name) {
            return Err(StagerunError::UnknownStage(name.to_string()));
        }

        let mut stack = vec![Visit::Enter(name.to_string())];
        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(stage) => {
                    if self.memo.contains_key(&stage) {
                        continue;
                    }
                    if let Some(value) = self.load_checkpoint(&stage).await {
                        self.memo.insert(
                            stage,
                            StageResult {
                                value,
                                source: StageSource::Cache,
                            },
                        );
                        continue;
                    }

                    let dependencies = self.stages[&stage].dependencies.clone();
                    stack.push(Visit::Generate(stage));
                    for dependency in dependencies.into_iter().rev() {
                        stack.push(Visit::Enter(dependency));
                    }
                }
                Visit::Generate(stage) => {
                    if self.memo.contains_key(&stage) {
                        continue;
                    }
                    let value = self.generate(&stage).await?;
                    self.memo.insert(
                        stage,
                        StageResult {
                            value,
                            source: StageSource::Generated,
                        },
                    );
                }
            }
        }

        self.memo
            .get(name)
            .cloned()
            .ok_or_else(|| StagerunError::Internal(format!("Stage {name} did not resolve")))
    }

    async fn load_checkpoint(&self, stage: &str) -> Option<serde_json::Value> {
        let def = &self.stages[stage];
        let reason = match self.store.read_raw(stage, def.schema_version).await {
            CheckpointRead::Missing => return None,
            CheckpointRead::Invalid(reason) => reason,
            CheckpointRead::Valid(value) => match (def.validate)(&value, &self.resolved(stage)) {
                Ok(()) => {
                    debug!(job = self.reporter.job_id(), stage, "Checkpoint hit");
                    return Some(value);
                }
                Err(reason) => reason,
            },
        };

        debug!(job = self.reporter.job_id(), stage, reason = %reason, "Ignoring checkpoint");
        self.reporter
            .log(&format!("{stage}: ignoring checkpoint ({reason}), regenerating"));
        None
    }

    /// Every stage value memoized so far.
    fn resolved(&self, stage: &str) -> StageInputs {
        StageInputs {
            stage: stage.to_string(),
            values: self
                .memo
                .iter()
                .map(|(name, resolved)| (name.clone(), resolved.value.clone()))
                .collect(),
            reporter: Arc::clone(&self.reporter),
        }
    }

    async fn generate(&self, stage: &str) -> Result<serde_json::Value> {
        let def = &self.stages[stage];

        let mut values = HashMap::with_capacity(def.dependencies.len());
        for dependency in &def.dependencies {
            let resolved = self.memo.get(dependency).ok_or_else(|| {
                StagerunError::Internal(format!("{dependency} unresolved before {stage}"))
            })?;
            values.insert(dependency.clone(), resolved.value.clone());
        }
        let inputs = StageInputs {
            stage: stage.to_string(),
            values,
            reporter: Arc::clone(&self.reporter),
        };

        let handle = self.reporter.start_stage(stage);
        let outcome = (def.generate)(inputs).await;
        self.reporter.finish_stage(handle);
        let value = outcome?;

        self.store.write(stage, def.schema_version, &value).await?;
        self.reporter.log(&format!("{stage}: generated"));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FinishedCall, ModelCallHandle, ModelCallRequest, UsageChunk};
    use crate::progress::{NoopReporter, StageHandle};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Prose {
        text: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Segmentation {
        segments: Vec<String>,
        count: usize,
    }

    fn reporter() -> Arc<dyn ProgressReporter> {
        Arc::new(NoopReporter::new("job"))
    }

    /// Keeps every logged line.
    struct LogCapture {
        inner: NoopReporter,
        lines: Mutex<Vec<String>>,
    }

    impl ProgressReporter for LogCapture {
        fn job_id(&self) -> &str {
            self.inner.job_id()
        }

        fn log(&self, message: &str) {
            self.lines.lock().push(message.to_string());
        }

        fn start_stage(&self, name: &str) -> StageHandle {
            self.inner.start_stage(name)
        }

        fn finish_stage(&self, handle: StageHandle) {
            self.inner.finish_stage(handle)
        }

        fn set_active_stages(&self, names: Option<&[String]>) {
            self.inner.set_active_stages(names)
        }

        fn start_model_call(&self, request: ModelCallRequest) -> ModelCallHandle {
            self.inner.start_model_call(request)
        }

        fn record_model_usage(&self, handle: ModelCallHandle, chunk: &UsageChunk) {
            self.inner.record_model_usage(handle, chunk)
        }

        fn finish_model_call(&self, handle: ModelCallHandle) -> Option<FinishedCall> {
            self.inner.finish_model_call(handle)
        }

        fn report_chars(&self, n: u64) {
            self.inner.report_chars(n)
        }
    }

    /// prose -> segmentation, counting generator invocations.
    fn story_chain(
        root: &std::path::Path,
        prose_runs: Arc<AtomicUsize>,
        seg_runs: Arc<AtomicUsize>,
    ) -> StageChain {
        StageChain::builder(root)
            .stage(Stage::new("prose", move |_inputs| {
                let prose_runs = Arc::clone(&prose_runs);
                async move {
                    prose_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(Prose {
                        text: "generated prose".to_string(),
                    })
                }
            }))
            .stage(
                Stage::new("segmentation", move |inputs: StageInputs| {
                    let seg_runs = Arc::clone(&seg_runs);
                    async move {
                        seg_runs.fetch_add(1, Ordering::SeqCst);
                        let prose: Prose = inputs.get("prose")?;
                        let segments: Vec<String> =
                            prose.text.split_whitespace().map(str::to_string).collect();
                        Ok::<_, StagerunError>(Segmentation {
                            count: segments.len(),
                            segments,
                        })
                    }
                })
                .depends_on(&["prose"])
                .validate(|seg: &Segmentation| {
                    if seg.count == seg.segments.len() {
                        Ok(())
                    } else {
                        Err(format!("count {} but {} segments", seg.count, seg.segments.len()))
                    }
                }),
            )
            .build(reporter())
            .unwrap()
    }

    #[tokio::test]
    async fn test_generated_then_cached_across_runs() {
        let temp_dir = TempDir::new().unwrap();
        let prose_runs = Arc::new(AtomicUsize::new(0));
        let seg_runs = Arc::new(AtomicUsize::new(0));

        let mut first =
            story_chain(temp_dir.path(), Arc::clone(&prose_runs), Arc::clone(&seg_runs));
        let generated = first.ensure::<Segmentation>("segmentation").await.unwrap();
        assert_eq!(generated.source, StageSource::Generated);
        assert_eq!(generated.value.count, 2);

        let mut second =
            story_chain(temp_dir.path(), Arc::clone(&prose_runs), Arc::clone(&seg_runs));
        let cached = second.ensure::<Segmentation>("segmentation").await.unwrap();
        assert_eq!(cached.source, StageSource::Cache);
        assert_eq!(cached.value, generated.value);

        assert_eq!(prose_runs.load(Ordering::SeqCst), 1);
        assert_eq!(seg_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_dependency_feeds_missing_stage() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        store
            .write("prose", 1, &Prose { text: "hello".to_string() })
            .await
            .unwrap();

        let prose_runs = Arc::new(AtomicUsize::new(0));
        let seg_runs = Arc::new(AtomicUsize::new(0));
        let mut chain =
            story_chain(temp_dir.path(), Arc::clone(&prose_runs), Arc::clone(&seg_runs));

        let seg = chain.ensure::<Segmentation>("segmentation").await.unwrap();
        assert_eq!(seg.source, StageSource::Generated);
        assert_eq!(seg.value.segments, vec!["hello".to_string()]);
        assert_eq!(prose_runs.load(Ordering::SeqCst), 0);

        let prose = chain.ensure::<Prose>("prose").await.unwrap();
        assert_eq!(prose.source, StageSource::Cache);
        assert!(temp_dir.path().join("segmentation.json").exists());
    }

    #[tokio::test]
    async fn test_valid_checkpoint_skips_dependencies() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        store
            .write(
                "segmentation",
                1,
                &Segmentation {
                    segments: vec!["a".to_string()],
                    count: 1,
                },
            )
            .await
            .unwrap();

        let prose_runs = Arc::new(AtomicUsize::new(0));
        let seg_runs = Arc::new(AtomicUsize::new(0));
        let mut chain =
            story_chain(temp_dir.path(), Arc::clone(&prose_runs), Arc::clone(&seg_runs));

        let seg = chain.ensure_stage("segmentation").await.unwrap();
        assert_eq!(seg.source, StageSource::Cache);
        assert_eq!(prose_runs.load(Ordering::SeqCst), 0);
        assert!(!temp_dir.path().join("prose.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_regenerated_and_overwritten() {
        let temp_dir = TempDir::new().unwrap();
        let truncated = "{\"stage\": \"prose\", trunc";
        std::fs::write(temp_dir.path().join("prose.json"), truncated).unwrap();

        let prose_runs = Arc::new(AtomicUsize::new(0));
        let seg_runs = Arc::new(AtomicUsize::new(0));
        let mut chain = story_chain(temp_dir.path(), Arc::clone(&prose_runs), seg_runs);

        let prose = chain.ensure::<Prose>("prose").await.unwrap();
        assert_eq!(prose.source, StageSource::Generated);
        assert_eq!(prose_runs.load(Ordering::SeqCst), 1);

        let reread: CheckpointRead<Prose> = chain.store().read("prose", 1).await;
        assert_eq!(reread.valid(), Some(prose.value));
    }

    #[tokio::test]
    async fn test_validator_rejection_triggers_regeneration() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        store
            .write(
                "segmentation",
                1,
                &Segmentation {
                    segments: vec!["a".to_string(), "b".to_string()],
                    count: 7,
                },
            )
            .await
            .unwrap();

        let prose_runs = Arc::new(AtomicUsize::new(0));
        let seg_runs = Arc::new(AtomicUsize::new(0));
        let mut chain =
            story_chain(temp_dir.path(), Arc::clone(&prose_runs), Arc::clone(&seg_runs));

        let seg = chain.ensure::<Segmentation>("segmentation").await.unwrap();
        assert_eq!(seg.source, StageSource::Generated);
        assert_eq!(seg.value.count, 2);
        assert_eq!(seg_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ignored_checkpoint_reported_through_reporter() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("prose.json"), "not json").unwrap();
        let capture = Arc::new(LogCapture {
            inner: NoopReporter::new("job"),
            lines: Mutex::new(Vec::new()),
        });

        let mut chain = StageChain::builder(temp_dir.path())
            .stage(Stage::new("prose", |_| async {
                Ok(Prose {
                    text: "fresh".to_string(),
                })
            }))
            .build(capture.clone())
            .unwrap();
        chain.ensure_stage("prose").await.unwrap();

        let lines = capture.lines.lock();
        let ignored: Vec<&String> = lines
            .iter()
            .filter(|l| l.starts_with("prose: ignoring checkpoint"))
            .collect();
        assert_eq!(ignored.len(), 1, "{lines:?}");
        assert!(lines.contains(&"prose: generated".to_string()));
    }

    #[tokio::test]
    async fn test_checkpoint_disagreeing_with_resolved_stage_is_regenerated() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        // Internally consistent, but written for different prose
        store
            .write(
                "segmentation",
                1,
                &Segmentation {
                    segments: vec!["stale".to_string()],
                    count: 1,
                },
            )
            .await
            .unwrap();

        let seg_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seg_runs);
        let mut chain = StageChain::builder(temp_dir.path())
            .stage(Stage::new("prose", |_| async {
                Ok(Prose {
                    text: "three fresh words".to_string(),
                })
            }))
            .stage(
                Stage::new("segmentation", move |inputs: StageInputs| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let prose: Prose = inputs.get("prose")?;
                        let segments: Vec<String> =
                            prose.text.split_whitespace().map(str::to_string).collect();
                        Ok::<_, StagerunError>(Segmentation {
                            count: segments.len(),
                            segments,
                        })
                    }
                })
                .depends_on(&["prose"])
                .validate_with(|seg: &Segmentation, resolved: &StageInputs| {
                    if !resolved.contains("prose") {
                        return Ok(());
                    }
                    let prose: Prose = resolved.get("prose").map_err(|e| e.to_string())?;
                    let words = prose.text.split_whitespace().count();
                    if seg.count == words {
                        Ok(())
                    } else {
                        Err(format!("{} segments for {words} words", seg.count))
                    }
                }),
            )
            .build(reporter())
            .unwrap();

        let prose = chain.ensure::<Prose>("prose").await.unwrap();
        assert_eq!(prose.source, StageSource::Generated);

        let seg = chain.ensure::<Segmentation>("segmentation").await.unwrap();
        assert_eq!(seg.source, StageSource::Generated);
        assert_eq!(seg.value.count, 3);
        assert_eq!(seg_runs.load(Ordering::SeqCst), 1);

        // Once prose is memoized, the rewritten checkpoint is accepted
        assert!(chain.forget("segmentation"));
        let again = chain.ensure::<Segmentation>("segmentation").await.unwrap();
        assert_eq!(again.source, StageSource::Cache);
        assert_eq!(seg_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schema_version_bump_regenerates() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        store.write("summary", 1, &json!("old")).await.unwrap();

        let mut chain = StageChain::builder(temp_dir.path())
            .stage(Stage::new("summary", |_| async { Ok("new".to_string()) }).schema_version(2))
            .build(reporter())
            .unwrap();

        let summary = chain.ensure::<String>("summary").await.unwrap();
        assert_eq!(summary.value, "new");
        assert_eq!(summary.source, StageSource::Generated);
    }

    #[tokio::test]
    async fn test_diamond_dependency_generated_once() {
        let temp_dir = TempDir::new().unwrap();
        let root_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&root_runs);

        let mut chain = StageChain::builder(temp_dir.path())
            .stage(Stage::new("root", move |_| {
                let counter = Arc::clone(&counter);
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) as u64 + 10) }
            }))
            .stage(
                Stage::new("left", |inputs: StageInputs| async move {
                    Ok::<_, StagerunError>(inputs.get::<u64>("root")? + 1)
                })
                .depends_on(&["root"]),
            )
            .stage(
                Stage::new("right", |inputs: StageInputs| async move {
                    Ok::<_, StagerunError>(inputs.get::<u64>("root")? * 2)
                })
                .depends_on(&["root"]),
            )
            .stage(
                Stage::new("join", |inputs: StageInputs| async move {
                    Ok::<_, StagerunError>(inputs.get::<u64>("left")? + inputs.get::<u64>("right")?)
                })
                .depends_on(&["left", "right"]),
            )
            .build(reporter())
            .unwrap();

        let joined = chain.ensure::<u64>("join").await.unwrap();
        assert_eq!(joined.value, 11 + 20);
        assert_eq!(root_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_memo_sees_fresh_value_after_forget_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let mut chain = StageChain::builder(temp_dir.path())
            .stage(Stage::new("tick", move |_| {
                let counter = Arc::clone(&counter);
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) }
            }))
            .build(reporter())
            .unwrap();

        assert_eq!(chain.ensure::<usize>("tick").await.unwrap().value, 0);
        assert_eq!(chain.ensure::<usize>("tick").await.unwrap().value, 0);

        assert!(chain.store().remove("tick").await.unwrap());
        assert!(chain.forget("tick"));
        assert_eq!(chain.ensure::<usize>("tick").await.unwrap().value, 1);
    }

    #[tokio::test]
    async fn test_generator_error_propagates_without_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let mut chain = StageChain::builder(temp_dir.path())
            .stage(Stage::new("broken", |_| async {
                Err::<String, _>(StagerunError::item("job", "model refused"))
            }))
            .build(reporter())
            .unwrap();

        let err = chain.ensure_stage("broken").await.unwrap_err();
        assert!(matches!(err, StagerunError::Item { .. }));
        assert!(!temp_dir.path().join("broken.json").exists());
    }

    #[tokio::test]
    async fn test_unknown_stage() {
        let temp_dir = TempDir::new().unwrap();
        let mut chain = StageChain::builder(temp_dir.path()).build(reporter()).unwrap();
        assert!(matches!(
            chain.ensure_stage("ghost").await,
            Err(StagerunError::UnknownStage(_))
        ));
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let result = StageChain::builder("unused")
            .stage(Stage::new("a", |_| async { Ok(1u8) }).depends_on(&["nope"]))
            .build(reporter());
        assert!(matches!(result, Err(StagerunError::MissingDependency { .. })));
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let result = StageChain::builder("unused")
            .stage(Stage::new("a", |_| async { Ok(1u8) }))
            .stage(Stage::new("a", |_| async { Ok(2u8) }))
            .build(reporter());
        assert!(matches!(result, Err(StagerunError::DuplicateStage(_))));
    }

    #[test]
    fn test_cycle_rejected() {
        let result = StageChain::builder("unused")
            .stage(Stage::new("a", |_| async { Ok(1u8) }).depends_on(&["c"]))
            .stage(Stage::new("b", |_| async { Ok(1u8) }).depends_on(&["a"]))
            .stage(Stage::new("c", |_| async { Ok(1u8) }).depends_on(&["b"]))
            .stage(Stage::new("free", |_| async { Ok(1u8) }))
            .build(reporter());
        assert!(matches!(result, Err(StagerunError::StageCycle(_))));
    }

    #[test]
    fn test_stage_names_keep_declaration_order() {
        let chain = StageChain::builder("unused")
            .stage(Stage::new("b", |_| async { Ok(1u8) }))
            .stage(Stage::new("a", |_| async { Ok(1u8) }).depends_on(&["b"]))
            .build(reporter())
            .unwrap();
        assert_eq!(chain.stage_names(), ["b".to_string(), "a".to_string()]);
    }
}
