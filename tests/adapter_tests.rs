//! Integration tests for the adapter's lifecycle and callback contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use llm_engine_adapter::api::{ChatApi, ChatMessage, ChatOptions, ModelConfig, UpdateCallback};
use llm_engine_adapter::catalog::{CatalogRecord, ModelCatalog, StaticCatalog};
use llm_engine_adapter::engine::{
    ChunkStream, Completion, EngineFactory, EngineHandle, EngineOptions, ProgressEvent,
    StreamChunk,
};
use llm_engine_adapter::error::{AdapterError, EngineError, EngineInitError};
use llm_engine_adapter::EngineAdapter;

/// One step of a scripted streamed reply.
#[derive(Clone)]
enum Step {
    Delta(&'static str),
    Fail,
}

/// What the scripted engine does for each call.
#[derive(Clone)]
struct Script {
    stream: Vec<Step>,
    once: Option<&'static str>,
    delay: Duration,
}

impl Script {
    fn deltas(deltas: &[&'static str]) -> Self {
        Self {
            stream: deltas.iter().copied().map(Step::Delta).collect(),
            once: None,
            delay: Duration::ZERO,
        }
    }

    fn once(content: Option<&'static str>) -> Self {
        Self {
            stream: Vec::new(),
            once: content,
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Factory that counts constructions and builds [`ScriptedEngine`]s.
struct ScriptedFactory {
    script: Script,
    constructions: AtomicUsize,
    journal: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFactory {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            constructions: AtomicUsize::new(0),
            journal: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineFactory for ScriptedFactory {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn construct(
        &self,
        model_id: &str,
        mut options: EngineOptions<'_>,
    ) -> Result<Arc<dyn EngineHandle>, EngineInitError> {
        if model_id == "broken" {
            return Err(EngineInitError::UnsupportedModel(model_id.to_string()));
        }
        self.constructions.fetch_add(1, Ordering::SeqCst);
        options.report(&ProgressEvent::new(format!("Loading {model_id}"), 1.0, 0.0));

        Ok(Arc::new(ScriptedEngine {
            model_id: model_id.to_string(),
            script: self.script.clone(),
            journal: self.journal.clone(),
        }))
    }
}

struct ScriptedEngine {
    model_id: String,
    script: Script,
    journal: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EngineHandle for ScriptedEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete_streaming(
        &self,
        _messages: &[ChatMessage],
    ) -> Result<ChunkStream, EngineError> {
        let delay = self.script.delay;
        let steps = self.script.stream.clone();
        let stream = futures::stream::iter(steps).then(move |step| async move {
            tokio::time::sleep(delay).await;
            match step {
                Step::Delta(d) => Ok(StreamChunk::text(d)),
                Step::Fail => Err(EngineError::Transport("connection reset".into())),
            }
        });
        Ok(Box::pin(stream))
    }

    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<Completion, EngineError> {
        let tag = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        self.journal.lock().unwrap().push(format!("start:{tag}"));
        tokio::time::sleep(self.script.delay).await;
        self.journal.lock().unwrap().push(format!("end:{tag}"));

        Ok(Completion {
            content: self.script.once.map(str::to_string),
            finish_reason: Some("stop".into()),
        })
    }
}

/// Callback events observed for one chat call.
#[derive(Debug, Clone, PartialEq)]
enum Event {
    Update(String, String),
    Finish(String),
    Error(String),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    fn options(&self, config: ModelConfig, prompt: &str) -> ChatOptions {
        let (finish, update, error) = (self.clone(), self.clone(), self.clone());
        ChatOptions::new(config, vec![ChatMessage::user(prompt)], move |reply| {
            finish.push(Event::Finish(reply));
        })
        .on_update(move |partial, delta| update.push(Event::Update(partial.into(), delta.into())))
        .on_error(move |e| error.push(Event::Error(e.to_string())))
    }

    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    fn terminal(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, Event::Update(..)))
            .collect()
    }
}

fn catalog() -> Arc<dyn ModelCatalog> {
    Arc::new(StaticCatalog::new(vec![
        CatalogRecord::new("A", 10.0, true),
        CatalogRecord::new("B", 20.0, false),
    ]))
}

fn adapter(factory: &Arc<ScriptedFactory>) -> EngineAdapter {
    EngineAdapter::new(factory.clone(), catalog())
}

fn streaming(model: &str) -> ModelConfig {
    ModelConfig::for_model(model).with_stream(true)
}

#[tokio::test]
async fn test_same_model_constructs_once() {
    let factory = ScriptedFactory::new(Script::deltas(&["ok"]));
    let adapter = adapter(&factory);

    for _ in 0..2 {
        let recorder = Recorder::default();
        adapter.chat(recorder.options(streaming("A"), "hi")).await.unwrap();
        assert_eq!(recorder.terminal(), vec![Event::Finish("ok".into())]);
    }

    assert_eq!(factory.constructions(), 1);
    assert_eq!(adapter.current_model().as_deref(), Some("A"));
}

#[tokio::test]
async fn test_model_switch_rebuilds_engine() {
    let factory = ScriptedFactory::new(Script::deltas(&["ok"]));
    let adapter = adapter(&factory);

    let recorder = Recorder::default();
    adapter.chat(recorder.options(streaming("A"), "hi")).await.unwrap();
    adapter.chat(recorder.options(streaming("B"), "hi")).await.unwrap();

    assert_eq!(factory.constructions(), 2);
    assert_eq!(adapter.current_model().as_deref(), Some("B"));
}

#[tokio::test]
async fn test_stream_updates_accumulate() {
    let factory = ScriptedFactory::new(Script::deltas(&["He", "llo"]));
    let adapter = adapter(&factory);
    adapter.init_model(&streaming("A"), None).await.unwrap();

    let recorder = Recorder::default();
    adapter.chat(recorder.options(streaming("A"), "hi")).await.unwrap();

    assert_eq!(
        recorder.events(),
        vec![
            Event::Update("He".into(), "He".into()),
            Event::Update("Hello".into(), "llo".into()),
            Event::Finish("Hello".into()),
        ]
    );
}

#[tokio::test]
async fn test_empty_deltas_are_skipped() {
    let factory = ScriptedFactory::new(Script::deltas(&["", "a", "", "b"]));
    let adapter = adapter(&factory);
    adapter.init_model(&streaming("A"), None).await.unwrap();

    let recorder = Recorder::default();
    adapter.chat(recorder.options(streaming("A"), "hi")).await.unwrap();

    assert_eq!(
        recorder.events(),
        vec![
            Event::Update("a".into(), "a".into()),
            Event::Update("ab".into(), "b".into()),
            Event::Finish("ab".into()),
        ]
    );
}

#[tokio::test]
async fn test_init_progress_reaches_on_update() {
    let factory = ScriptedFactory::new(Script::deltas(&["x"]));
    let adapter = adapter(&factory);

    let recorder = Recorder::default();
    adapter.chat(recorder.options(streaming("A"), "hi")).await.unwrap();

    let events = recorder.events();
    assert_eq!(
        events[0],
        Event::Update("Loading A".into(), "Loading A".into())
    );
    assert_eq!(events.last(), Some(&Event::Finish("x".into())));
}

#[tokio::test]
async fn test_null_content_reports_empty_response() {
    let factory = ScriptedFactory::new(Script::once(None));
    let adapter = adapter(&factory);

    let recorder = Recorder::default();
    let config = ModelConfig::for_model("A").with_stream(false);
    adapter.chat(recorder.options(config, "hi")).await.unwrap();

    assert_eq!(
        recorder.terminal(),
        vec![Event::Error("Empty response generated by LLM".into())]
    );
}

#[tokio::test]
async fn test_empty_stream_reports_empty_response() {
    let factory = ScriptedFactory::new(Script::deltas(&[]));
    let adapter = adapter(&factory);

    let recorder = Recorder::default();
    adapter.chat(recorder.options(streaming("A"), "hi")).await.unwrap();

    assert_eq!(
        recorder.terminal(),
        vec![Event::Error("Empty response generated by LLM".into())]
    );
}

#[tokio::test]
async fn test_empty_response_without_on_error_is_silent() {
    let factory = ScriptedFactory::new(Script::once(None));
    let adapter = adapter(&factory);

    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    let options = ChatOptions::new(
        ModelConfig::for_model("A").with_stream(false),
        vec![ChatMessage::user("hi")],
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );

    adapter.chat(options).await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_non_stream_reply_finishes() {
    let factory = ScriptedFactory::new(Script::once(Some("Hello there")));
    let adapter = adapter(&factory);

    let recorder = Recorder::default();
    let config = ModelConfig::for_model("A").with_stream(false);
    adapter.chat(recorder.options(config, "hi")).await.unwrap();

    // Init progress is the only update in one-shot mode.
    assert_eq!(recorder.terminal(), vec![Event::Finish("Hello there".into())]);
    assert_eq!(
        recorder.events().len(),
        2,
        "one progress update plus the finish"
    );
}

#[tokio::test]
async fn test_mid_stream_error_returns_err() {
    let factory = ScriptedFactory::new(Script {
        stream: vec![Step::Delta("par"), Step::Fail, Step::Delta("never")],
        once: None,
        delay: Duration::ZERO,
    });
    let adapter = adapter(&factory);
    adapter.init_model(&streaming("A"), None).await.unwrap();

    let recorder = Recorder::default();
    let err = adapter
        .chat(recorder.options(streaming("A"), "hi"))
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::Engine(EngineError::Transport(_))));
    assert_eq!(
        recorder.events(),
        vec![Event::Update("par".into(), "par".into())]
    );
}

#[tokio::test]
async fn test_init_failure_returns_err_and_clears_state() {
    let factory = ScriptedFactory::new(Script::deltas(&["ok"]));
    let adapter = adapter(&factory);
    adapter.init_model(&streaming("A"), None).await.unwrap();

    let recorder = Recorder::default();
    let err = adapter
        .chat(recorder.options(streaming("broken"), "hi"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AdapterError::EngineInit(EngineInitError::UnsupportedModel(_))
    ));
    assert!(recorder.terminal().is_empty());
    assert_eq!(adapter.current_model(), None);
    assert!(!adapter.is_loaded());
}

#[tokio::test]
async fn test_clear_forces_reinit() {
    let factory = ScriptedFactory::new(Script::deltas(&["ok"]));
    let adapter = adapter(&factory);

    let recorder = Recorder::default();
    adapter.chat(recorder.options(streaming("A"), "hi")).await.unwrap();
    adapter.clear();
    assert_eq!(adapter.current_model(), None);

    adapter.chat(recorder.options(streaming("A"), "hi")).await.unwrap();
    assert_eq!(factory.constructions(), 2);
}

#[tokio::test]
async fn test_concurrent_chats_are_serialized() {
    let factory = ScriptedFactory::new(
        Script::once(Some("done")).with_delay(Duration::from_millis(20)),
    );
    let adapter = adapter(&factory);

    let config = ModelConfig::for_model("A").with_stream(false);
    let first = Recorder::default();
    let second = Recorder::default();

    let (a, b) = tokio::join!(
        adapter.chat(first.options(config.clone(), "one")),
        adapter.chat(second.options(config.clone(), "two")),
    );
    a.unwrap();
    b.unwrap();

    let journal = factory.journal();
    assert_eq!(journal.len(), 4);
    // Each call ends before the next begins.
    for pair in journal.chunks(2) {
        let tag = pair[0].strip_prefix("start:").unwrap();
        assert_eq!(pair[1], format!("end:{tag}"));
    }
    assert_eq!(factory.constructions(), 1);
}

#[tokio::test]
async fn test_clear_during_chat_lets_it_finish() {
    let factory = ScriptedFactory::new(
        Script::deltas(&["a", "b", "c"]).with_delay(Duration::from_millis(30)),
    );
    let adapter = Arc::new(adapter(&factory));
    adapter.init_model(&streaming("A"), None).await.unwrap();

    let recorder = Recorder::default();
    let task = {
        let adapter = adapter.clone();
        let options = recorder.options(streaming("A"), "hi");
        tokio::spawn(async move { adapter.chat(options).await })
    };

    tokio::time::sleep(Duration::from_millis(40)).await;
    adapter.clear();

    task.await.unwrap().unwrap();
    assert_eq!(recorder.terminal(), vec![Event::Finish("abc".into())]);
    assert_eq!(adapter.current_model(), None);
}

#[tokio::test]
async fn test_usage_and_models() {
    let factory = ScriptedFactory::new(Script::deltas(&[]));
    let adapter = adapter(&factory);

    let usage = adapter.usage();
    assert_eq!((usage.used, usage.total), (0, 0));

    let models = adapter.models();
    let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);
    assert!(models.iter().all(|m| m.available));
    assert!(models.iter().all(|m| m.provider.id == "huggingface"));
}

#[tokio::test]
async fn test_chat_api_trait_object() {
    let factory = ScriptedFactory::new(Script::deltas(&["He", "llo"]));
    let api: Arc<dyn ChatApi> = Arc::new(adapter(&factory));

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let mut progress: UpdateCallback = Box::new(move |partial: &str, delta: &str| {
        sink.lock()
            .unwrap()
            .push((partial.to_string(), delta.to_string()));
    });
    api.init_model(&streaming("A"), Some(&mut progress)).await.unwrap();
    assert_eq!(
        *lines.lock().unwrap(),
        vec![("Loading A".to_string(), "Loading A".to_string())]
    );

    // Same model: no rebuild, deltas accumulate.
    let recorder = Recorder::default();
    api.chat(recorder.options(streaming("A"), "hi")).await.unwrap();
    assert_eq!(
        recorder.events(),
        vec![
            Event::Update("He".into(), "He".into()),
            Event::Update("Hello".into(), "llo".into()),
            Event::Finish("Hello".into()),
        ]
    );
    assert_eq!(factory.constructions(), 1);

    // Model switch rebuilds.
    api.chat(Recorder::default().options(streaming("B"), "hi")).await.unwrap();
    assert_eq!(factory.constructions(), 2);

    // Null one-shot content goes to on_error only.
    let recorder = Recorder::default();
    let config = ModelConfig::for_model("B").with_stream(false);
    api.chat(recorder.options(config, "hi")).await.unwrap();
    assert_eq!(
        recorder.terminal(),
        vec![Event::Error("Empty response generated by LLM".into())]
    );
    assert_eq!(factory.constructions(), 2);

    // Clear forces a rebuild even for the same model.
    api.clear();
    api.chat(Recorder::default().options(streaming("B"), "hi")).await.unwrap();
    assert_eq!(factory.constructions(), 3);

    let usage = api.usage().await;
    assert_eq!((usage.used, usage.total), (0, 0));
    assert_eq!(api.models().await.len(), 2);
}

#[tokio::test]
async fn test_chat_api_calls_are_serialized() {
    let factory = ScriptedFactory::new(
        Script::once(Some("done")).with_delay(Duration::from_millis(20)),
    );
    let api: Arc<dyn ChatApi> = Arc::new(adapter(&factory));
    let config = ModelConfig::for_model("A").with_stream(false);

    let tasks: Vec<_> = ["one", "two", "three"]
        .into_iter()
        .map(|tag| {
            let api = api.clone();
            let options = Recorder::default().options(config.clone(), tag);
            tokio::spawn(async move { api.chat(options).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let journal = factory.journal();
    assert_eq!(journal.len(), 6);
    for pair in journal.chunks(2) {
        let tag = pair[0].strip_prefix("start:").unwrap();
        assert_eq!(pair[1], format!("end:{tag}"));
    }
    assert_eq!(factory.constructions(), 1);
}
