#[cfg(test)]
mod tests {
    use crate::native::{NativeEngine, SessionParams, SessionState};
    use crate::testing::{write_gguf, write_graph_model, Script, ScriptEnd, ScriptedBackend, ScriptedGraphBackend};
    use crate::{
        AccelerationType, FixedAcceleration, FrameStream, GgufRuntime, GraphRuntime, ModelManager,
        Runtime, RuntimeExt,
    };
    use futures::StreamExt;
    use halo_common::{
        Error, GenerationParams, LoadOptions, ModelDescriptor, ModelFormat, Role, StopReason,
        StreamFrame, Usage,
    };
    use halo_config::TemplateRegistry;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Collected {
        text: String,
        deltas: usize,
        finish: Option<StopReason>,
        usage: Option<Usage>,
        error: Option<Error>,
    }

    async fn collect(mut stream: FrameStream) -> Collected {
        let mut out = Collected::default();
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(StreamFrame::Delta { content }) => {
                    assert!(!content.is_empty(), "empty delta frame");
                    assert!(out.finish.is_none(), "delta after done");
                    out.text.push_str(&content);
                    out.deltas += 1;
                }
                Ok(StreamFrame::Done { finish_reason, usage }) => {
                    out.finish = Some(finish_reason);
                    out.usage = Some(usage);
                }
                Err(e) => out.error = Some(e),
            }
        }
        out
    }

    struct NativeFixture {
        dir: TempDir,
        backend: Arc<ScriptedBackend>,
        engine: Arc<NativeEngine>,
        runtime: Arc<GgufRuntime>,
    }

    impl NativeFixture {
        fn new(script: Script) -> Self {
            let backend = ScriptedBackend::new(script);
            let engine = Arc::new(NativeEngine::new(backend.clone()));
            let runtime = Arc::new(GgufRuntime::new(
                engine.clone(),
                Arc::new(FixedAcceleration::default()),
            ));
            Self {
                dir: tempfile::tempdir().unwrap(),
                backend,
                engine,
                runtime,
            }
        }

        fn model(&self, name: &str) -> ModelDescriptor {
            let path = write_gguf(self.dir.path(), name, "llama", 8192).unwrap();
            ModelDescriptor::from_local_file(path)
        }

        async fn loaded(script: Script) -> Self {
            let fixture = Self::new(script);
            let model = fixture.model("model.gguf");
            fixture
                .runtime
                .initialize_model(&model, LoadOptions::default())
                .await
                .unwrap();
            fixture
        }
    }

    fn graph_fixture(backend: ScriptedGraphBackend) -> (TempDir, Arc<ScriptedGraphBackend>, Arc<GraphRuntime>, ModelDescriptor) {
        let dir = tempfile::tempdir().unwrap();
        let path = write_graph_model(dir.path(), "model.onnx", &[("a", 0), ("ab", 1), ("<|end|>", 2)]).unwrap();
        let backend = Arc::new(backend);
        let runtime = Arc::new(GraphRuntime::new(
            backend.clone(),
            Arc::new(FixedAcceleration(AccelerationType::GpuCompute)),
            TemplateRegistry::load_defaults().unwrap(),
        ));
        (dir, backend, runtime, ModelDescriptor::from_local_file(path))
    }

    #[tokio::test]
    async fn test_native_end_to_end() {
        let fixture = NativeFixture::new(Script::default());
        let model = fixture.model("model.gguf");
        let options = LoadOptions {
            threads: 4,
            context_length: 2048,
        };

        fixture.runtime.initialize_model(&model, options).await.unwrap();
        assert!(fixture.runtime.is_ready());

        let stream = fixture
            .runtime
            .generate_response("Hello", GenerationParams::new(32, 0.7))
            .await
            .unwrap();
        let collected = collect(stream).await;

        assert!(collected.error.is_none());
        assert_eq!(collected.text, "Hello, world!");
        assert_eq!(collected.finish, Some(StopReason::EndOfSequence));
        assert_eq!(collected.usage.unwrap().completion_tokens, 4);

        let log = fixture.backend.log();
        assert_eq!(
            log.loads[0].1,
            SessionParams {
                threads: 4,
                context_length: 2048
            }
        );
        assert_eq!(log.prompts, vec!["Hello".to_string()]);
        assert_eq!(log.temperatures, vec![0.7]);

        let metrics = fixture.runtime.performance_metrics();
        assert_eq!(metrics.accelerator.as_deref(), Some("cpu"));
        assert_eq!(
            fixture.engine.session_state(fixture.runtime.handle()),
            SessionState::Loaded
        );
    }

    #[tokio::test]
    async fn test_generate_without_model_fails_immediately() {
        let fixture = NativeFixture::new(Script::default());

        let result = fixture
            .runtime
            .generate_response("Hello", GenerationParams::default())
            .await;
        assert!(matches!(result.err(), Some(Error::RuntimeNotReady)));
        assert!(fixture.backend.log().prompts.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_params_are_rejected() {
        let fixture = NativeFixture::loaded(Script::default()).await;

        let result = fixture
            .runtime
            .generate_response("Hello", GenerationParams::new(0, 0.7))
            .await;
        assert!(matches!(result.err(), Some(Error::InvalidArgument(_))));

        let result = fixture
            .runtime
            .generate_response("Hello", GenerationParams::new(16, 3.5))
            .await;
        assert!(matches!(result.err(), Some(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_load_failures_leave_runtime_unloaded() {
        let fixture = NativeFixture::loaded(Script::default()).await;
        let previous = fixture.runtime.handle();

        let onnx = fixture.dir.path().join("model.onnx");
        std::fs::write(&onnx, b"graph").unwrap();
        let err = fixture
            .runtime
            .initialize_model(&ModelDescriptor::from_local_file(onnx), LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(!fixture.runtime.is_ready());
        assert_eq!(fixture.engine.session_state(previous), SessionState::Unloaded);

        let model = fixture.model("model.gguf");
        fixture
            .runtime
            .initialize_model(&model, LoadOptions::default())
            .await
            .unwrap();
        let missing = ModelDescriptor::from_local_file(fixture.dir.path().join("missing.gguf"));
        let err = fixture
            .runtime
            .initialize_model(&missing, LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound(_)));
        assert!(!fixture.runtime.is_ready());
        assert_eq!(fixture.engine.live_sessions(), 0);

        fixture
            .runtime
            .initialize_model(&model, LoadOptions::default())
            .await
            .unwrap();
        fixture.backend.set_script(Script::default().failing_load());
        let broken = fixture.model("broken.gguf");
        let err = fixture
            .runtime
            .initialize_model(&broken, LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));

        assert!(!fixture.runtime.is_ready());
        assert!(fixture.runtime.handle().is_null());
        assert!(fixture.runtime.model_path().is_none());
        assert_eq!(fixture.engine.live_sessions(), 0);
        assert_eq!(fixture.backend.log().frees, 3);
    }

    #[tokio::test]
    async fn test_release_while_loading_cancels_the_load() {
        let fixture = NativeFixture::new(Script::default().with_load_delay(Duration::from_millis(200)));
        let model = fixture.model("slow.gguf");

        let runtime = fixture.runtime.clone();
        let load = tokio::spawn(async move {
            runtime.initialize_model(&model, LoadOptions::default()).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        fixture.runtime.release().await;

        let result = load.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!fixture.runtime.is_ready());
        assert_eq!(fixture.engine.live_sessions(), 0);
        assert_eq!(fixture.backend.log().frees, 1);
    }

    #[tokio::test]
    async fn test_session_reports_loading_until_ready() {
        let backend = ScriptedBackend::new(Script::default().with_load_delay(Duration::from_millis(100)));
        let engine = Arc::new(NativeEngine::new(backend.clone()));
        let dir = tempfile::tempdir().unwrap();
        let path = write_gguf(dir.path(), "model.gguf", "llama", 4096).unwrap();

        let handle = engine.reserve_session();
        assert_eq!(engine.session_state(handle), SessionState::Loading);
        assert_eq!(engine.live_sessions(), 0);

        let loader = engine.clone();
        let load = tokio::task::spawn_blocking(move || loader.load_session(handle, &path, 4, 2048));
        assert_eq!(engine.session_state(handle), SessionState::Loading);
        load.await.unwrap().unwrap();
        assert_eq!(engine.session_state(handle), SessionState::Loaded);

        let second = engine.reserve_session();
        let loader = engine.clone();
        let path = dir.path().join("model.gguf");
        let load = tokio::task::spawn_blocking(move || loader.load_session(second, &path, 4, 2048));
        assert!(engine.free_session(second));
        assert!(matches!(load.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(engine.session_state(second), SessionState::Unloaded);
        assert_eq!(engine.live_sessions(), 1);
        assert_eq!(backend.log().frees, 1);
    }

    #[tokio::test]
    async fn test_directory_is_not_an_artifact() {
        let fixture = NativeFixture::new(Script::default());
        let dir = fixture.dir.path().join("model.gguf");
        std::fs::create_dir(&dir).unwrap();

        let err = fixture
            .runtime
            .initialize_model(&ModelDescriptor::from_local_file(dir), LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound(_)));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let fixture = NativeFixture::loaded(Script::default()).await;

        fixture.runtime.release().await;
        fixture.runtime.release().await;

        assert!(!fixture.runtime.is_ready());
        assert!(fixture.runtime.model_path().is_none());
        assert_eq!(fixture.backend.log().frees, 1);
        assert_eq!(fixture.engine.live_sessions(), 0);
        assert_eq!(
            fixture.runtime.performance_metrics(),
            halo_common::PerformanceMetrics::default()
        );
    }

    #[tokio::test]
    async fn test_reinitialize_replaces_session() {
        let fixture = NativeFixture::loaded(Script::default()).await;
        let first = fixture.runtime.handle();

        let other = fixture.model("other.gguf");
        fixture
            .runtime
            .initialize_model(&other, LoadOptions::default())
            .await
            .unwrap();

        assert_ne!(fixture.runtime.handle(), first);
        assert_eq!(fixture.engine.session_state(first), SessionState::Unloaded);
        assert_eq!(fixture.engine.live_sessions(), 1);
    }

    #[tokio::test]
    async fn test_stop_generation_ends_with_cancelled() {
        let script = Script::replying(&[])
            .ending(ScriptEnd::Endless(".".into()))
            .with_delay(Duration::from_millis(5));
        let fixture = NativeFixture::loaded(script).await;
        let handle = fixture.runtime.handle();

        let mut stream = fixture
            .runtime
            .generate_response("Count forever", GenerationParams::new(10_000, 0.7))
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, StreamFrame::Delta { content: ".".into() });
        fixture.runtime.stop_generation();

        let rest = collect(stream).await;
        assert!(rest.error.is_none());
        assert_eq!(rest.finish, Some(StopReason::Cancelled));
        // The engine left the generating state before Done was sent
        assert_eq!(fixture.engine.session_state(handle), SessionState::Loaded);

        // Partial reply is kept in the engine's conversation
        let conversation = fixture.backend.log().conversation;
        assert_eq!(conversation.last().map(|(role, _)| *role), Some(Role::Assistant));

        // A new generation works after a stop
        let text = fixture
            .runtime
            .generate_blocking("Again", GenerationParams::new(3, 0.7))
            .await
            .unwrap();
        assert_eq!(text, "...");
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_generation() {
        let script = Script::replying(&[])
            .ending(ScriptEnd::Endless("x".into()))
            .with_delay(Duration::from_millis(2));
        let fixture = NativeFixture::loaded(script).await;
        let handle = fixture.runtime.handle();

        let mut stream = fixture
            .runtime
            .generate_response("Go", GenerationParams::new(10_000, 0.7))
            .await
            .unwrap();
        stream.next().await.unwrap().unwrap();
        drop(stream);

        let mut state = fixture.engine.session_state(handle);
        for _ in 0..200 {
            if state == SessionState::Loaded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            state = fixture.engine.session_state(handle);
        }
        assert_eq!(state, SessionState::Loaded);
    }

    #[tokio::test]
    async fn test_release_during_generation() {
        let script = Script::replying(&[])
            .ending(ScriptEnd::Endless("x".into()))
            .with_delay(Duration::from_millis(5));
        let fixture = NativeFixture::loaded(script).await;

        let mut stream = fixture
            .runtime
            .generate_response("Go", GenerationParams::new(10_000, 0.7))
            .await
            .unwrap();
        stream.next().await.unwrap().unwrap();

        fixture.runtime.release().await;
        let rest = collect(stream).await;

        assert_eq!(rest.finish, Some(StopReason::Cancelled));
        assert!(!fixture.runtime.is_ready());
        assert_eq!(fixture.engine.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_engine_error_sentinel() {
        let script = Script::replying(&["partial"]).ending(ScriptEnd::Error("decode failed".into()));
        let fixture = NativeFixture::loaded(script).await;
        let handle = fixture.runtime.handle();

        let stream = fixture
            .runtime
            .generate_response("Hi", GenerationParams::default())
            .await
            .unwrap();
        let collected = collect(stream).await;

        assert_eq!(collected.text, "partial");
        assert!(collected.finish.is_none());
        match collected.error {
            Some(Error::Generation(message)) => assert_eq!(message, "decode failed"),
            other => panic!("expected generation error, got {:?}", other),
        }
        assert_eq!(fixture.engine.session_state(handle), SessionState::Loaded);
    }

    #[tokio::test]
    async fn test_engine_panic_becomes_error() {
        let script = Script::replying(&["a"]).ending(ScriptEnd::Panic);
        let fixture = NativeFixture::loaded(script).await;
        let handle = fixture.runtime.handle();

        let stream = fixture
            .runtime
            .generate_response("Hi", GenerationParams::default())
            .await
            .unwrap();
        let collected = collect(stream).await;

        match collected.error {
            Some(Error::Generation(message)) => assert!(message.contains("panicked")),
            other => panic!("expected generation error, got {:?}", other),
        }
        assert_eq!(fixture.engine.session_state(handle), SessionState::Loaded);
        assert!(fixture.runtime.is_ready());
    }

    #[tokio::test]
    async fn test_max_tokens_cap() {
        let script = Script::replying(&[]).ending(ScriptEnd::Endless("x".into()));
        let fixture = NativeFixture::loaded(script).await;

        let stream = fixture
            .runtime
            .generate_response("Hi", GenerationParams::new(3, 0.2))
            .await
            .unwrap();
        let collected = collect(stream).await;

        assert_eq!(collected.text, "xxx");
        assert_eq!(collected.finish, Some(StopReason::MaxTokensReached));
        assert_eq!(collected.usage.unwrap().completion_tokens, 3);
    }

    #[tokio::test]
    async fn test_empty_fragments_count_but_are_not_sent() {
        let fixture = NativeFixture::loaded(Script::replying(&["", "a", "", "b"])).await;

        let stream = fixture
            .runtime
            .generate_response("Hi", GenerationParams::default())
            .await
            .unwrap();
        let collected = collect(stream).await;

        assert_eq!(collected.text, "ab");
        assert_eq!(collected.deltas, 2);
        assert_eq!(collected.usage.unwrap().completion_tokens, 4);
    }

    #[tokio::test]
    async fn test_single_call_generation() {
        let fixture = NativeFixture::new(Script::default());
        let path = fixture.model("model.gguf").path;
        let handle = fixture.engine.init_session(&path, 4, 2048);
        assert!(!handle.is_null());
        let engine = fixture.engine.clone();

        let (produced, text) = tokio::task::spawn_blocking(move || {
            let mut text = String::new();
            let produced = engine
                .generate(handle, "Hi", 16, 0.5, |fragment| {
                    text.push_str(fragment);
                    true
                })
                .unwrap();
            (produced, text)
        })
        .await
        .unwrap();

        assert_eq!(produced, 4);
        assert_eq!(text, "Hello, world!");

        let conversation = fixture.backend.log().conversation;
        assert_eq!(
            conversation,
            vec![
                (Role::User, "Hi".to_string()),
                (Role::Assistant, "Hello, world!".to_string())
            ]
        );

        // Returning false stops early and still ends the completion
        let mut seen = 0;
        let produced = fixture
            .engine
            .generate(handle, "Again", 16, 0.5, |_| {
                seen += 1;
                false
            })
            .unwrap();
        assert_eq!((produced, seen), (1, 1));
        assert_eq!(fixture.engine.session_state(handle), SessionState::Loaded);

        assert!(fixture.engine.free_session(handle));
        fixture.backend.set_script(Script::default().failing_load());
        assert!(fixture.engine.init_session(&path, 4, 2048).is_null());
        assert_eq!(fixture.engine.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_one_completion_per_session() {
        let fixture = NativeFixture::loaded(Script::default()).await;
        let handle = fixture.runtime.handle();

        fixture.engine.begin_completion(handle, "one", 0.7).unwrap();
        assert_eq!(fixture.engine.session_state(handle), SessionState::Generating);

        let err = fixture.engine.begin_completion(handle, "two", 0.7).unwrap_err();
        assert!(matches!(err, Error::Generation(_)));

        fixture.engine.end_completion(handle);
        fixture.engine.end_completion(handle);
        fixture.engine.begin_completion(handle, "three", 0.7).unwrap();
        fixture.engine.end_completion(handle);
    }

    #[tokio::test]
    async fn test_stale_handle_is_rejected() {
        let fixture = NativeFixture::loaded(Script::default()).await;
        let handle = fixture.runtime.handle();
        fixture.runtime.release().await;

        assert!(matches!(
            fixture.engine.append_message(handle, Role::User, "hi"),
            Err(Error::RuntimeNotReady)
        ));
        assert!(matches!(
            fixture.engine.step(handle),
            crate::native::StepOutput::Error(_)
        ));
        assert!(!fixture.engine.free_session(handle));
    }

    #[tokio::test]
    async fn test_conversation_state_through_runtime() {
        let fixture = NativeFixture::loaded(Script::default()).await;
        let conversational = fixture.runtime.as_conversational().unwrap();

        conversational
            .add_conversation_message(Role::System, "Be brief.")
            .await
            .unwrap();
        conversational
            .add_conversation_message(Role::User, "Earlier question")
            .await
            .unwrap();
        assert_eq!(fixture.backend.log().conversation.len(), 2);
        assert!(conversational.context_usage() > 0);

        conversational.clear_conversation().await.unwrap();
        let log = fixture.backend.log();
        assert!(log.conversation.is_empty());
        assert_eq!(log.clears, 1);
        assert_eq!(conversational.generation_speed(), 12.5);

        fixture.runtime.release().await;
        assert!(matches!(
            conversational.clear_conversation().await,
            Err(Error::RuntimeNotReady)
        ));
        assert_eq!(conversational.generation_speed(), 0.0);
    }

    #[tokio::test]
    async fn test_conversation_calls_do_not_stall_the_executor() {
        let script = Script::replying(&[])
            .ending(ScriptEnd::Endless(".".into()))
            .with_delay(Duration::from_millis(300));
        let fixture = NativeFixture::loaded(script).await;
        let conversational = fixture.runtime.as_conversational().unwrap();
        conversational
            .add_conversation_message(Role::System, "Be brief.")
            .await
            .unwrap();

        let mut stream = fixture
            .runtime
            .generate_response("go", GenerationParams::new(10_000, 0.7))
            .await
            .unwrap();
        stream.next().await.unwrap().unwrap();

        // The next step is now sleeping inside the engine
        let started = std::time::Instant::now();
        assert_eq!(conversational.generation_speed(), 12.5);
        assert!(conversational.context_usage() > 0);
        assert!(started.elapsed() < Duration::from_millis(100));

        let (cleared, sleeper) = tokio::join!(conversational.clear_conversation(), async {
            let started = std::time::Instant::now();
            tokio::time::sleep(Duration::from_millis(10)).await;
            started.elapsed()
        });
        cleared.unwrap();
        assert!(sleeper < Duration::from_millis(150), "sleeper woke after {:?}", sleeper);

        fixture.runtime.stop_generation();
        let rest = collect(stream).await;
        assert_eq!(rest.finish, Some(StopReason::Cancelled));
        assert_eq!(fixture.backend.log().clears, 1);
    }

    #[tokio::test]
    async fn test_metadata_probe_without_loading() {
        let fixture = NativeFixture::new(Script::default());
        let model = fixture.model("probe.gguf");

        let metadata = fixture
            .runtime
            .as_conversational()
            .unwrap()
            .read_metadata(&model.path)
            .await;
        assert!(metadata.valid);
        assert_eq!(metadata.architecture, "llama");
        assert_eq!(metadata.context_size, 8192);
        assert!(!fixture.runtime.is_ready());

        let bogus = fixture
            .runtime
            .as_conversational()
            .unwrap()
            .read_metadata(&fixture.dir.path().join("nope.gguf"))
            .await;
        assert!(!bogus.valid);
    }

    #[tokio::test]
    async fn test_graph_end_to_end() {
        let (_dir, backend, runtime, model) = graph_fixture(ScriptedGraphBackend::new(&[1, 0, 2], 3));

        runtime.initialize_model(&model, LoadOptions::default()).await.unwrap();
        assert!(runtime.is_ready());
        assert_eq!(runtime.template_id().as_deref(), Some("phi3"));
        assert_eq!(backend.opened(), vec![AccelerationType::GpuCompute]);
        assert!(runtime.as_conversational().is_none());

        let stream = runtime
            .generate_response("ab", GenerationParams::new(16, 1.5))
            .await
            .unwrap();
        let collected = collect(stream).await;

        assert!(collected.error.is_none());
        assert_eq!(collected.text, "aba");
        assert_eq!(collected.finish, Some(StopReason::EndOfSequence));
        assert_eq!(collected.usage.as_ref().unwrap().completion_tokens, 2);

        // Each pass sees the previous input plus the chosen token
        let lengths = backend.input_lengths();
        assert_eq!(lengths.len(), 3);
        assert_eq!(lengths[1], lengths[0] + 1);
        assert_eq!(lengths[2], lengths[0] + 2);
        assert_eq!(collected.usage.unwrap().prompt_tokens, lengths[0]);

        assert_eq!(
            runtime.performance_metrics().accelerator.as_deref(),
            Some("gpu_compute")
        );
    }

    #[tokio::test]
    async fn test_graph_max_tokens_and_template_detection() {
        let backend = ScriptedGraphBackend::new(&[0], 3)
            .with_chat_template("{% for m in messages %}<|im_start|>{{ m.role }}<|im_end|>{% endfor %}");
        let (_dir, _backend, runtime, model) = graph_fixture(backend);

        runtime.initialize_model(&model, LoadOptions::default()).await.unwrap();
        assert_eq!(runtime.template_id().as_deref(), Some("chatml"));

        let text = runtime
            .generate_blocking("hi", GenerationParams::new(4, 0.0))
            .await
            .unwrap();
        assert_eq!(text, "aaaa");
    }

    #[tokio::test]
    async fn test_graph_cancellation_between_passes() {
        let backend = ScriptedGraphBackend::new(&[0], 3).with_delay(Duration::from_millis(5));
        let (_dir, _backend, runtime, model) = graph_fixture(backend);
        runtime.initialize_model(&model, LoadOptions::default()).await.unwrap();

        let mut stream = runtime
            .generate_response("go", GenerationParams::new(10_000, 0.7))
            .await
            .unwrap();
        stream.next().await.unwrap().unwrap();
        runtime.stop_generation();

        let rest = collect(stream).await;
        assert_eq!(rest.finish, Some(StopReason::Cancelled));
    }

    #[tokio::test]
    async fn test_graph_failed_reload_unloads() {
        let (dir, backend, runtime, model) = graph_fixture(ScriptedGraphBackend::new(&[0], 3));
        runtime.initialize_model(&model, LoadOptions::default()).await.unwrap();
        assert!(runtime.is_ready());

        let gguf = write_gguf(dir.path(), "model.gguf", "llama", 4096).unwrap();
        let err = runtime
            .initialize_model(&ModelDescriptor::from_local_file(gguf), LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(!runtime.is_ready());
        assert!(runtime.template_id().is_none());

        runtime.initialize_model(&model, LoadOptions::default()).await.unwrap();
        std::fs::remove_file(&model.path).unwrap();
        let err = runtime
            .initialize_model(&model, LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound(_)));
        assert!(!runtime.is_ready());
        assert_eq!(backend.opened().len(), 2);
    }

    #[tokio::test]
    async fn test_graph_load_errors() {
        let (dir, _backend, runtime, model) = graph_fixture(ScriptedGraphBackend::new(&[0], 3));
        std::fs::remove_file(dir.path().join("vocab.json")).unwrap();

        let err = runtime
            .initialize_model(&model, LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VocabLoad(_)));
        assert!(!runtime.is_ready());

        let (_dir, _backend, runtime, model) = graph_fixture(ScriptedGraphBackend::new(&[0], 3).failing_open());
        let err = runtime
            .initialize_model(&model, LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));

        let result = runtime
            .generate_response("hi", GenerationParams::default())
            .await;
        assert!(matches!(result.err(), Some(Error::RuntimeNotReady)));
    }

    #[tokio::test]
    async fn test_manager_switches_models() {
        let fixture = NativeFixture::new(Script::default());
        let manager = ModelManager::new().register(ModelFormat::NativeQuantized, fixture.runtime.clone());

        let first = fixture.model("first.gguf");
        manager.load_model(&first, LoadOptions::default()).await.unwrap();
        let first_handle = fixture.runtime.handle();

        let second = fixture.model("second.gguf");
        manager.load_model(&second, LoadOptions::default()).await.unwrap();

        assert_eq!(fixture.engine.session_state(first_handle), SessionState::Unloaded);
        assert_eq!(fixture.engine.live_sessions(), 1);
        assert_eq!(fixture.runtime.model_path(), Some(second.path.clone()));
        assert!(manager.current_runtime().await.is_some());

        manager.unload_model().await;
        assert!(manager.current_runtime().await.is_none());
        assert_eq!(fixture.engine.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_manager_switches_runtimes() {
        let native = NativeFixture::new(Script::default());
        let (_dir, _backend, graph, graph_model) = graph_fixture(ScriptedGraphBackend::new(&[2], 3));
        let manager = ModelManager::new()
            .register(ModelFormat::NativeQuantized, native.runtime.clone())
            .register(ModelFormat::TensorGraph, graph.clone());

        let mut formats = manager.supported_formats();
        formats.sort_by_key(|f| f.as_str());
        assert_eq!(formats, vec![ModelFormat::NativeQuantized, ModelFormat::TensorGraph]);

        manager
            .load_model(&native.model("model.gguf"), LoadOptions::default())
            .await
            .unwrap();
        manager.load_model(&graph_model, LoadOptions::default()).await.unwrap();

        assert!(!native.runtime.is_ready());
        assert_eq!(native.engine.live_sessions(), 0);
        let current = manager.current_runtime().await.unwrap();
        assert_eq!(current.name(), "tensor_graph");
    }

    #[tokio::test]
    async fn test_manager_failed_load_leaves_nothing_loaded() {
        let fixture = NativeFixture::new(Script::default());
        let manager = ModelManager::new().register(ModelFormat::NativeQuantized, fixture.runtime.clone());
        manager
            .load_model(&fixture.model("good.gguf"), LoadOptions::default())
            .await
            .unwrap();

        let unknown = fixture.dir.path().join("weights.bin");
        std::fs::write(&unknown, b"??").unwrap();
        let err = manager
            .load_model(&ModelDescriptor::from_local_file(unknown), LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        assert!(manager.current_runtime().await.is_none());
        assert_eq!(fixture.engine.live_sessions(), 0);

        fixture.backend.set_script(Script::default().failing_load());
        let err = manager
            .load_model(&fixture.model("bad.gguf"), LoadOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_load_error());
        assert!(manager.current_runtime().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_loads_keep_one_model() {
        let fixture = NativeFixture::new(Script::default().with_delay(Duration::from_millis(1)));
        let manager = Arc::new(
            ModelManager::new().register(ModelFormat::NativeQuantized, fixture.runtime.clone()),
        );

        let models: Vec<_> = (0..4).map(|i| fixture.model(&format!("m{}.gguf", i))).collect();
        let tasks: Vec<_> = models
            .into_iter()
            .map(|model| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.load_model(&model, LoadOptions::default()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(fixture.engine.live_sessions(), 1);
        assert!(manager.current_runtime().await.is_some());
        assert_eq!(fixture.backend.log().loads.len(), 4);
        assert_eq!(fixture.backend.log().frees, 3);
    }
}
