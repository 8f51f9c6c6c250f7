use super::engine::apply_tick;
use super::transport::{TokenResponse, chunk_spans, legacy_token, require_success, token_or_missing};
use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;
use futures::future::BoxFuture;
use futures_timer::Delay;
use serde_json::json;

use crate::form::{FieldName, FormEngine, FormOptions, FormStatus, Value};

fn file(name: &str, bytes: &[u8]) -> FilePayload {
    FilePayload::new(name, "application/octet-stream", bytes.to_vec())
}

/// Resolves each file to `tok-<name>` after an optional delay, failing the
/// one file named in `fail_on`.
struct ScriptedTransport {
    delay: Duration,
    fail_on: Option<String>,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_on: None,
        }
    }

    fn failing_on(name: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            fail_on: Some(name.to_string()),
        }
    }
}

impl UploadTransport for ScriptedTransport {
    fn upload<'a>(
        &'a self,
        file: &'a FilePayload,
        ctx: &'a TransferContext,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                Delay::new(self.delay).await;
            }
            if self.fail_on.as_deref() == Some(file.name.as_str()) {
                return Err(TransportError::Network {
                    file: file.name.clone(),
                    message: "connection reset".into(),
                });
            }
            ctx.report(ProgressTick {
                loaded: file.len(),
                ..ProgressTick::default()
            });
            Ok(format!("tok-{}", file.name))
        })
    }
}

/// Records every chunk and finalize call; each chunk takes `chunk_delay`.
struct RecordingChunkClient {
    chunk_delay: Duration,
    chunks: Mutex<Vec<(u32, u32, Vec<u8>)>>,
    finalize_calls: AtomicUsize,
}

impl RecordingChunkClient {
    fn new(chunk_delay: Duration) -> Self {
        Self {
            chunk_delay,
            chunks: Mutex::new(Vec::new()),
            finalize_calls: AtomicUsize::new(0),
        }
    }

    fn recorded(&self) -> Vec<(u32, u32, Vec<u8>)> {
        self.chunks.lock().expect("chunks lock").clone()
    }
}

impl ChunkClient for RecordingChunkClient {
    fn send_chunk<'a>(
        &'a self,
        _file: &'a FilePayload,
        index: u32,
        total: u32,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.chunk_delay.is_zero() {
                Delay::new(self.chunk_delay).await;
            }
            self.chunks
                .lock()
                .expect("chunks lock")
                .push((index, total, bytes));
            Ok(())
        })
    }

    fn finalize<'a>(
        &'a self,
        file: &'a FilePayload,
        _chunk_count: u32,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("chunked-{}", file.name))
        })
    }
}

#[test]
fn single_file_resolves_to_a_single_token() {
    let engine = UploadEngine::new(ScriptedTransport::new(), UploadOptions::default());
    let outcome = block_on(engine.upload(vec![file("a.png", b"aaaa")])).expect("upload");

    assert_eq!(outcome, UploadOutcome::Single("tok-a.png".into()));
    assert_eq!(engine.phase(), UploadPhase::Completed);
    let progress = engine.progress();
    assert_eq!(progress.loaded, 4);
    assert_eq!(progress.total, 4);
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.remaining, 0);
    assert_eq!(engine.outcome(), Some(outcome));
}

#[test]
fn multiple_files_resolve_in_file_order() {
    let engine = UploadEngine::new(ScriptedTransport::new(), UploadOptions::default());
    let outcome = block_on(engine.upload(vec![
        file("a.png", b"aa"),
        file("b.png", b"bbb"),
        file("c.png", b"c"),
    ]))
    .expect("upload");

    assert_eq!(
        outcome,
        UploadOutcome::Many(vec!["tok-a.png".into(), "tok-b.png".into(), "tok-c.png".into()])
    );
    assert_eq!(outcome.tokens().len(), 3);
    assert_eq!(engine.progress().loaded, 6);
}

#[test]
fn failed_file_surfaces_its_name_and_stops_the_batch() {
    let engine = UploadEngine::new(
        ScriptedTransport::failing_on("b.txt"),
        UploadOptions::default(),
    );
    let error = block_on(engine.upload(vec![file("a.txt", b"aa"), file("b.txt", b"bb")]))
        .expect_err("upload must fail");

    assert_eq!(error.file(), "b.txt");
    assert_eq!(engine.phase(), UploadPhase::Error);
    assert_eq!(engine.error().expect("stored error").file(), "b.txt");
    assert_eq!(engine.outcome(), None);
}

#[test]
fn chunked_upload_covers_the_file_and_finalizes_once() {
    let client = Arc::new(RecordingChunkClient::new(Duration::ZERO));
    let transport = ChunkedTransport::new(client.clone(), 3, 3);
    let engine = UploadEngine::new(transport, UploadOptions::default());

    let outcome =
        block_on(engine.upload(vec![file("data.bin", b"0123456789")])).expect("upload");

    assert_eq!(outcome, UploadOutcome::Single("chunked-data.bin".into()));
    assert_eq!(client.finalize_calls.load(Ordering::SeqCst), 1);

    let mut chunks = client.recorded();
    chunks.sort_by_key(|(index, _, _)| *index);
    assert_eq!(chunks.len(), 4);
    for (position, (index, total, bytes)) in chunks.iter().enumerate() {
        assert_eq!(*index, position as u32);
        assert_eq!(*total, 4);
        assert_eq!(bytes.len(), if position == 3 { 1 } else { 3 });
    }
    assert_eq!(engine.progress().percent, 100);
    assert_eq!(engine.progress().total_chunks, None);
}

#[test]
fn empty_file_skips_chunks_but_still_finalizes() {
    let client = Arc::new(RecordingChunkClient::new(Duration::ZERO));
    let transport = ChunkedTransport::new(client.clone(), 4, 3);
    let engine = UploadEngine::new(transport, UploadOptions::default());

    let outcome = block_on(engine.upload(vec![file("empty.bin", b"")])).expect("upload");

    assert_eq!(outcome, UploadOutcome::Single("chunked-empty.bin".into()));
    assert!(client.recorded().is_empty());
    assert_eq!(client.finalize_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_aborts_remaining_chunks_and_zeroes_the_state() {
    let client = Arc::new(RecordingChunkClient::new(Duration::from_millis(20)));
    let transport = ChunkedTransport::new(client.clone(), 2, 2);
    let engine = UploadEngine::new(transport, UploadOptions::default());
    let payload = file("big.bin", b"0123456789");

    let (result, ()) = block_on(futures::future::join(engine.upload(vec![payload]), async {
        Delay::new(Duration::from_millis(30)).await;
        engine.cancel();
    }));

    let error = result.expect_err("upload must be cancelled");
    assert!(matches!(error, TransportError::Cancelled { .. }));
    assert!(client.recorded().len() < 5);
    assert_eq!(client.finalize_calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.phase(), UploadPhase::Idle);
    assert_eq!(engine.progress(), UploadProgress::default());
}

#[test]
fn pause_gates_new_chunks_until_resume() {
    let client = Arc::new(RecordingChunkClient::new(Duration::from_millis(30)));
    let transport = ChunkedTransport::new(client.clone(), 3, 1);
    let engine = Arc::new(UploadEngine::new(
        transport,
        UploadOptions {
            resumable: true,
            ..UploadOptions::default()
        },
    ));

    let worker = {
        let engine = engine.clone();
        thread::spawn(move || {
            block_on(engine.upload(vec![file("data.bin", b"0123456789")])).expect("upload")
        })
    };

    thread::sleep(Duration::from_millis(10));
    assert!(engine.pause());
    assert_eq!(engine.phase(), UploadPhase::Paused);

    // The in-flight chunk finishes; nothing new starts while paused.
    thread::sleep(Duration::from_millis(60));
    assert_eq!(client.recorded().len(), 1);

    assert!(engine.resume());
    let outcome = worker.join().expect("worker joins");
    assert_eq!(outcome, UploadOutcome::Single("chunked-data.bin".into()));
    assert_eq!(client.recorded().len(), 4);
    assert_eq!(engine.phase(), UploadPhase::Completed);
}

#[test]
fn pause_is_refused_when_not_resumable_or_not_uploading() {
    let engine = UploadEngine::new(ScriptedTransport::new(), UploadOptions::default());
    assert!(!engine.pause());

    let resumable = UploadEngine::new(
        ScriptedTransport::new(),
        UploadOptions {
            resumable: true,
            ..UploadOptions::default()
        },
    );
    // Nothing in flight, so there is nothing to pause or resume.
    assert!(!resumable.pause());
    assert!(!resumable.resume());
}

#[test]
fn progress_is_monotonic_while_uploading() {
    let client = Arc::new(RecordingChunkClient::new(Duration::from_millis(10)));
    let transport = ChunkedTransport::new(client, 2, 1);
    let engine = Arc::new(UploadEngine::new(transport, UploadOptions::default()));

    let worker = {
        let engine = engine.clone();
        thread::spawn(move || {
            block_on(engine.upload(vec![file("data.bin", b"01234567")])).expect("upload")
        })
    };

    let mut last_loaded = 0;
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(5));
        let progress = engine.progress();
        assert!(progress.loaded >= last_loaded);
        assert!(progress.percent <= 100);
        last_loaded = progress.loaded;
    }

    worker.join().expect("worker joins");
    let progress = engine.progress();
    assert_eq!(progress.loaded, 8);
    assert_eq!(progress.percent, 100);
    assert!(progress.speed > 0.0);
}

#[test]
fn reset_clears_a_completed_upload() {
    let engine = UploadEngine::new(ScriptedTransport::new(), UploadOptions::default());
    block_on(engine.upload(vec![file("a.png", b"aaaa")])).expect("upload");
    assert_eq!(engine.phase(), UploadPhase::Completed);

    engine.reset();
    assert_eq!(engine.phase(), UploadPhase::Idle);
    assert_eq!(engine.progress(), UploadProgress::default());
    assert_eq!(engine.outcome(), None);
}

#[test]
fn apply_tick_derives_percent_speed_and_remaining() {
    let state = RwLock::new(UploadState::idle());
    {
        let mut state = state.write().expect("state lock");
        state.phase = UploadPhase::Uploading;
        state.progress.total = 100;
        state.started_at = Some(Instant::now() - Duration::from_secs(1));
    }

    apply_tick(
        &state,
        0,
        ProgressTick {
            loaded: 50,
            current_chunk: Some(2),
            total_chunks: Some(4),
        },
    );

    let progress = state.read().expect("state lock").progress;
    assert_eq!(progress.loaded, 50);
    assert_eq!(progress.percent, 50);
    assert_eq!(progress.current_chunk, Some(2));
    assert_eq!(progress.total_chunks, Some(4));
    // Roughly 50 B over one second, so about one second left.
    assert!(progress.speed > 0.0);
    assert!(progress.remaining >= 1);

    // A late, smaller tick never walks `loaded` backwards.
    apply_tick(&state, 0, ProgressTick { loaded: 10, ..ProgressTick::default() });
    assert_eq!(state.read().expect("state lock").progress.loaded, 50);
}

#[test]
fn apply_tick_is_ignored_outside_an_active_upload() {
    let state = RwLock::new(UploadState::idle());
    apply_tick(&state, 0, ProgressTick { loaded: 10, ..ProgressTick::default() });
    assert_eq!(state.read().expect("state lock").progress.loaded, 0);
}

#[test]
fn chunk_spans_cover_the_length_exactly() {
    assert_eq!(chunk_spans(10, 3), vec![(0, 3), (3, 6), (6, 9), (9, 10)]);
    assert_eq!(chunk_spans(6, 3), vec![(0, 3), (3, 6)]);
    assert_eq!(chunk_spans(2, 3), vec![(0, 2)]);
    assert!(chunk_spans(0, 3).is_empty());
    // A zero chunk size is clamped instead of looping forever.
    assert_eq!(chunk_spans(2, 0), vec![(0, 1), (1, 2)]);
}

#[test]
fn transport_runs_standalone_with_a_detached_context() {
    let client = Arc::new(RecordingChunkClient::new(Duration::ZERO));
    let transport = ChunkedTransport::new(client.clone(), 2, 3);
    let ctx = TransferContext::detached();

    let token =
        block_on(transport.upload(&file("solo.bin", b"abcdef"), &ctx)).expect("upload");

    assert_eq!(token, "chunked-solo.bin");
    assert_eq!(client.recorded().len(), 3);
    assert!(!ctx.is_cancelled());
}

#[test]
fn non_success_status_maps_to_a_status_error() {
    let payload = file("a.png", b"aa");
    assert!(require_success(&payload, reqwest::StatusCode::OK).is_ok());

    let error = require_success(&payload, reqwest::StatusCode::INTERNAL_SERVER_ERROR)
        .expect_err("5xx must fail");
    assert_eq!(
        error,
        TransportError::Status {
            file: "a.png".into(),
            status: 500,
        }
    );
    assert_eq!(error.file(), "a.png");
}

#[test]
fn tokenless_response_maps_to_a_missing_token_error() {
    let payload = file("a.png", b"aa");
    assert_eq!(
        token_or_missing(&payload, Some("tok".into())).expect("token"),
        "tok"
    );

    let error = token_or_missing(&payload, None).expect_err("no token must fail");
    assert_eq!(error, TransportError::MissingToken { file: "a.png".into() });
}

#[test]
fn token_response_accepts_token_or_id() {
    let parsed: TokenResponse =
        serde_json::from_value(json!({"token": "t"})).expect("parse token");
    assert_eq!(parsed.into_token(), Some("t".to_string()));

    let parsed: TokenResponse = serde_json::from_value(json!({"id": "i"})).expect("parse id");
    assert_eq!(parsed.into_token(), Some("i".to_string()));

    let parsed: TokenResponse = serde_json::from_value(json!({})).expect("parse empty");
    assert_eq!(parsed.into_token(), None);
}

#[test]
fn legacy_token_reads_the_nested_result_shape() {
    assert_eq!(
        legacy_token(&json!({"result": {"token": "abc"}})),
        Some("abc".to_string())
    );
    assert_eq!(legacy_token(&json!({"token": "abc"})), None);
    assert_eq!(legacy_token(&json!({"result": {}})), None);
}

#[test]
fn submit_with_uploads_injects_tokens_before_the_handler_runs() {
    let form = FormEngine::<String>::new(
        [(FieldName::from("avatar"), Value::Null)].into_iter().collect(),
        FormOptions::default(),
    );
    let uploads = UploadEngine::new(ScriptedTransport::new(), UploadOptions::default());

    block_on(form.submit_with_uploads(
        vec![PendingUpload::new(
            "avatar",
            vec![file("a.png", b"aaaa")],
            &uploads,
        )],
        |values, _helpers| async move {
            assert_eq!(
                values.get(&FieldName::from("avatar")),
                Some(&json!("tok-a.png"))
            );
            Ok(())
        },
    ))
    .expect("submit succeeds");

    assert_eq!(form.status().expect("status"), FormStatus::Success);
    assert_eq!(uploads.phase(), UploadPhase::Completed);
}

#[test]
fn upload_failure_short_circuits_the_submit() {
    let form = FormEngine::<String>::new(
        [(FieldName::from("avatar"), Value::Null)].into_iter().collect(),
        FormOptions::default(),
    );
    let uploads = UploadEngine::new(
        ScriptedTransport::failing_on("a.png"),
        UploadOptions::default(),
    );

    let handled = Arc::new(AtomicUsize::new(0));
    let result = {
        let handled = handled.clone();
        block_on(form.submit_with_uploads(
            vec![PendingUpload::new(
                "avatar",
                vec![file("a.png", b"aaaa")],
                &uploads,
            )],
            move |_values, _helpers| {
                handled.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        ))
    };

    assert!(result.is_err());
    assert_eq!(handled.load(Ordering::SeqCst), 0);
    assert_eq!(form.status().expect("status"), FormStatus::Idle);
    assert_eq!(uploads.phase(), UploadPhase::Error);
    assert_eq!(
        form.values().expect("values").get(&FieldName::from("avatar")),
        Some(&Value::Null)
    );
}

#[test]
fn attach_upload_outcome_writes_ordered_token_arrays() {
    let form = FormEngine::<String>::new(
        [(FieldName::from("gallery"), Value::Null)].into_iter().collect(),
        FormOptions::default(),
    );
    let outcome = UploadOutcome::Many(vec!["t1".into(), "t2".into(), "t3".into()]);
    form.attach_upload_outcome("gallery", &outcome).expect("attach");

    assert_eq!(
        form.values().expect("values").get(&FieldName::from("gallery")),
        Some(&json!(["t1", "t2", "t3"]))
    );
}
