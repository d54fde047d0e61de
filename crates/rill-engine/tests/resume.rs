//! Resume semantics: a second run over the same work root with the same
//! session id must satisfy unchanged tasks from the cache without any
//! backend submission.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use camino::Utf8PathBuf;
use pretty_assertions::assert_eq;
use rill_engine::{
    data_channel, ChannelReader, Element, InParam, InputSource, OutParam, ParallelProcessor,
    ProcessBody, ProcessConfig, ProcessDef, ScriptTemplate, Session, SessionBuilder, TaskEvent,
    TaskEventKind, Value,
};

async fn read(rx: &mut ChannelReader) -> Element {
    tokio::time::timeout(Duration::from_secs(30), rx.read())
        .await
        .expect("channel read timed out")
}

fn record_events(session: &Arc<Session>) -> Arc<Mutex<Vec<TaskEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.dispatcher().add_listener(Arc::new(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    }));
    events
}

fn writer_def(out_tx: rill_engine::ChannelWriter, x_rx: ChannelReader) -> ProcessDef {
    ProcessDef {
        name: "writer".into(),
        inputs: vec![InParam::Value {
            name: "x".into(),
            from: InputSource::Queue(x_rx),
        }],
        outputs: vec![OutParam::File {
            pattern: "out.txt".into(),
            to: out_tx,
        }],
        body: ProcessBody::Script(ScriptTemplate::new("printf ok > out.txt")),
    }
}

async fn run_once(session: &Arc<Session>) -> Result<(Value, Vec<TaskEvent>)> {
    let events = record_events(session);
    let (x_tx, x_rx) = data_channel();
    let (out_tx, mut out_rx) = data_channel();
    let processor =
        ParallelProcessor::spawn(session, writer_def(out_tx, x_rx), ProcessConfig::default())?;
    x_tx.send(Value::Int(5));
    x_tx.close();
    let Element::Item(bound) = read(&mut out_rx).await else {
        panic!("expected a bound output");
    };
    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;
    let events = events.lock().unwrap().clone();
    Ok((bound, events))
}

#[tokio::test]
async fn resume_satisfies_unchanged_tasks_from_the_cache() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = Utf8PathBuf::try_from(dir.path().join("work"))?;

    // First run executes for real.
    let first = SessionBuilder::new(&root).build()?;
    let (first_value, first_events) = run_once(&first).await?;
    first.shutdown().await;
    let Value::Path(first_path) = &first_value else {
        panic!("expected a path output");
    };
    assert_eq!(std::fs::read_to_string(first_path)?, "ok");
    assert!(first_events
        .iter()
        .any(|e| e.kind == TaskEventKind::Submitted));

    // Second run: same work root, same session id, resume on. No files are
    // touched in between.
    let second = SessionBuilder::new(&root)
        .id(first.id())
        .resume(true)
        .build()?;
    let (second_value, second_events) = run_once(&second).await?;
    second.shutdown().await;

    assert_eq!(second_value, first_value, "identical bound outputs");
    assert!(
        !second_events
            .iter()
            .any(|e| e.kind == TaskEventKind::Submitted),
        "the submit listener is not invoked on a cache hit"
    );
    assert!(second_events
        .iter()
        .any(|e| e.kind == TaskEventKind::Cached));
    Ok(())
}

#[tokio::test]
async fn resume_with_a_changed_input_resubmits() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = Utf8PathBuf::try_from(dir.path().join("work"))?;

    let first = SessionBuilder::new(&root).build()?;
    let (_, first_events) = run_once(&first).await?;
    first.shutdown().await;
    assert!(first_events
        .iter()
        .any(|e| e.kind == TaskEventKind::Submitted));

    // Same session id and resume, but a different input value: new hash,
    // fresh submission.
    let second = SessionBuilder::new(&root)
        .id(first.id())
        .resume(true)
        .build()?;
    let events = record_events(&second);
    let (x_tx, x_rx) = data_channel();
    let (out_tx, mut out_rx) = data_channel();
    let processor =
        ParallelProcessor::spawn(&second, writer_def(out_tx, x_rx), ProcessConfig::default())?;
    x_tx.send(Value::Int(6));
    x_tx.close();
    assert!(matches!(read(&mut out_rx).await, Element::Item(_)));
    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;
    second.shutdown().await;

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| e.kind == TaskEventKind::Submitted));
    assert!(!events.iter().any(|e| e.kind == TaskEventKind::Cached));
    Ok(())
}

#[tokio::test]
async fn a_damaged_cached_work_dir_is_rejected_and_resubmitted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = Utf8PathBuf::try_from(dir.path().join("work"))?;

    let first = SessionBuilder::new(&root).build()?;
    let (first_value, _) = run_once(&first).await?;
    first.shutdown().await;
    let Value::Path(first_path) = first_value else {
        panic!("expected a path output");
    };
    // Delete the declared output from the cached work directory.
    std::fs::remove_file(&first_path)?;

    let second = SessionBuilder::new(&root)
        .id(first.id())
        .resume(true)
        .build()?;
    let (second_value, second_events) = run_once(&second).await?;
    second.shutdown().await;

    assert!(
        second_events
            .iter()
            .any(|e| e.kind == TaskEventKind::Submitted),
        "missing output rejects the cache hit wholesale"
    );
    let Value::Path(second_path) = second_value else {
        panic!("expected a path output");
    };
    assert_eq!(std::fs::read_to_string(second_path)?, "ok");
    Ok(())
}

#[tokio::test]
async fn cache_disabled_never_hits() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = Utf8PathBuf::try_from(dir.path().join("work"))?;
    let config: ProcessConfig = serde_json::from_str(r#"{"cache": false}"#)?;

    let first = SessionBuilder::new(&root).build()?;
    let events = record_events(&first);
    let (x_tx, x_rx) = data_channel();
    let (out_tx, mut out_rx) = data_channel();
    let processor = ParallelProcessor::spawn(&first, writer_def(out_tx, x_rx), config.clone())?;
    x_tx.send(Value::Int(5));
    x_tx.close();
    assert!(matches!(read(&mut out_rx).await, Element::Item(_)));
    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;
    first.shutdown().await;

    // Uncached tasks get randomly salted work dirs.
    let submitted: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.kind == TaskEventKind::Submitted)
        .map(|e| e.work_dir.clone())
        .collect();
    assert_eq!(submitted.len(), 1);
    assert!(submitted[0].as_str().contains("uncached"));

    // Resume cannot hit: there is no hash to look up.
    let second = SessionBuilder::new(&root)
        .id(first.id())
        .resume(true)
        .build()?;
    let events = record_events(&second);
    let (x_tx, x_rx) = data_channel();
    let (out_tx, mut out_rx) = data_channel();
    let processor = ParallelProcessor::spawn(&second, writer_def(out_tx, x_rx), config)?;
    x_tx.send(Value::Int(5));
    x_tx.close();
    assert!(matches!(read(&mut out_rx).await, Element::Item(_)));
    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;
    second.shutdown().await;
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.kind == TaskEventKind::Submitted));
    Ok(())
}
