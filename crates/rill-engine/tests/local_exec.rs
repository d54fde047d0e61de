//! End-to-end pipeline scenarios against the local backend.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use camino::Utf8PathBuf;
use pretty_assertions::assert_eq;
use rill_engine::{
    data_channel, ChannelReader, Element, EngineError, InParam, InputSource, MergeProcessor,
    OutParam, ParallelProcessor, ProcessBody, ProcessConfig, ProcessDef, ScriptTemplate, Session,
    SessionBuilder, TaskEvent, TaskEventKind, Value,
};

fn work_root(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::try_from(dir.path().join("work")).unwrap()
}

async fn read(rx: &mut ChannelReader) -> Element {
    tokio::time::timeout(Duration::from_secs(30), rx.read())
        .await
        .expect("channel read timed out")
}

/// Record every task event the session emits.
fn record_events(session: &Arc<Session>) -> Arc<Mutex<Vec<TaskEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.dispatcher().add_listener(Arc::new(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    }));
    events
}

fn kind_counts(events: &[TaskEvent]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for event in events {
        let key = match event.kind {
            TaskEventKind::Submitted => "submitted",
            TaskEventKind::Cached => "cached",
            TaskEventKind::Started => "started",
            TaskEventKind::Completed { .. } => "completed",
            TaskEventKind::Failed { .. } => "failed",
        };
        *counts.entry(key).or_default() += 1;
    }
    counts
}

#[tokio::test]
async fn single_local_task_binds_stdout() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let session = SessionBuilder::new(work_root(&dir)).build()?;
    let events = record_events(&session);

    let (x_tx, x_rx) = data_channel();
    let (out_tx, mut out_rx) = data_channel();
    let processor = ParallelProcessor::spawn(
        &session,
        ProcessDef {
            name: "hello".into(),
            inputs: vec![InParam::Value {
                name: "x".into(),
                from: InputSource::Queue(x_rx),
            }],
            outputs: vec![OutParam::Stdout { to: out_tx }],
            body: ProcessBody::Script(ScriptTemplate::new("echo $x")),
        },
        ProcessConfig::default(),
    )?;
    let state = processor.state();

    x_tx.send(Value::Int(42));
    x_tx.close();

    assert_eq!(read(&mut out_rx).await, Element::Item(Value::Str("42".into())));
    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;

    assert_eq!(state.submitted(), 1);
    assert_eq!(state.completed(), 1);
    assert_eq!(state.errors(), 0);

    // The work directory holds the full task record.
    let events = events.lock().unwrap();
    let submitted: Vec<_> = events
        .iter()
        .filter(|e| e.kind == TaskEventKind::Submitted)
        .collect();
    assert_eq!(submitted.len(), 1);
    let work_dir = &submitted[0].work_dir;
    let captured = std::fs::read_to_string(work_dir.join(".command.out"))?;
    assert!(captured.starts_with("42\n"));
    assert_eq!(
        std::fs::read_to_string(work_dir.join(".exitcode"))?.trim(),
        "0"
    );

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn each_inputs_fan_out_as_a_cartesian_product() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let session = SessionBuilder::new(work_root(&dir)).build()?;
    let events = record_events(&session);

    let (out_tx, mut out_rx) = data_channel();
    // maxForks 1 serializes the firings, so outputs bind in firing order.
    let config: ProcessConfig = serde_json::from_str(r#"{"maxForks": 1}"#)?;
    let processor = ParallelProcessor::spawn(
        &session,
        ProcessDef {
            name: "combos".into(),
            inputs: vec![
                InParam::Each {
                    name: "a".into(),
                    from: InputSource::of(vec![Value::Int(1), Value::Int(2)]),
                },
                InParam::Each {
                    name: "b".into(),
                    from: InputSource::of(vec![Value::from("x"), Value::from("y")]),
                },
                InParam::Value {
                    name: "c".into(),
                    from: InputSource::of(9),
                },
            ],
            outputs: vec![OutParam::Stdout { to: out_tx }],
            body: ProcessBody::Script(ScriptTemplate::new("echo $a-$b-$c")),
        },
        config,
    )?;

    let mut seen = Vec::new();
    loop {
        match read(&mut out_rx).await {
            Element::Item(value) => seen.push(value.to_string()),
            Element::Stop => break,
        }
    }
    assert_eq!(seen, vec!["1-x-9", "1-y-9", "2-x-9", "2-y-9"]);
    processor.join().await;

    let events = events.lock().unwrap();
    let work_dirs: Vec<_> = events
        .iter()
        .filter(|e| e.kind == TaskEventKind::Submitted)
        .map(|e| e.work_dir.clone())
        .collect();
    assert_eq!(work_dirs.len(), 4);
    let unique: std::collections::BTreeSet<_> = work_dirs.iter().collect();
    assert_eq!(unique.len(), 4, "four distinct work dirs");
    // Hash-addressed dirs only collide (and grow a suffix) for equal hashes.
    assert!(work_dirs.iter().all(|d| !d.as_str().ends_with("_2")));

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn files_env_and_stdin_reach_the_command() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let session = SessionBuilder::new(work_root(&dir)).build()?;

    let input = Utf8PathBuf::try_from(dir.path().join("input.txt"))?;
    std::fs::write(&input, "filedata\n")?;

    let (out_tx, mut out_rx) = data_channel();
    let processor = ParallelProcessor::spawn(
        &session,
        ProcessDef {
            name: "plumbing".into(),
            inputs: vec![
                InParam::File {
                    name: "f".into(),
                    pattern: "data.txt".into(),
                    from: InputSource::of(Value::Path(input)),
                },
                InParam::Env {
                    name: "MARK".into(),
                    from: InputSource::of("set"),
                },
                InParam::Stdin {
                    from: InputSource::of("piped"),
                },
            ],
            outputs: vec![OutParam::Stdout { to: out_tx }],
            body: ProcessBody::Script(ScriptTemplate::new(
                "cat data.txt\nprintenv MARK\ncat",
            )),
        },
        ProcessConfig::default(),
    )?;

    assert_eq!(
        read(&mut out_rx).await,
        Element::Item(Value::Str("filedata\nset\npiped".into()))
    );
    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;
    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shared_input_resolves_once_and_serializes_firings() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let session = SessionBuilder::new(work_root(&dir)).build()?;

    let (shared_tx, shared_rx) = data_channel();
    let (x_tx, x_rx) = data_channel();
    let (out_tx, mut out_rx) = data_channel();
    let (shared_out_tx, mut shared_out_rx) = data_channel();
    let processor = ParallelProcessor::spawn(
        &session,
        ProcessDef {
            name: "tagged".into(),
            inputs: vec![
                InParam::SharedValue {
                    name: "tag".into(),
                    from: InputSource::Queue(shared_rx),
                    out: Some(shared_out_tx),
                },
                InParam::Value {
                    name: "x".into(),
                    from: InputSource::Queue(x_rx),
                },
            ],
            outputs: vec![OutParam::Stdout { to: out_tx }],
            body: ProcessBody::Script(ScriptTemplate::new("echo $tag:$x")),
        },
        ProcessConfig::default(),
    )?;

    shared_tx.send(Value::Int(10));
    shared_tx.send(Value::Int(99)); // never observed: shared resolves once
    for x in ["a", "b", "c"] {
        x_tx.send(Value::from(x));
    }
    x_tx.close();

    let mut seen = Vec::new();
    loop {
        match read(&mut out_rx).await {
            Element::Item(value) => seen.push(value.to_string()),
            Element::Stop => break,
        }
    }
    // Shared inputs force serial execution, so order is firing order and
    // every firing observed firing 1's value.
    assert_eq!(seen, vec!["10:a", "10:b", "10:c"]);

    // Shared output binds once, before the pill.
    assert_eq!(read(&mut shared_out_rx).await, Element::Item(Value::Int(10)));
    assert_eq!(read(&mut shared_out_rx).await, Element::Stop);

    processor.join().await;
    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn missing_output_terminates_the_session() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let session = SessionBuilder::new(work_root(&dir)).build()?;

    let (out_tx, mut out_rx) = data_channel();
    let processor = ParallelProcessor::spawn(
        &session,
        ProcessDef {
            name: "nooutput".into(),
            inputs: vec![InParam::Value {
                name: "x".into(),
                from: InputSource::of(1),
            }],
            outputs: vec![OutParam::File {
                pattern: "out.txt".into(),
                to: out_tx,
            }],
            body: ProcessBody::Script(ScriptTemplate::new("true")),
        },
        ProcessConfig::default(),
    )?;
    let state = processor.state();

    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;
    assert_eq!(state.errors(), 1);
    let fatal = session.first_error().expect("session recorded the failure");
    assert!(fatal.contains("no output matching 'out.txt'"), "{fatal}");
    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failing_task_with_ignore_strategy_keeps_the_session_alive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let session = SessionBuilder::new(work_root(&dir)).build()?;

    let (out_tx, mut out_rx) = data_channel();
    let config: ProcessConfig = serde_json::from_str(r#"{"errorStrategy": "ignore"}"#)?;
    let processor = ParallelProcessor::spawn(
        &session,
        ProcessDef {
            name: "flaky".into(),
            inputs: vec![InParam::Value {
                name: "x".into(),
                from: InputSource::of(1),
            }],
            outputs: vec![OutParam::Stdout { to: out_tx }],
            body: ProcessBody::Script(ScriptTemplate::new("exit 7")),
        },
        config,
    )?;
    let state = processor.state();

    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;
    assert_eq!(state.errors(), 1);
    assert_eq!(session.first_error(), None);
    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn walltime_expiry_is_reported_through_the_error_strategy() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let session = SessionBuilder::new(work_root(&dir)).build()?;

    let (out_tx, mut out_rx) = data_channel();
    let config: ProcessConfig =
        serde_json::from_str(r#"{"maxDuration": "50ms", "errorStrategy": "ignore"}"#)?;
    let processor = ParallelProcessor::spawn(
        &session,
        ProcessDef {
            name: "sleepy".into(),
            inputs: vec![InParam::Value {
                name: "x".into(),
                from: InputSource::of(1),
            }],
            outputs: vec![OutParam::Stdout { to: out_tx }],
            body: ProcessBody::Script(ScriptTemplate::new("sleep 5")),
        },
        config,
    )?;
    let state = processor.state();

    let started = std::time::Instant::now();
    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;
    assert!(started.elapsed() < Duration::from_secs(4), "killed early");
    assert_eq!(state.errors(), 1);
    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn retry_strategy_resubmits_until_success() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let session = SessionBuilder::new(work_root(&dir)).build()?;
    let events = record_events(&session);

    let flag = Utf8PathBuf::try_from(dir.path().join("flag"))?;
    let (out_tx, mut out_rx) = data_channel();
    let config: ProcessConfig =
        serde_json::from_str(r#"{"errorStrategy": "retry", "maxRetries": 2}"#)?;
    let processor = ParallelProcessor::spawn(
        &session,
        ProcessDef {
            name: "second-try".into(),
            inputs: vec![InParam::Value {
                name: "flag".into(),
                from: InputSource::of(Value::Str(flag.to_string())),
            }],
            outputs: vec![OutParam::Stdout { to: out_tx }],
            body: ProcessBody::Script(ScriptTemplate::new(
                "if [ -e $flag ]; then echo ok; else touch $flag; exit 1; fi",
            )),
        },
        config,
    )?;
    let state = processor.state();

    assert_eq!(read(&mut out_rx).await, Element::Item(Value::Str("ok".into())));
    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;

    assert_eq!(state.completed(), 1);
    assert_eq!(session.first_error(), None);
    let counts = kind_counts(&events.lock().unwrap());
    assert_eq!(counts.get("submitted"), Some(&2), "one retry happened");

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn native_body_runs_without_a_shell() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let session = SessionBuilder::new(work_root(&dir)).build()?;

    let (x_tx, x_rx) = data_channel();
    let (out_tx, mut out_rx) = data_channel();
    let config: ProcessConfig = serde_json::from_str(r#"{"executor": "native"}"#)?;
    let processor = ParallelProcessor::spawn(
        &session,
        ProcessDef {
            name: "double".into(),
            inputs: vec![InParam::Value {
                name: "x".into(),
                from: InputSource::Queue(x_rx),
            }],
            outputs: vec![OutParam::Stdout { to: out_tx }],
            body: ProcessBody::Native(Arc::new(|ctx| match ctx.get("x") {
                Some(Value::Int(x)) => Ok(Value::Int(x * 2)),
                other => Err(EngineError::Internal(format!("bad input: {other:?}"))),
            })),
        },
        config,
    )?;

    x_tx.send(Value::Int(21));
    x_tx.close();
    assert_eq!(read(&mut out_rx).await, Element::Item(Value::Int(42)));
    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;
    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn store_dir_short_circuits_submission() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let session = SessionBuilder::new(work_root(&dir)).build()?;
    let events = record_events(&session);

    let store = Utf8PathBuf::try_from(dir.path().join("results"))?;
    std::fs::create_dir_all(&store)?;
    std::fs::write(store.join("out.txt"), "stored")?;

    let (out_tx, mut out_rx) = data_channel();
    let config: ProcessConfig = serde_json::from_str(&format!(
        r#"{{"storeDir": "{store}", "errorStrategy": "ignore"}}"#
    ))?;
    let processor = ParallelProcessor::spawn(
        &session,
        ProcessDef {
            name: "stored".into(),
            inputs: vec![InParam::Value {
                name: "x".into(),
                from: InputSource::of(1),
            }],
            outputs: vec![OutParam::File {
                pattern: "out.txt".into(),
                to: out_tx,
            }],
            // Would fail if it ever actually ran.
            body: ProcessBody::Script(ScriptTemplate::new("exit 1")),
        },
        config,
    )?;
    let state = processor.state();

    let Element::Item(Value::Path(bound)) = read(&mut out_rx).await else {
        panic!("expected a stored path");
    };
    assert_eq!(bound, store.join("out.txt"));
    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;

    assert_eq!(state.submitted(), 0);
    assert_eq!(state.cached(), 1);
    let counts = kind_counts(&events.lock().unwrap());
    assert_eq!(counts.get("cached"), Some(&1));
    assert_eq!(counts.get("submitted"), None);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn merge_folds_all_firings_into_one_submission() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let session = SessionBuilder::new(work_root(&dir)).build()?;
    let events = record_events(&session);

    let f1 = Utf8PathBuf::try_from(dir.path().join("a.txt"))?;
    let f2 = Utf8PathBuf::try_from(dir.path().join("b.txt"))?;
    std::fs::write(&f1, "alpha\n")?;
    std::fs::write(&f2, "beta\n")?;

    let (in_tx, in_rx) = data_channel();
    let (out_tx, mut out_rx) = data_channel();
    let sources = [f1.clone(), f2.clone()];
    let processor = MergeProcessor::spawn(
        &session,
        ProcessDef {
            name: "gather".into(),
            inputs: vec![InParam::File {
                name: "f".into(),
                pattern: "*".into(),
                from: InputSource::Queue(in_rx),
            }],
            outputs: vec![OutParam::Stdout { to: out_tx }],
            body: ProcessBody::Script(ScriptTemplate::new("cat $f")),
        },
        ProcessConfig::default(),
    )?;
    let state = processor.state();

    in_tx.send(Value::Path(f1));
    in_tx.send(Value::Path(f2));
    in_tx.close();

    assert_eq!(
        read(&mut out_rx).await,
        Element::Item(Value::Str("alpha\nbeta".into()))
    );
    assert_eq!(read(&mut out_rx).await, Element::Stop);
    processor.join().await;

    // Exactly one backend submission for the whole fold.
    assert_eq!(state.submitted(), 1);
    let events = events.lock().unwrap();
    let counts = kind_counts(&events);
    assert_eq!(counts.get("submitted"), Some(&1));

    // The merged wrapper carries one marked section per firing and stages
    // both inputs under distinct names.
    let work_dir = events
        .iter()
        .find(|e| e.kind == TaskEventKind::Submitted)
        .map(|e| e.work_dir.clone())
        .unwrap();
    let wrapper = std::fs::read_to_string(work_dir.join(".command.sh"))?;
    assert!(wrapper.contains("# rill merge section 1"));
    assert!(wrapper.contains("# rill merge section 2"));
    assert!(wrapper.contains("\"file1\""));
    assert!(wrapper.contains("\"file2\""));
    assert!(work_dir.join(".command.cmd.1").exists());
    assert!(work_dir.join(".command.cmd.2").exists());

    // The merge hash is the fold of the sorted per-firing sub-hashes, and
    // the work directory is addressed by it.
    let sub_hashes: Vec<String> = sources
        .iter()
        .enumerate()
        .map(|(i, source)| {
            let mut key = rill_hash::HashKey::new(rill_hash::HashMode::Standard);
            key.push("session", &rill_hash::HashInput::Str(session.id_str()))
                .unwrap();
            key.push(
                "script",
                &rill_hash::HashInput::Str(format!("cat file{}", i + 1)),
            )
            .unwrap();
            key.push(
                "f",
                &rill_hash::HashInput::List(vec![rill_hash::HashInput::Path(source.clone())]),
            )
            .unwrap();
            key.finish()
        })
        .collect();
    let merge_hash = rill_hash::fold_digests(&session.id_str(), &sub_hashes);
    assert_eq!(
        work_dir,
        session
            .work_root()
            .join(&merge_hash[..2])
            .join(&merge_hash[2..])
    );

    session.shutdown().await;
    Ok(())
}
