mod support;

use std::fs;

use agent_provider::{RunEvent, RunFailure};
use assert_matches::assert_matches;
use checkpoint_store::{lock_file_name, CheckpointStore, CheckpointStoreError, FileCheckpointStore};
use coding_agent::error::TaskSetupError;
use coding_agent::surface::SurfaceOp;
use coding_agent::task::{
    ApprovalKind, ApprovalResponse, Presentation, StreamPhase, Task, TaskPhase,
};
use pretty_assertions::assert_eq;

use support::{call, config_with, finish, reply, stream, Fixture, HostSpy, TASK_ID};

fn read_call(path: &str) -> String {
    call("read_file", &[("path", path)])
}

#[test]
fn start_sends_the_task_and_waits_for_the_first_chunk() {
    let fixture = Fixture::new();
    let mut task = fixture.task(config_with(|_| {}));
    let mut host = HostSpy::new();

    task.start("  list the files  ", Vec::new(), &mut host);

    assert_eq!(host.started.len(), 1);
    assert_eq!(host.last_user_input(), "<task>\nlist the files\n</task>");
    assert_eq!(task.phase(), TaskPhase::Streaming(StreamPhase::WaitingFirstChunk));
    assert_eq!(task.state().request_count, 1);

    stream(&mut task, &mut host, "Looking ");
    assert_eq!(task.phase(), TaskPhase::Streaming(StreamPhase::Active));
}

#[test]
fn only_the_first_action_of_a_turn_runs() {
    let fixture = Fixture::new();
    fixture.write("a.txt", "alpha\n");
    fixture.write("b.txt", "beta\n");
    let mut task = fixture.task(config_with(|config| config.auto_approval.read_files = true));
    let mut host = HostSpy::new();

    task.start("read both files", Vec::new(), &mut host);
    let response = format!("Reading both.\n{}{}", read_call("a.txt"), read_call("b.txt"));
    reply(&mut task, &mut host, &response);

    assert_eq!(host.started.len(), 2);
    let input = host.last_user_input();
    assert!(input.contains("[read_file for 'a.txt'] Result:\nalpha\n"), "{input}");
    assert!(
        input.contains("Action [read_file for 'b.txt'] was not executed"),
        "{input}"
    );
    assert!(!input.contains("beta"), "{input}");
    assert!(host.presented.contains(&Presentation::IgnoredAction {
        description: "[read_file for 'b.txt']".to_string(),
    }));
    assert_eq!(host.narration(), vec!["Reading both.".to_string()]);
}

#[test]
fn narration_only_turns_inject_guidance_after_the_mistake_limit() {
    let fixture = Fixture::new();
    let mut task = fixture.task(config_with(|_| {}));
    let mut host = HostSpy::new();

    task.start("do something", Vec::new(), &mut host);
    for _ in 0..3 {
        reply(&mut task, &mut host, "I am thinking about it.");
    }

    assert_eq!(host.started.len(), 4);
    assert!(host.user_input(1).contains("You did not use an action"));
    assert!(!host.user_input(2).contains("trouble proceeding"));
    assert!(host.user_input(3).contains("trouble proceeding"), "{}", host.user_input(3));
    assert_eq!(task.state().consecutive_mistakes, 0);
    assert!(host
        .presented
        .iter()
        .any(|presentation| matches!(presentation, Presentation::Notice { .. })));
}

#[test]
fn rejection_cancels_the_stream_and_becomes_the_turn_result() {
    let fixture = Fixture::new();
    let mut task = fixture.task(config_with(|_| {}));
    let mut host = HostSpy::new();

    task.start("create a file", Vec::new(), &mut host);
    let response = format!(
        "Creating it.\n{}Then I will check it.",
        call("write_to_file", &[("path", "new.txt"), ("content", "hello")])
    );
    stream(&mut task, &mut host, &response);

    let approval = host.last_approval().clone();
    assert_eq!(approval.kind, ApprovalKind::Action);
    assert_eq!(
        approval.preview.as_ref().map(|preview| preview.proposed.as_str()),
        Some("hello")
    );
    assert_eq!(task.phase(), TaskPhase::AwaitingApproval(ApprovalKind::Action));

    task.on_approval_response(ApprovalResponse::message("write goodbye instead"), &mut host);

    assert_eq!(host.cancelled_runs, vec![1]);
    assert_eq!(fixture.read("new.txt"), None);
    assert_eq!(host.started.len(), 1, "next turn waits for the cancelled stream");

    task.on_run_event(RunEvent::Cancelled { run_id: 1 }, &mut host);

    assert_eq!(host.started.len(), 2);
    let input = host.last_user_input();
    assert!(
        input.contains("[write_to_file for 'new.txt'] The user denied this operation."),
        "{input}"
    );
    assert!(input.contains("<feedback>\nwrite goodbye instead\n</feedback>"), "{input}");
    assert!(!host.narration().contains(&"Then I will check it.".to_string()));
    let assistant = host.started[1].1[1].text();
    assert!(assistant.ends_with("[Response interrupted by user]"), "{assistant}");
    assert!(fixture.surface.open_views().is_empty());
}

#[test]
fn approved_diff_is_reconciled_and_written() {
    let fixture = Fixture::new();
    fixture.write("f.txt", "foo\n  bar\n");
    let mut task = fixture.task(config_with(|_| {}));
    let mut host = HostSpy::new();

    task.start("rename bar", Vec::new(), &mut host);
    let diff = "\n------- SEARCH\nbar\n=======\nbaz\n+++++++ REPLACE\n";
    reply(
        &mut task,
        &mut host,
        &call("replace_in_file", &[("path", "f.txt"), ("diff", diff)]),
    );

    assert_eq!(
        host.last_approval().preview.as_ref().map(|preview| preview.proposed.as_str()),
        Some("foo\n  baz\n")
    );
    task.on_approval_response(ApprovalResponse::approved(), &mut host);

    assert_eq!(fixture.read("f.txt").as_deref(), Some("foo\n  baz\n"));
    assert_eq!(host.started.len(), 2);
    assert!(host.last_user_input().contains("(line-trimmed)"));
    task.flush_checkpoints();
    assert!(fixture.checkpoint_count() >= 2);
}

#[test]
fn out_of_order_fragments_end_the_turn_without_writing() {
    let fixture = Fixture::new();
    fixture.write("f.txt", "a\nb\nc\n");
    let mut task = fixture.task(config_with(|config| config.auto_approval.edit_files = true));
    let mut host = HostSpy::new();

    task.start("edit", Vec::new(), &mut host);
    let diff = "\n------- SEARCH\nc\n=======\nC\n+++++++ REPLACE\n------- SEARCH\na\n=======\nA\n+++++++ REPLACE\n";
    let response = format!(
        "{}Trailing narration.",
        call("replace_in_file", &[("path", "f.txt"), ("diff", diff)])
    );
    reply(&mut task, &mut host, &response);

    assert_eq!(fixture.read("f.txt").as_deref(), Some("a\nb\nc\n"));
    assert_eq!(host.cancelled_runs, vec![1]);
    assert_eq!(host.started.len(), 2);
    assert!(host
        .last_user_input()
        .contains("SEARCH blocks must follow the order of f.txt"));
    assert_eq!(task.state().consecutive_mistakes, 1);
    assert!(!host.narration().contains(&"Trailing narration.".to_string()));
}

#[test]
fn unmatched_search_reports_the_closest_region() {
    let fixture = Fixture::new();
    fixture.write("f.txt", "alpha\nbeta\ngamma\ndelta\n");
    let mut task = fixture.task(config_with(|config| config.auto_approval.edit_files = true));
    let mut host = HostSpy::new();

    task.start("edit", Vec::new(), &mut host);
    let diff = "\n------- SEARCH\nalpha\nbeta\ngamma\nzeta\n=======\nomega\n+++++++ REPLACE\n";
    reply(
        &mut task,
        &mut host,
        &call("replace_in_file", &[("path", "f.txt"), ("diff", diff)]),
    );

    let input = host.last_user_input();
    assert!(input.contains("Expected search text:"), "{input}");
    assert!(input.contains("The closest region is lines 1-4"), "{input}");
    assert_eq!(fixture.read("f.txt").as_deref(), Some("alpha\nbeta\ngamma\ndelta\n"));
    assert_eq!(task.state().consecutive_mistakes, 1);
}

#[test]
fn missing_required_parameter_counts_as_a_mistake() {
    let fixture = Fixture::new();
    let mut task = fixture.task(config_with(|_| {}));
    let mut host = HostSpy::new();

    task.start("read", Vec::new(), &mut host);
    reply(&mut task, &mut host, &call("read_file", &[]));

    assert!(host.approvals.is_empty());
    assert!(host
        .last_user_input()
        .contains("Missing value for required parameter 'path'"));
    assert_eq!(task.state().consecutive_mistakes, 1);
}

#[test]
fn cancel_flushes_a_checkpoint_and_ignores_late_events() {
    let fixture = Fixture::new();
    let mut task = fixture.task(config_with(|_| {}));
    let mut host = HostSpy::new();

    task.start("long task", Vec::new(), &mut host);
    stream(&mut task, &mut host, "Half way ");
    task.cancel(&mut host);

    assert_eq!(task.phase(), TaskPhase::Cancelled);
    assert_eq!(host.cancelled_runs, vec![1]);
    assert!(task.state().cancelled);
    let latest = fixture
        .store
        .with(|store| store.history(support::TASK_ID).last().cloned())
        .expect("checkpoint written before cancel returns");
    assert_eq!(latest.payload["current_response"], "Half way ");

    task.on_run_event(
        RunEvent::Chunk {
            run_id: 1,
            text: "more".to_string(),
        },
        &mut host,
    );
    task.on_run_event(RunEvent::Cancelled { run_id: 1 }, &mut host);
    assert_eq!(task.state().buffer, "Half way ");
    assert_eq!(host.started.len(), 1);
}

#[test]
fn superseded_task_is_abandoned_without_touching_files() {
    let fixture = Fixture::new();
    let mut task = fixture.task(config_with(|config| config.auto_approval.edit_files = true));
    let mut host = HostSpy::new();

    task.start("write", Vec::new(), &mut host);
    task.flush_checkpoints();
    let written = fixture.checkpoint_count();

    let _newer = fixture.generation.supersede();
    reply(
        &mut task,
        &mut host,
        &call("write_to_file", &[("path", "late.txt"), ("content", "late")]),
    );

    assert_eq!(task.phase(), TaskPhase::Abandoned);
    assert!(task.state().abandoned);
    assert_eq!(fixture.read("late.txt"), None);
    task.flush_checkpoints();
    assert_eq!(fixture.checkpoint_count(), written);
}

#[test]
fn context_overflow_truncates_history_once_then_asks_to_retry() {
    let fixture = Fixture::new();
    fixture.write("a.txt", "alpha\n");
    let mut task = fixture.task(config_with(|config| config.auto_approval.read_files = true));
    let mut host = HostSpy::new();

    task.start("keep reading", Vec::new(), &mut host);
    for _ in 0..3 {
        reply(&mut task, &mut host, &read_call("a.txt"));
    }
    assert_eq!(host.started.len(), 4);
    assert_eq!(host.started[3].1.len(), 7);

    let run_id = host.last_run_id();
    task.on_run_event(
        RunEvent::Failed {
            run_id,
            failure: RunFailure::context_window("too long"),
        },
        &mut host,
    );

    assert_eq!(host.started.len(), 5);
    assert_eq!(host.started[4].1.len(), 5);
    assert_eq!(host.started[4].1[0], host.started[3].1[0]);
    assert!(!host.started[4].1[1].is_user());

    let run_id = host.last_run_id();
    task.on_run_event(
        RunEvent::Failed {
            run_id,
            failure: RunFailure::context_window("still too long"),
        },
        &mut host,
    );

    assert_eq!(host.started.len(), 5);
    assert_eq!(host.last_approval().kind, ApprovalKind::RetryAfterFailure);

    task.on_approval_response(ApprovalResponse::rejected(), &mut host);
    assert_eq!(task.phase(), TaskPhase::Cancelled);
}

#[test]
fn transport_failure_retries_when_approved() {
    let fixture = Fixture::new();
    let mut task = fixture.task(config_with(|_| {}));
    let mut host = HostSpy::new();

    task.start("anything", Vec::new(), &mut host);
    stream(&mut task, &mut host, "Partial narration ");
    task.on_run_event(
        RunEvent::Failed {
            run_id: 1,
            failure: RunFailure::transport("connection reset"),
        },
        &mut host,
    );
    assert_eq!(host.last_approval().kind, ApprovalKind::RetryAfterFailure);
    assert!(host.last_approval().message.contains("connection reset"));

    task.on_approval_response(ApprovalResponse::approved(), &mut host);

    assert_eq!(host.started.len(), 2);
    assert_eq!(host.started[1].1, host.started[0].1);
    assert!(task.state().buffer.is_empty());
}

#[test]
fn auto_approval_cap_forces_a_human_decision() {
    let fixture = Fixture::new();
    fixture.write("a.txt", "alpha\n");
    let mut task = fixture.task(config_with(|config| {
        config.auto_approval.read_files = true;
        config.auto_approval.max_consecutive_auto_approvals = 2;
    }));
    let mut host = HostSpy::new();

    task.start("read a lot", Vec::new(), &mut host);
    reply(&mut task, &mut host, &read_call("a.txt"));
    reply(&mut task, &mut host, &read_call("a.txt"));
    assert!(host.approvals.is_empty());
    assert_eq!(task.state().consecutive_auto_approvals, 2);

    reply(&mut task, &mut host, &read_call("a.txt"));
    assert_eq!(host.approvals.len(), 1);
    assert_eq!(host.last_approval().kind, ApprovalKind::Action);

    task.on_approval_response(ApprovalResponse::approved(), &mut host);
    assert_eq!(task.state().consecutive_auto_approvals, 0);
    assert_eq!(host.started.len(), 4);
    assert!(host.last_user_input().contains("Result:\nalpha"));
}

#[test]
fn command_auto_approval_respects_requires_approval() {
    let fixture = Fixture::new();
    let mut task = fixture.task(config_with(|config| {
        config.auto_approval.execute_safe_commands = true;
    }));
    let mut host = HostSpy::new();

    task.start("run things", Vec::new(), &mut host);
    reply(
        &mut task,
        &mut host,
        &call(
            "execute_command",
            &[("command", "echo safe"), ("requires_approval", "false")],
        ),
    );
    assert!(host.approvals.is_empty());
    assert!(host.last_user_input().contains("safe"));

    reply(
        &mut task,
        &mut host,
        &call(
            "execute_command",
            &[("command", "echo risky"), ("requires_approval", "true")],
        ),
    );
    assert_eq!(host.approvals.len(), 1);
}

#[test]
fn followup_answer_becomes_the_action_result() {
    let fixture = Fixture::new();
    let mut task = fixture.task(config_with(|_| {}));
    let mut host = HostSpy::new();

    task.start("format the file", Vec::new(), &mut host);
    reply(
        &mut task,
        &mut host,
        &call(
            "ask_followup_question",
            &[("question", "Tabs or spaces?"), ("options", r#"["tabs", "spaces"]"#)],
        ),
    );

    let approval = host.last_approval().clone();
    assert_eq!(approval.kind, ApprovalKind::Followup);
    assert_eq!(approval.message, "Tabs or spaces?");
    assert_eq!(approval.options, vec!["tabs".to_string(), "spaces".to_string()]);

    task.on_approval_response(ApprovalResponse::message("spaces"), &mut host);

    assert_eq!(host.started.len(), 2);
    assert_eq!(
        host.last_user_input(),
        "[ask_followup_question] Result:\n<answer>\nspaces\n</answer>"
    );
    assert_eq!(task.state().consecutive_mistakes, 0);
}

#[test]
fn accepted_completion_completes_the_task() {
    let fixture = Fixture::new();
    let mut task = fixture.task(config_with(|_| {}));
    let mut host = HostSpy::new();

    task.start("finish", Vec::new(), &mut host);
    let response = format!(
        "All done.\n{}Extra words after completion.",
        call("attempt_completion", &[("result", "Renamed the function.")])
    );
    reply(&mut task, &mut host, &response);

    assert_eq!(host.cancelled_runs, vec![1]);
    assert_eq!(host.last_approval().kind, ApprovalKind::Completion);
    assert_eq!(host.last_approval().message, "Renamed the function.");
    assert_eq!(host.started.len(), 1);

    task.on_approval_response(ApprovalResponse::approved(), &mut host);

    assert_eq!(task.phase(), TaskPhase::Completed);
    assert_eq!(host.started.len(), 1);
    assert!(fixture.checkpoint_count() >= 1);
}

#[test]
fn completion_feedback_starts_another_turn() {
    let fixture = Fixture::new();
    let mut task = fixture.task(config_with(|_| {}));
    let mut host = HostSpy::new();

    task.start("finish", Vec::new(), &mut host);
    reply(
        &mut task,
        &mut host,
        &call("attempt_completion", &[("result", "Done.")]),
    );
    task.on_approval_response(ApprovalResponse::message("also update the docs"), &mut host);

    assert_eq!(host.started.len(), 2);
    let input = host.last_user_input();
    assert!(input.starts_with("The user has provided feedback on the results."), "{input}");
    assert!(input.contains("<feedback>\nalso update the docs\n</feedback>"), "{input}");
    assert_matches!(task.phase(), TaskPhase::Streaming(_));
}

#[test]
fn resume_restores_history_and_announces_the_interruption() {
    let fixture = Fixture::new();
    {
        let mut task = fixture.task(config_with(|_| {}));
        let mut host = HostSpy::new();
        task.start("long task", Vec::new(), &mut host);
        stream(&mut task, &mut host, "Half way ");
        task.cancel(&mut host);
    }

    let mut task = Task::resume(fixture.context(config_with(|_| {}))).expect("resume task");
    let mut host = HostSpy::new();
    task.resume_turn(&mut host);

    let messages = &host.started[0].1;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].text(), "<task>\nlong task\n</task>");
    assert_eq!(messages[1].text(), "Half way ");
    assert!(messages[2].text().starts_with("[TASK RESUMPTION]"));
}

#[test]
fn resume_without_checkpoint_fails() {
    let fixture = Fixture::new();
    let error = match Task::resume(fixture.context(config_with(|_| {}))) {
        Ok(_) => panic!("resume should fail without a checkpoint"),
        Err(error) => error,
    };
    assert!(error.to_string().contains("no checkpoint found"), "{error}");
}

#[test]
fn resume_after_a_crash_keeps_writing_checkpoints() {
    let fixture = Fixture::new();
    let root = fixture.dir.path().join("checkpoints");
    let open_store = || {
        FileCheckpointStore::open(&root, fixture.dir.path()).expect("open checkpoint store")
    };
    {
        let mut task = Task::new(fixture.context_with_store(
            config_with(|_| {}),
            Box::new(open_store()),
        ))
        .expect("task should build");
        let mut host = HostSpy::new();
        task.start("long task", Vec::new(), &mut host);
        stream(&mut task, &mut host, "Half way ");
        task.cancel(&mut host);
    }
    fs::write(root.join(lock_file_name(TASK_ID)), "4194303\n").expect("stale lock file");
    let saved = open_store().history(TASK_ID).expect("history").len();

    let mut task = Task::resume(
        fixture.context_with_store(config_with(|_| {}), Box::new(open_store())),
    )
    .expect("resume task");
    let mut host = HostSpy::new();
    task.resume_turn(&mut host);
    task.cancel(&mut host);

    assert!(open_store().history(TASK_ID).expect("history").len() > saved);
}

#[test]
fn contended_checkpoint_stream_fails_task_setup() {
    let fixture = Fixture::new();
    let root = fixture.dir.path().join("checkpoints");
    let mut holder = FileCheckpointStore::open(&root, fixture.dir.path()).expect("open holder");
    holder.claim(TASK_ID).expect("holder claims the task");

    let store = FileCheckpointStore::open(&root, fixture.dir.path()).expect("open second store");
    let error = match Task::new(fixture.context_with_store(config_with(|_| {}), Box::new(store)))
    {
        Ok(_) => panic!("a second writer should not build"),
        Err(error) => error,
    };

    assert_matches!(
        error,
        TaskSetupError::Store(CheckpointStoreError::LockContended { .. })
    );
}

#[test]
fn streaming_edit_is_previewed_before_approval() {
    let fixture = Fixture::new();
    fixture.write("f.txt", "a\nb\nc\n");
    let mut task = fixture.task(config_with(|_| {}));
    let mut host = HostSpy::new();

    task.start("edit", Vec::new(), &mut host);
    stream(
        &mut task,
        &mut host,
        "<calls>\n<call name=\"replace_in_file\">\n<param name=\"path\">f.txt</param>\n<param name=\"diff\">\n------- SEARCH\nb\n=======\nB\n",
    );

    let ops = fixture.surface.ops();
    assert_matches!(ops.first(), Some(SurfaceOp::Open { path, .. }) if path == "f.txt");
    assert!(ops
        .iter()
        .any(|op| matches!(op, SurfaceOp::Replace { text, .. } if text.contains('B'))));
    assert!(host.approvals.is_empty());

    stream(&mut task, &mut host, "+++++++ REPLACE\n</param>\n</call>\n</calls>\n");
    finish(&mut task, &mut host, 1);

    assert_eq!(
        host.last_approval().preview.as_ref().map(|preview| preview.proposed.as_str()),
        Some("a\nB\nc\n")
    );
    let shown = fixture.surface.ops().into_iter().rev().find_map(|op| match op {
        SurfaceOp::Replace { text, .. } => Some(text),
        _ => None,
    });
    assert_eq!(shown.as_deref(), Some("a\nB\nc\n"));
    assert_eq!(fixture.surface.open_views().len(), 1);

    task.on_approval_response(ApprovalResponse::rejected(), &mut host);
    assert!(fixture.surface.open_views().is_empty());
    assert_eq!(fixture.read("f.txt").as_deref(), Some("a\nb\nc\n"));
}
