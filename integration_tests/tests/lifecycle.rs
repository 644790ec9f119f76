use std::{path::PathBuf, sync::Arc, time::Duration};

use debugger::{
    DebugError, NO_FILE_SCRIPT_PATH, RunState, SessionEvent, SourceBreakpoint, TakeError,
    engine::{RunOutcome, ScriptSource},
    testing::{PANIC_COMMAND, Program, ScriptedEngine, ShadowWorkspace, Stmt, WAIT_DEBUGGER_COMMAND, fixtures},
};
use integration_tests::{EVENT_TIMEOUT, SessionTestHarness};

// test suite "constructor"
#[ctor::ctor]
fn init() {
    integration_tests::init();
}

fn greeting_script() -> PathBuf {
    PathBuf::from("/work/Greeting.ps1")
}

fn greeting_program() -> Program {
    Program::new(vec![
        Stmt::assign(1, "$x", "1"),
        Stmt::call(2, "Get-Greeting", [("$Name", "'World'")]),
        Stmt::assign(3, "$x", "2"),
        Stmt::command(4, "Write-Host"),
    ])
    .with_function(
        "Get-Greeting",
        vec![
            Stmt::assign(10, "$greeting", "'Hello ' + $Name"),
            Stmt::assign(11, "$greeting", "$greeting + '!'"),
        ],
    )
}

fn stopped_at_call() -> eyre::Result<SessionTestHarness> {
    let harness = SessionTestHarness::new(
        ScriptedEngine::new().with_script(greeting_script(), greeting_program()),
    )?;
    harness.session().set_line_breakpoints(
        greeting_script(),
        &[SourceBreakpoint::at(2)],
        harness.cancel(),
    )?;
    let _execution = harness.run(greeting_script())?;
    assert_eq!(harness.wait_for_stop()?.line, 2);
    Ok(harness)
}

fn endless_harness() -> eyre::Result<(SessionTestHarness, PathBuf)> {
    let script = PathBuf::from("/work/Endless.ps1");
    let harness = SessionTestHarness::new(
        ScriptedEngine::new().with_script(&script, fixtures::endless_program()),
    )?;
    Ok((harness, script))
}

#[test]
fn step_in_enters_the_called_function() -> eyre::Result<()> {
    let harness = stopped_at_call()?;
    harness.session().step_in()?;

    let stop = harness.wait_for_stop()?;
    assert_eq!(stop.line, 10);
    assert!(stop.breakpoints.is_empty());

    let frames = harness.session().get_stack_frames()?;
    let chain: Vec<_> = frames
        .iter()
        .map(|f| (f.function_name.as_str(), f.line))
        .collect();
    assert_eq!(chain, vec![("Get-Greeting", 10), ("<ScriptBlock>", 2)]);

    let name = harness.variable(frames[0].scopes.auto, "$Name")?;
    assert_eq!(name.value, "\"World\"");
    Ok(())
}

#[test]
fn step_over_and_step_out() -> eyre::Result<()> {
    let harness = stopped_at_call()?;

    harness.session().step_in()?;
    assert_eq!(harness.wait_for_stop()?.line, 10);

    harness.session().step_over()?;
    assert_eq!(harness.wait_for_stop()?.line, 11);

    harness.session().step_out()?;
    let stop = harness.wait_for_stop()?;
    assert_eq!(stop.line, 3);
    assert_eq!(harness.session().get_stack_frames()?.len(), 1);
    Ok(())
}

#[test]
fn step_over_runs_a_call_without_stopping_inside() -> eyre::Result<()> {
    let harness = stopped_at_call()?;
    harness.session().step_over()?;
    let stop = harness.wait_for_stop()?;
    assert_eq!(stop.line, 3);
    Ok(())
}

#[test]
fn resuming_requires_a_stop() -> eyre::Result<()> {
    let (harness, script) = endless_harness()?;
    let execution = harness.run(&script)?;

    for result in [
        harness.session().continue_execution(),
        harness.session().step_over(),
        harness.session().step_in(),
        harness.session().step_out(),
    ] {
        assert!(matches!(
            result,
            Err(DebugError::InvalidState {
                state: RunState::Running,
                ..
            })
        ));
    }

    assert!(matches!(
        harness.session().execute(ScriptSource::file(script.clone())),
        Err(DebugError::InvalidState { .. })
    ));

    harness.session().abort()?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Aborted);
    Ok(())
}

#[test]
fn break_halts_a_running_script() -> eyre::Result<()> {
    let (mut harness, script) = endless_harness()?;

    // nothing to break while idle
    assert!(matches!(
        harness.session().break_execution(),
        Err(DebugError::InvalidState { .. })
    ));

    let execution = harness.run(&script)?;
    harness.session().break_execution()?;
    let stop = harness.wait_for_stop()?;
    assert!(stop.breakpoints.is_empty());
    assert!((1..=3).contains(&stop.line));
    assert_eq!(harness.session().run_state(), RunState::Stopped);
    assert_eq!(harness.top_frame()?.line, stop.line);
    harness.wait_for_event("stopped event", SessionEvent::is_stopped);

    harness.session().continue_execution()?;
    harness.session().abort()?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Aborted);
    harness.wait_for_event("terminated event", |e| {
        matches!(e, SessionEvent::Terminated)
    });
    assert_eq!(harness.session().run_state(), RunState::Terminated);
    Ok(())
}

#[test]
fn abort_while_stopped_terminates() -> eyre::Result<()> {
    let mut harness = stopped_at_call()?;
    harness.session().abort()?;
    harness.wait_for_event("execution completed event", |e| {
        matches!(e, SessionEvent::ExecutionCompleted(RunOutcome::Aborted))
    });
    harness.wait_for_event("terminated event", |e| {
        matches!(e, SessionEvent::Terminated)
    });

    assert_eq!(harness.session().run_state(), RunState::Terminated);
    assert!(matches!(
        harness.session().continue_execution(),
        Err(DebugError::Terminated)
    ));
    assert!(matches!(
        harness.session().set_line_breakpoints(greeting_script(), &[], harness.cancel()),
        Err(DebugError::Terminated)
    ));
    assert_eq!(
        harness.session().wait_for_stop(Duration::from_millis(50), harness.cancel()),
        Err(TakeError::Closed)
    );
    Ok(())
}

#[test]
fn completed_script_leaves_the_session_usable() -> eyre::Result<()> {
    let mut harness = SessionTestHarness::new(
        ScriptedEngine::new().with_script(greeting_script(), greeting_program()),
    )?;

    let execution = harness.run(greeting_script())?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Completed);
    harness.wait_for_event("execution completed event", |e| {
        matches!(e, SessionEvent::ExecutionCompleted(RunOutcome::Completed))
    });
    assert_eq!(harness.session().run_state(), RunState::Running);

    let execution = harness.run("/work/Missing.ps1")?;
    assert!(matches!(harness.finish(&execution)?, RunOutcome::Failed(_)));

    harness.session().set_line_breakpoints(
        greeting_script(),
        &[SourceBreakpoint::at(4)],
        harness.cancel(),
    )?;
    let _execution = harness.run(greeting_script())?;
    assert_eq!(harness.wait_for_stop()?.line, 4);
    Ok(())
}

#[test]
fn wait_debugger_command_halts() -> eyre::Result<()> {
    let script = PathBuf::from("/work/Wait.ps1");
    let program = Program::new(vec![
        Stmt::assign(1, "$a", "1"),
        Stmt::command(2, WAIT_DEBUGGER_COMMAND),
        Stmt::assign(3, "$a", "2"),
    ]);
    let harness = SessionTestHarness::new(ScriptedEngine::new().with_script(&script, program))?;
    let execution = harness.run(&script)?;

    let stop = harness.wait_for_stop()?;
    assert_eq!(stop.line, 3);
    harness.session().continue_execution()?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Completed);
    Ok(())
}

#[test]
fn inline_commands_report_no_file() -> eyre::Result<()> {
    let program = Program::new(vec![
        Stmt::command(1, WAIT_DEBUGGER_COMMAND),
        Stmt::assign(2, "$y", "1"),
    ]);
    let harness =
        SessionTestHarness::new(ScriptedEngine::new().with_inline("Invoke-Thing", program))?;
    let execution = harness
        .session()
        .execute(ScriptSource::Inline("Invoke-Thing".to_string()))?;

    let stop = harness.wait_for_stop()?;
    assert_eq!(stop.script_path, PathBuf::from(NO_FILE_SCRIPT_PATH));
    assert_eq!(stop.remote_script_path, None);
    assert_eq!(
        harness.top_frame()?.script_path,
        PathBuf::from(NO_FILE_SCRIPT_PATH)
    );

    harness.session().continue_execution()?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Completed);
    Ok(())
}

#[test]
fn remote_scripts_map_to_local_shadow_copies() -> eyre::Result<()> {
    let remote = PathBuf::from("/remote/home/Test.ps1");
    let local = PathBuf::from("/tmp/shadow/Test.ps1");
    let program = Program::new(vec![
        Stmt::command(1, WAIT_DEBUGGER_COMMAND),
        Stmt::assign(2, "$y", "1"),
    ]);
    let workspace = ShadowWorkspace::new().with_shadow(&remote, &local);
    let harness = SessionTestHarness::with_workspace(
        ScriptedEngine::new().with_remote_script(&remote, program),
        Arc::new(workspace),
    )?;
    let execution = harness.run(&remote)?;

    let stop = harness.wait_for_stop()?;
    assert!(stop.is_remote_session);
    assert_eq!(stop.script_path, local);
    assert_eq!(stop.remote_script_path, Some(remote));
    assert_eq!(harness.top_frame()?.script_path, local);

    harness.session().continue_execution()?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Completed);
    Ok(())
}

#[test]
fn engine_crash_terminates_the_session() -> eyre::Result<()> {
    let script = PathBuf::from("/work/Crash.ps1");
    let program = Program::new(vec![Stmt::command(1, PANIC_COMMAND)]);
    let mut harness = SessionTestHarness::new(ScriptedEngine::new().with_script(&script, program))?;
    let execution = harness.run(&script)?;

    harness.wait_for_event("terminated event", |e| {
        matches!(e, SessionEvent::Terminated)
    });
    assert_eq!(harness.session().run_state(), RunState::Terminated);
    assert!(matches!(
        execution.wait(EVENT_TIMEOUT, harness.cancel()),
        Err(DebugError::EngineTerminated)
    ));
    let err = harness
        .session()
        .remove_all_breakpoints(harness.cancel())
        .unwrap_err();
    assert_eq!(err, DebugError::Terminated);
    assert!(err.is_fatal());
    Ok(())
}

#[test]
fn disconnect_while_stopped() -> eyre::Result<()> {
    let mut harness = stopped_at_call()?;
    harness.session().disconnect()?;

    harness.wait_for_event("terminated event", |e| {
        matches!(e, SessionEvent::Terminated)
    });
    assert_eq!(harness.session().run_state(), RunState::Terminated);
    assert!(matches!(
        harness.session().execute(ScriptSource::file(greeting_script())),
        Err(DebugError::Terminated)
    ));
    // a second disconnect is harmless
    harness.session().disconnect()?;
    Ok(())
}

#[test]
fn cancelled_waits_return_promptly() -> eyre::Result<()> {
    let (harness, _) = endless_harness()?;
    let cancel = harness.cancel().child_token();
    cancel.cancel();
    assert_eq!(
        harness.session().wait_for_stop(EVENT_TIMEOUT, &cancel),
        Err(TakeError::Cancelled)
    );
    assert_eq!(
        harness
            .session()
            .wait_for_stop(Duration::from_millis(20), harness.cancel()),
        Err(TakeError::Timeout)
    );
    Ok(())
}
