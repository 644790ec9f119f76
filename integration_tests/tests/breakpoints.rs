use std::path::PathBuf;

use debugger::{
    CommandBreakpoint, SourceBreakpoint,
    engine::RunOutcome,
    testing::{
        Program, ScriptedEngine, Stmt,
        fixtures::{self, LOOP_DOUBLE_LINE, LOOP_STRING_LINE},
    },
};
use eyre::WrapErr;
use integration_tests::SessionTestHarness;

// test suite "constructor"
#[ctor::ctor]
fn init() {
    integration_tests::init();
}

fn loop_script() -> PathBuf {
    PathBuf::from("/work/DebugTest.ps1")
}

fn loop_harness() -> eyre::Result<SessionTestHarness> {
    SessionTestHarness::new(ScriptedEngine::new().with_script(loop_script(), fixtures::loop_program(25)))
}

/// Value of `$i` at the current stop
fn current_i(harness: &SessionTestHarness) -> eyre::Result<String> {
    Ok(harness
        .session()
        .evaluate("$i", 0, harness.cancel())
        .wrap_err("evaluating $i")?
        .value)
}

#[test]
fn line_breakpoint_stops_and_reports_the_hit() -> eyre::Result<()> {
    let harness = loop_harness()?;
    let set = harness.session().set_line_breakpoints(
        loop_script(),
        &[SourceBreakpoint::at(LOOP_STRING_LINE)],
        harness.cancel(),
    )?;
    assert_eq!(set.len(), 1);
    assert!(set[0].verified);
    assert!(set[0].id.is_some());

    let execution = harness.run(loop_script())?;
    let stop = harness.wait_for_stop()?;
    assert_eq!(stop.script_path, loop_script());
    assert_eq!(stop.line, LOOP_STRING_LINE);
    assert!(!stop.is_remote_session);
    assert_eq!(stop.breakpoints.len(), 1);
    assert_eq!(stop.breakpoints[0].id, set[0].id);
    assert_eq!(current_i(&harness)?, "1");

    harness.session().remove_all_breakpoints(harness.cancel())?;
    harness.session().continue_execution()?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Completed);
    Ok(())
}

#[test]
fn conditional_breakpoint_stops_only_when_true() -> eyre::Result<()> {
    let harness = loop_harness()?;
    let set = harness.session().set_line_breakpoints(
        loop_script(),
        &[SourceBreakpoint::at(LOOP_DOUBLE_LINE).with_condition("$i -eq 10 -or $i -eq 20")],
        harness.cancel(),
    )?;
    assert!(set[0].verified);

    let execution = harness.run(loop_script())?;

    harness.wait_for_stop()?;
    assert_eq!(current_i(&harness)?, "10");
    harness.session().continue_execution()?;

    harness.wait_for_stop()?;
    assert_eq!(current_i(&harness)?, "20");
    harness.session().continue_execution()?;

    assert_eq!(harness.finish(&execution)?, RunOutcome::Completed);
    assert!(harness.session().stops().is_empty());
    Ok(())
}

#[test]
fn hit_count_breakpoint_stops_on_nth_hit() -> eyre::Result<()> {
    let harness = loop_harness()?;
    harness.session().set_line_breakpoints(
        loop_script(),
        &[SourceBreakpoint::at(LOOP_STRING_LINE).with_hit_condition("5")],
        harness.cancel(),
    )?;

    let execution = harness.run(loop_script())?;
    harness.wait_for_stop()?;
    assert_eq!(current_i(&harness)?, "5");
    harness.session().continue_execution()?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Completed);
    Ok(())
}

#[test]
fn hit_count_only_counts_hits_where_condition_holds() -> eyre::Result<()> {
    let harness = loop_harness()?;
    harness.session().set_line_breakpoints(
        loop_script(),
        &[SourceBreakpoint::at(LOOP_STRING_LINE)
            .with_condition("$i % 2 -eq 0")
            .with_hit_condition("5")],
        harness.cancel(),
    )?;

    let execution = harness.run(loop_script())?;
    harness.wait_for_stop()?;
    assert_eq!(current_i(&harness)?, "10");
    harness.session().continue_execution()?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Completed);
    Ok(())
}

#[test]
fn invalid_breakpoints_come_back_unverified() -> eyre::Result<()> {
    let harness = loop_harness()?;
    let set = harness.session().set_line_breakpoints(
        loop_script(),
        &[
            SourceBreakpoint::at(5).with_condition("$i == 100"),
            SourceBreakpoint::at(6).with_condition("$i -ez 100"),
            SourceBreakpoint::at(LOOP_DOUBLE_LINE).with_hit_condition("often"),
        ],
        harness.cancel(),
    )?;

    assert_eq!(set.len(), 3);
    assert!(set.iter().all(|bp| !bp.verified && bp.id.is_none()));

    let messages: Vec<_> = set.iter().filter_map(|bp| bp.message.as_deref()).collect();
    assert_eq!(messages.len(), 3);
    assert!(messages[0].contains("Use '-eq' instead of '=='."));
    assert!(messages[1].contains("Unexpected token '-ez' in expression or statement."));
    assert!(messages[2].contains("'often'"));

    // nothing registered, so the script runs through
    let execution = harness.run(loop_script())?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Completed);
    Ok(())
}

#[test]
fn setting_breakpoints_replaces_the_file_set() -> eyre::Result<()> {
    let harness = loop_harness()?;
    let cancel = harness.cancel();
    harness.session().set_line_breakpoints(
        loop_script(),
        &[SourceBreakpoint::at(1), SourceBreakpoint::at(LOOP_STRING_LINE)],
        cancel,
    )?;
    let set = harness.session().set_line_breakpoints(
        loop_script(),
        &[SourceBreakpoint::at(LOOP_DOUBLE_LINE)],
        cancel,
    )?;
    assert_eq!(set.len(), 1);

    let all = harness.session().breakpoints()?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].line, Some(LOOP_DOUBLE_LINE));

    let execution = harness.run(loop_script())?;
    let stop = harness.wait_for_stop()?;
    assert_eq!(stop.line, LOOP_DOUBLE_LINE);
    harness.session().abort()?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Aborted);
    Ok(())
}

#[test]
fn confirmed_breakpoints_follow_engine_order() -> eyre::Result<()> {
    let harness = loop_harness()?;
    let set = harness.session().set_line_breakpoints(
        loop_script(),
        &[
            SourceBreakpoint::at(LOOP_DOUBLE_LINE),
            SourceBreakpoint::at(3).with_condition("$i = 3"),
            SourceBreakpoint::at(LOOP_STRING_LINE),
        ],
        harness.cancel(),
    )?;

    let lines: Vec<_> = set.iter().map(|bp| (bp.line, bp.verified)).collect();
    assert_eq!(
        lines,
        vec![
            (Some(LOOP_STRING_LINE), true),
            (Some(LOOP_DOUBLE_LINE), true),
            (Some(3), false),
        ]
    );
    Ok(())
}

#[test]
fn command_breakpoints_replace_the_global_set() -> eyre::Result<()> {
    let script = PathBuf::from("/work/Commands.ps1");
    let program = Program::new(vec![
        Stmt::command(1, "Write-Host"),
        Stmt::command(2, "Get-Date"),
        Stmt::command(3, "Get-Host"),
        Stmt::command(4, "Write-Host"),
    ]);
    let harness = SessionTestHarness::new(ScriptedEngine::new().with_script(&script, program))?;
    let cancel = harness.cancel();

    let first = harness.session().set_command_breakpoints(
        &[
            CommandBreakpoint::named("Write-Host"),
            CommandBreakpoint::named("Get-Date"),
        ],
        cancel,
    )?;
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|bp| bp.verified));

    let second = harness
        .session()
        .set_command_breakpoints(&[CommandBreakpoint::named("Get-Host")], cancel)?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].name.as_deref(), Some("Get-Host"));
    assert_eq!(harness.session().breakpoints()?.len(), 1);

    let execution = harness.run(&script)?;
    let stop = harness.wait_for_stop()?;
    assert_eq!(stop.line, 3);
    assert_eq!(stop.breakpoints.len(), 1);
    assert_eq!(stop.breakpoints[0].name.as_deref(), Some("Get-Host"));

    harness.session().continue_execution()?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Completed);
    Ok(())
}

#[test]
fn removing_all_breakpoints_lets_the_script_finish() -> eyre::Result<()> {
    let harness = loop_harness()?;
    let cancel = harness.cancel();
    harness.session().set_line_breakpoints(
        loop_script(),
        &[SourceBreakpoint::at(LOOP_STRING_LINE)],
        cancel,
    )?;
    harness
        .session()
        .set_command_breakpoints(&[CommandBreakpoint::named("Get-Date")], cancel)?;

    harness.session().remove_all_breakpoints(cancel)?;
    assert!(harness.session().breakpoints()?.is_empty());

    let execution = harness.run(loop_script())?;
    assert_eq!(harness.finish(&execution)?, RunOutcome::Completed);
    assert!(harness.session().stops().is_empty());
    Ok(())
}

#[test]
fn breakpoint_dtos_serialize_camel_case() -> eyre::Result<()> {
    let harness = loop_harness()?;
    let set = harness.session().set_line_breakpoints(
        loop_script(),
        &[SourceBreakpoint::at(LOOP_STRING_LINE).with_hit_condition("2")],
        harness.cancel(),
    )?;
    let json = serde_json::to_value(&set[0]).wrap_err("serializing breakpoint")?;
    assert_eq!(json["verified"], true);
    assert_eq!(json["hitCondition"], "2");
    assert_eq!(json["line"], LOOP_STRING_LINE);
    Ok(())
}
