use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use reconcile_engine::{
    apply_diff, parse_fragments, reconcile, EditFragment, MatchStrategy, ReconcileError,
    Reconciler,
};

fn fragment(search: &str, replace: &str) -> EditFragment {
    EditFragment::new(search, replace)
}

#[test]
fn indented_line_falls_back_to_line_trimmed_match() {
    let result = reconcile("foo\n  bar\n", &[fragment("bar", "baz")], true).expect("reconcile");

    assert_eq!(result.content, "foo\n  baz\n");
    assert_eq!(result.matches[0].strategy, MatchStrategy::LineTrimmed);
}

#[test]
fn exact_match_is_preferred_when_available() {
    let result = reconcile(
        "fn main() {\n    run();\n}\n",
        &[fragment("    run();\n", "    run_all();\n")],
        true,
    )
    .expect("reconcile");

    assert_eq!(result.content, "fn main() {\n    run_all();\n}\n");
    assert_eq!(result.matches[0].strategy, MatchStrategy::Exact);
}

#[test]
fn block_anchor_is_the_last_resort() {
    let original = "if ready {\n    start();\n    log();\n}\n";
    let search = "if ready {\n    begin();\n    log();\n}\n";
    let result = reconcile(original, &[fragment(search, "go();\n")], true).expect("reconcile");

    assert_eq!(result.content, "go();\n");
    assert_eq!(result.matches[0].strategy, MatchStrategy::BlockAnchor);
}

#[test]
fn empty_first_search_writes_a_new_file() {
    let result = reconcile("stale\n", &[fragment("", "fresh\n")], true).expect("reconcile");

    assert_eq!(result.content, "fresh\n");
    assert_eq!(result.matches[0].strategy, MatchStrategy::NewFile);
}

#[test]
fn blank_line_search_edits_in_place_instead_of_rewriting() {
    let result = reconcile("keep me\n\nand me\n", &[fragment("\n", "X\n")], true)
        .expect("reconcile");

    assert_eq!(result.content, "keep me\nX\nand me\n");
    assert_eq!(result.matches[0].strategy, MatchStrategy::Exact);
}

#[test]
fn whitespace_only_search_without_a_blank_line_does_not_match() {
    let error = reconcile("a\nb\n", &[fragment("  \n", "X\n")], true).expect_err("no match");

    assert_matches!(error, ReconcileError::NoMatch { index: 0, .. });
}

#[test]
fn empty_search_after_the_first_fragment_is_rejected() {
    let error = reconcile(
        "a\nb\n",
        &[fragment("a\n", "x\n"), fragment("", "y\n")],
        true,
    )
    .expect_err("empty search");

    assert_eq!(error, ReconcileError::EmptySearch { index: 1 });
}

#[test]
fn fragments_out_of_file_order_report_order_violation() {
    let error = reconcile(
        "one\ntwo\nthree\n",
        &[fragment("three\n", "3\n"), fragment("one\n", "1\n")],
        true,
    )
    .expect_err("out of order");

    assert_eq!(
        error,
        ReconcileError::OrderViolation {
            index: 1,
            found_line: 1,
            cursor_line: 4,
        }
    );
    assert!(error.to_string().contains("line 1"));
}

#[test]
fn missing_search_text_reports_every_attempted_strategy() {
    let error = reconcile("a\n", &[fragment("nowhere\n", "x\n")], true).expect_err("no match");

    assert_matches!(
        &error,
        ReconcileError::NoMatch { index: 0, attempted, search }
            if attempted.len() == 3 && search == "nowhere\n"
    );
    assert!(error
        .to_string()
        .contains("exact, line-trimmed, block-anchor"));
}

#[test]
fn repeated_reconciliation_is_byte_identical() {
    let original = "alpha\n  beta\ngamma\n";
    let fragments = [fragment("beta", "BETA"), fragment("gamma\n", "GAMMA\n")];

    let first = reconcile(original, &fragments, true).expect("first");
    let second = reconcile(original, &fragments, true).expect("second");

    assert_eq!(first, second);
}

#[test]
fn streaming_updates_converge_on_the_final_content() {
    let original = "a\nb\nc\nd\n";
    let diff = "------- SEARCH\nb\n=======\nB\n+++++++ REPLACE\n------- SEARCH\nd\n=======\nD1\nD2\n+++++++ REPLACE\n";
    let mut reconciler = Reconciler::new(original);
    let mut previews = Vec::new();

    for end in 1..=diff.len() {
        let fragments = parse_fragments(&diff[..end]).expect("prefix parses");
        let update = reconciler
            .update(&fragments, false)
            .expect("streaming update");
        previews.push(update.content);
    }

    let fragments = parse_fragments(diff).expect("diff parses");
    let final_update = reconciler.update(&fragments, true).expect("final update");

    assert_eq!(final_update.content, "a\nB\nc\nD1\nD2\n");
    assert_eq!(final_update.confirmed.len(), 2);
    assert_eq!(previews.first().map(String::as_str), Some(original));
    assert!(previews.iter().any(|preview| preview == "a\nB\nc\nd\n"));
}

#[test]
fn provisional_edit_reports_output_lines() {
    let mut reconciler = Reconciler::new("x\ny\nz\n");
    let fragments = parse_fragments("------- SEARCH\ny\n=======\nY1\nY2\n").expect("prefix");

    let update = reconciler.update(&fragments, false).expect("update");
    let provisional = update.provisional.expect("provisional edit");

    assert_eq!(update.content, "x\nY1\nY2\nz\n");
    assert!(update.confirmed.is_empty());
    assert_eq!(provisional.original_lines, 1..2);
    assert_eq!(provisional.output_lines, 1..3);
}

#[test]
fn apply_diff_surfaces_parse_errors() {
    let error = apply_diff("a\n", "=======\n").expect_err("stray separator");

    assert_matches!(error, ReconcileError::Parse(_));
    assert!(error.to_string().contains("line 1"));
}

#[test]
fn apply_diff_handles_multiple_blocks() {
    let diff = "------- SEARCH\nuse a;\n=======\nuse a;\nuse b;\n+++++++ REPLACE\n\n------- SEARCH\nfn f() {}\n=======\nfn f() { b(); }\n+++++++ REPLACE\n";
    let result = apply_diff("use a;\n\nfn f() {}\n", diff).expect("apply");

    assert_eq!(result.content, "use a;\nuse b;\n\nfn f() { b(); }\n");
    assert_eq!(result.matches[1].original_lines, 2..3);
    assert_eq!(result.matches[1].output_lines, 3..4);
}
