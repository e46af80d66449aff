use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::Context;
use reconcile_engine::{apply_diff, describe_mismatch, ReconcileError};

fn main() {
    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: reconcile <file> [diff-file]   (reads the diff from stdin when omitted)");
        std::process::exit(2);
    };

    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let result = read_diff(args.next().as_deref())
        .and_then(|diff| reconcile_file(Path::new(&path), &diff, &mut stdout, &mut stderr));

    if let Err(error) = result {
        let _ = writeln!(stderr, "{error:#}");
        std::process::exit(1);
    }
}

fn read_diff(source: Option<&str>) -> anyhow::Result<String> {
    match source {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("failed to read diff {path}"))
        }
        None => {
            let mut diff = String::new();
            io::stdin()
                .read_to_string(&mut diff)
                .context("failed to read diff from stdin")?;
            Ok(diff)
        }
    }
}

/// Applies `diff` to the file at `path`, creating it for a new-file diff.
fn reconcile_file(
    path: &Path,
    diff: &str,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> anyhow::Result<()> {
    let original = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) if error.kind() == io::ErrorKind::NotFound => String::new(),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read {}", path.display()))
        }
    };

    let reconciliation = match apply_diff(&original, diff) {
        Ok(reconciliation) => reconciliation,
        Err(error) => {
            if let ReconcileError::NoMatch { search, .. } = &error {
                writeln!(stderr, "{}", describe_mismatch(&original, search))?;
            }
            return Err(error.into());
        }
    };

    std::fs::write(path, &reconciliation.content)
        .with_context(|| format!("failed to write {}", path.display()))?;

    for matched in &reconciliation.matches {
        writeln!(
            stdout,
            "fragment {}: {} (lines {}-{})",
            matched.index,
            matched.strategy,
            matched.original_lines.start + 1,
            matched.original_lines.end
        )?;
    }
    Ok(())
}
