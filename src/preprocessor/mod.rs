// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Source-rewriting pass for direct `onmessage` assignment.
//!
//! A host callback can only observe guest behavior that goes through an
//! explicit function call. `x.addEventListener("message", fn)` is such a
//! call, but the equally-legal `x.onmessage = fn` is a bare property
//! assignment and invisible to the host. This pass scans client-supplied
//! scripts for the textual pattern `<identifier>.onmessage`, finds the end
//! of the enclosing statement by brace counting, and appends a
//! `__registerAssignedHandler(<identifier>)` bridge call there, which
//! registers the assigned handler exactly as `addEventListener` would.
//!
//! The rewrite is best-effort and intentionally isolated behind that single
//! bridge function so a guest runtime with native property-setter
//! interception can bypass it entirely. Scripts embedded verbatim by a
//! parent sandbox for nested workers are never rewritten.

/// Name of the bridge function the rewrite appends calls to. Defined by the
/// sandbox shim.
pub const REGISTER_ASSIGNED_HANDLER: &str = "__registerAssignedHandler";

/// Rewrites `script` so that direct `onmessage` assignments become
/// observable to the host.
///
/// The scan is line-based: on a `<identifier>.onmessage` match the brace
/// balance is counted from the matched line inclusive until it returns to
/// zero, which is the end of the enclosing statement even when the assigned
/// function body contains nested braces. The registration call is appended
/// immediately after that point.
pub fn analyze_script(script: &str) -> String {
    let mut lines: Vec<String> = script.lines().map(str::to_owned).collect();

    let mut i = 0;
    while i < lines.len() {
        let Some(identifier) = assignment_target(&lines[i]) else {
            i += 1;
            continue;
        };

        // Find the end of the enclosing statement. The counter starts at the
        // assignment line inclusive, so nested braces inside the handler
        // body cannot terminate the scan early.
        let mut depth: i64 = 0;
        let mut j = i;
        loop {
            for ch in lines[j].chars() {
                match ch {
                    '{' => depth += 1,
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            if depth <= 0 || j + 1 >= lines.len() {
                break;
            }
            j += 1;
        }

        lines[j].push_str(&format!(
            "\n{}({});",
            REGISTER_ASSIGNED_HANDLER, identifier
        ));

        i = j + 1;
    }

    let mut output = String::new();
    for line in &lines {
        output.push_str(line);
        output.push('\n');
    }
    output
}

/// Extracts the identifier preceding `.onmessage` on `line`, if any.
///
/// The identifier is the maximal run of `[A-Za-z0-9_$]` immediately before
/// the dot; lines like `// x.onmessage` still match (the pass is textual,
/// like the rest of the rewrite), but an empty identifier does not.
fn assignment_target(line: &str) -> Option<String> {
    let pos = line.find(".onmessage")?;
    let head = &line[..pos];
    let identifier: String = head
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '$')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    if identifier.is_empty() {
        None
    } else {
        Some(identifier)
    }
}
