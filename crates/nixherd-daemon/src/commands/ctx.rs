//! `ctx` — repository context commands.

use super::{CommandContext, CtxAction, ExecResult, HYDRATE_BUDGET};

pub(super) async fn run(ctx: &CommandContext, action: Option<CtxAction>) -> ExecResult {
    match action {
        None => show(ctx),
        Some(CtxAction::Add { url }) => add(ctx, &url),
        Some(CtxAction::Update) => update(ctx).await,
    }
}

/// Print the active repository and a hint. Exits 0 whether or not one is set.
fn show(ctx: &CommandContext) -> ExecResult {
    let active = match ctx.registry.get_active() {
        Ok(active) => active,
        Err(err) => return ExecResult::failure(String::new(), err),
    };

    let stdout = match active {
        Some(repo) => format!(
            "{}\n\n\
             Next step is to run an output from the repo that was set\n\
             List the available packages with:\n  nixherd pks\n",
            repo.url
        ),
        None => "No repository set\n\n\
                 To set a repository:\n  nixherd ctx add <url>\n"
            .to_string(),
    };
    ExecResult::success(stdout)
}

fn add(ctx: &CommandContext, url: &str) -> ExecResult {
    match ctx.registry.add(url) {
        Ok(repo) => ExecResult::success(format!("Added repository {}\n", repo.url)),
        Err(err) => ExecResult::failure(String::new(), err),
    }
}

/// Rebuild every package of the active repository. A report with per-target
/// failures still exits 0; only conditions that preclude any materialization
/// (no active repository, enumerate failure) exit 1.
async fn update(ctx: &CommandContext) -> ExecResult {
    let mut out = String::new();

    let active = match ctx.registry.get_active() {
        Ok(Some(repo)) => repo,
        Ok(None) => {
            return ExecResult::failure(
                out,
                "no repository set. Use 'nixherd ctx add' to set a repository",
            )
        }
        Err(err) => return ExecResult::failure(out, err),
    };
    out.push_str(&format!("→ Found active repository: {}\n", active.url));

    let report = match ctx
        .materializer
        .materialize_with_timeout(&active.url, HYDRATE_BUDGET)
        .await
    {
        Ok(report) => report,
        Err(err) => return ExecResult::failure(out, err),
    };

    if !report.succeeded.is_empty() {
        out.push_str("\n✓ Successfully built packages:\n");
        for key in &report.succeeded {
            out.push_str(&format!("  • {key}\n"));
        }
    }
    if !report.failed.is_empty() {
        out.push_str("\n✗ Failed to build packages:\n");
        for (key, err) in &report.failed {
            out.push_str(&format!("  • {key}: {err}\n"));
        }
    }
    if report.is_clean() {
        out.push_str("\n✓ All packages built successfully!\n");
    }

    ExecResult::success(out)
}
